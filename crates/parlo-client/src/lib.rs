//! Client library for the voice-message relay.
//!
//! Implements the client side of the datagram protocol: authenticate, push
//! a voice message as acknowledged chunks, enumerate pending messages, and
//! pull one back. Timing contracts:
//!
//! - authentication waits 5 s for its ACK;
//! - each uploaded chunk waits 2 s for its ACK and is retried 3 times;
//! - a download has a 30 s overall deadline.
//!
//! The client owns one unconnected socket and reads it inline; packets that
//! do not answer the current request (for instance a message relayed while
//! we were uploading) are buffered and surface through
//! [`RelayClient::receive_voice_message`].

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use parlo_proto::{MessageInfo, Packet, PacketType, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};

/// How long authentication waits for its AUTH_ACK.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// How long each uploaded chunk waits for its ACK.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Send attempts per chunk before the upload fails.
pub const SEND_ATTEMPTS: u32 = 3;

/// Overall deadline for a download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a list request waits for its reply.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Proto(#[from] parlo_proto::ProtoError),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("chunk {chunk_index} unacknowledged after {attempts} attempts")]
    AckTimeout { chunk_index: u32, attempts: u32 },

    #[error("server rejected the request: {0}")]
    Rejected(String),

    #[error("malformed message list: {0}")]
    ListParse(#[from] serde_json::Error),

    #[error("incomplete download: {received}/{total} chunks")]
    Incomplete { received: u32, total: u32 },
}

/// A fully reassembled message pushed to us by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedVoice {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub data: Vec<u8>,
}

pub struct RelayClient {
    socket: UdpSocket,
    server_addr: SocketAddr,
    user_id: Option<Uuid>,
    inbox: Vec<Packet>,
}

impl RelayClient {
    /// Bind an ephemeral local socket talking to `server_addr`.
    ///
    /// Binds the loopback interface for loopback servers so the local
    /// address matches the source address the server observes.
    pub async fn connect(server_addr: SocketAddr) -> Result<Self, ClientError> {
        let local_ip: IpAddr = match (server_addr.is_ipv4(), server_addr.ip().is_loopback()) {
            (true, true) => Ipv4Addr::LOCALHOST.into(),
            (true, false) => Ipv4Addr::UNSPECIFIED.into(),
            (false, true) => Ipv6Addr::LOCALHOST.into(),
            (false, false) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind((local_ip, 0)).await?;
        Ok(Self {
            socket,
            server_addr,
            user_id: None,
            inbox: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    /// The underlying socket, for callers that need to speak raw packets.
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Canonical identity learned from AUTH_ACK, once authenticated.
    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    /// Present the bearer token; on success returns the canonical user id
    /// the server derived from it.
    pub async fn authenticate(&mut self, token: &str) -> Result<Uuid, ClientError> {
        let request = Packet::auth(token);
        self.send(&request).await?;

        let ack = self
            .wait_for(AUTH_TIMEOUT, "auth ack", |p| {
                p.packet_type == PacketType::AuthAck && p.message_id == request.message_id
            })
            .await?;

        let user_id = ack.recipient_id;
        self.user_id = Some(user_id);
        debug!(user_id = %user_id, "authenticated");
        Ok(user_id)
    }

    /// Keep the session alive.
    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        let user_id = self.user_id.ok_or(ClientError::NotAuthenticated)?;
        let beat = Packet::heartbeat(user_id);
        self.send(&beat).await?;

        self.wait_for(ACK_TIMEOUT, "heartbeat ack", |p| {
            p.packet_type == PacketType::Ack && p.message_id == beat.message_id
        })
        .await?;
        Ok(())
    }

    /// Upload `data` to `recipient` as acknowledged chunks. Returns the
    /// message id.
    pub async fn send_voice(
        &mut self,
        recipient: Uuid,
        data: &[u8],
    ) -> Result<Uuid, ClientError> {
        let sender = self.user_id.ok_or(ClientError::NotAuthenticated)?;
        let message_id = Uuid::new_v4();

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(MAX_PAYLOAD_SIZE).collect()
        };
        let total_chunks = chunks.len() as u32;

        debug!(message_id = %message_id, total_chunks, size = data.len(), "uploading voice message");

        for (index, chunk) in chunks.into_iter().enumerate() {
            let packet = Packet::voice_data(
                sender,
                recipient,
                message_id,
                index as u32,
                total_chunks,
                chunk.to_vec(),
            );
            self.send_chunk_with_retry(&packet).await?;
        }

        Ok(message_id)
    }

    async fn send_chunk_with_retry(&mut self, packet: &Packet) -> Result<(), ClientError> {
        for attempt in 1..=SEND_ATTEMPTS {
            self.send(packet).await?;

            let acked = self
                .wait_for(ACK_TIMEOUT, "chunk ack", |p| {
                    p.packet_type == PacketType::Ack
                        && p.message_id == packet.message_id
                        && p.chunk_index == packet.chunk_index
                })
                .await;

            match acked {
                Ok(_) => return Ok(()),
                Err(ClientError::Timeout(_)) => {
                    warn!(
                        message_id = %packet.message_id,
                        chunk_index = packet.chunk_index,
                        attempt,
                        "chunk unacknowledged; retrying"
                    );
                }
                Err(other) => return Err(other),
            }
        }

        Err(ClientError::AckTimeout {
            chunk_index: packet.chunk_index,
            attempts: SEND_ATTEMPTS,
        })
    }

    /// Fetch the pending-message list for this user.
    pub async fn list_messages(&mut self) -> Result<Vec<MessageInfo>, ClientError> {
        let user_id = self.user_id.ok_or(ClientError::NotAuthenticated)?;
        let request = Packet::list_messages(user_id);
        self.send(&request).await?;

        let reply = self
            .wait_for(LIST_TIMEOUT, "message list", |p| {
                p.packet_type == PacketType::MessageList
            })
            .await?;

        Ok(serde_json::from_slice(&reply.payload)?)
    }

    /// Pull a stored message back down in chunked form.
    pub async fn download(&mut self, message_id: Uuid) -> Result<Vec<u8>, ClientError> {
        let user_id = self.user_id.ok_or(ClientError::NotAuthenticated)?;
        let request = Packet::download(user_id, message_id);
        self.send(&request).await?;

        let deadline = Instant::now() + DOWNLOAD_TIMEOUT;
        let mut chunks: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        let mut total: Option<u32> = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Incomplete {
                    received: chunks.len() as u32,
                    total: total.unwrap_or(0),
                });
            }

            let packet = self
                .wait_for(remaining, "download chunk", |p| {
                    p.packet_type == PacketType::VoiceData && p.message_id == message_id
                })
                .await
                .map_err(|e| match e {
                    ClientError::Timeout(_) => ClientError::Incomplete {
                        received: chunks.len() as u32,
                        total: total.unwrap_or(0),
                    },
                    other => other,
                })?;

            total = Some(packet.total_chunks);
            chunks.insert(packet.chunk_index, packet.payload);

            if chunks.len() as u32 >= packet.total_chunks {
                let mut data = Vec::new();
                for (_, chunk) in chunks {
                    data.extend_from_slice(&chunk);
                }
                return Ok(data);
            }
        }
    }

    /// Wait for a voice message pushed by the relay (an online forward) and
    /// reassemble it.
    pub async fn receive_voice_message(
        &mut self,
        wait: Duration,
    ) -> Result<ReceivedVoice, ClientError> {
        let deadline = Instant::now() + wait;
        let mut message_id: Option<Uuid> = None;
        let mut sender_id = Uuid::nil();
        let mut total = 0u32;
        let mut chunks: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

        loop {
            // Anything already buffered takes priority over the socket.
            let packet = match self.next_buffered_voice(message_id) {
                Some(packet) => packet,
                None => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ClientError::Incomplete {
                            received: chunks.len() as u32,
                            total,
                        });
                    }
                    self.wait_for(remaining, "relayed voice data", |p| {
                        p.packet_type == PacketType::VoiceData
                            && message_id.map_or(true, |id| p.message_id == id)
                    })
                    .await
                    .map_err(|e| match e {
                        ClientError::Timeout(_) => ClientError::Incomplete {
                            received: chunks.len() as u32,
                            total,
                        },
                        other => other,
                    })?
                }
            };

            message_id = Some(packet.message_id);
            sender_id = packet.sender_id;
            total = packet.total_chunks;
            chunks.insert(packet.chunk_index, packet.payload);

            if total > 0 && chunks.len() as u32 >= total {
                let mut data = Vec::new();
                for (_, chunk) in chunks {
                    data.extend_from_slice(&chunk);
                }
                return Ok(ReceivedVoice {
                    message_id: packet.message_id,
                    sender_id,
                    data,
                });
            }
        }
    }

    fn next_buffered_voice(&mut self, message_id: Option<Uuid>) -> Option<Packet> {
        let position = self.inbox.iter().position(|p| {
            p.packet_type == PacketType::VoiceData
                && message_id.map_or(true, |id| p.message_id == id)
        })?;
        Some(self.inbox.remove(position))
    }

    async fn send(&self, packet: &Packet) -> Result<(), ClientError> {
        let data = packet.encode()?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    /// Read packets until one satisfies `matches` or `wait` elapses.
    ///
    /// ERROR packets abort the wait; unrelated VOICE_DATA is buffered for
    /// [`receive_voice_message`]; everything else is dropped.
    async fn wait_for(
        &mut self,
        wait: Duration,
        what: &'static str,
        matches: impl Fn(&Packet) -> bool,
    ) -> Result<Packet, ClientError> {
        let deadline = Instant::now() + wait;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout(what));
            }

            let received = tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await;
            let (len, _) = match received {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => return Err(ClientError::Io(e)),
                Err(_) => return Err(ClientError::Timeout(what)),
            };

            let packet = match Packet::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(error = %e, "dropping undecodable datagram");
                    continue;
                }
            };

            if matches(&packet) {
                return Ok(packet);
            }

            match packet.packet_type {
                PacketType::Error => {
                    return Err(ClientError::Rejected(
                        String::from_utf8_lossy(&packet.payload).into_owned(),
                    ));
                }
                PacketType::VoiceData => {
                    debug!(message_id = %packet.message_id, "buffering relayed voice chunk");
                    self.inbox.push(packet);
                }
                _ => {
                    debug!(packet_type = ?packet.packet_type, "ignoring unrelated packet");
                }
            }
        }
    }
}
