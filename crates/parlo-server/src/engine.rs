//! The datagram protocol engine.
//!
//! One socket, one receive loop, one spawned task per datagram. Handlers
//! share no in-process state beyond the collaborator handles; all
//! coordination happens in the key/value service, whose atomic counter makes
//! upload-completion detection race-free (exactly one handler observes the
//! final count and owns reassembly).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parlo_auth::TokenService;
use parlo_proto::{MessageInfo, Packet, PacketType, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};
use parlo_session::{SessionError, SessionStore};
use parlo_store::{MessageStatus, VoiceMessage};

use crate::blob_store::BlobStore;
use crate::error::ServerError;
use crate::ledger::MessageLedger;

/// How long shutdown waits for outstanding handlers.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Gap between outbound chunks when relaying a message, so a burst does not
/// overrun the kernel send buffer.
const FORWARD_PACING: Duration = Duration::from_millis(5);

const LIST_DEFAULT_LIMIT: u32 = 50;
const DEFAULT_AUDIO_FORMAT: &str = "opus";

/// The UDP relay server. Owns the socket and the shutdown machinery.
pub struct UdpServer {
    engine: Arc<Engine>,
    shutdown_tx: watch::Sender<bool>,
    done_rx: mpsc::Receiver<()>,
}

struct Engine {
    socket: UdpSocket,
    sessions: SessionStore,
    tokens: TokenService,
    ledger: MessageLedger,
    blobs: BlobStore,
    shutdown: watch::Receiver<bool>,
    // Held by every task through its Arc<Engine>; the paired receiver in
    // UdpServer resolves once the last task (and the server handle) is gone.
    _task_guard: mpsc::Sender<()>,
}

impl UdpServer {
    pub async fn bind(
        addr: &str,
        sessions: SessionStore,
        tokens: TokenService,
        ledger: MessageLedger,
        blobs: BlobStore,
    ) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(addr).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (guard_tx, done_rx) = mpsc::channel(1);

        info!(addr = %socket.local_addr()?, "UDP server bound");

        Ok(Self {
            engine: Arc::new(Engine {
                socket,
                sessions,
                tokens,
                ledger,
                blobs,
                shutdown: shutdown_rx,
                _task_guard: guard_tx,
            }),
            shutdown_tx,
            done_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.engine.socket.local_addr()?)
    }

    /// Spawn the receive loop. Returns immediately.
    pub fn start(&self) {
        let engine = self.engine.clone();
        tokio::spawn(engine.receive_loop());
        info!("UDP server started");
    }

    /// Stop accepting datagrams and wait for outstanding handlers, up to
    /// the shutdown deadline.
    pub async fn shutdown(self) {
        info!("shutting down UDP server");
        let _ = self.shutdown_tx.send(true);

        let UdpServer {
            engine,
            mut done_rx,
            ..
        } = self;
        // The receive loop and every in-flight handler hold an Arc to the
        // engine; dropping ours means the guard channel closes when the
        // last of them finishes.
        drop(engine);

        match tokio::time::timeout(SHUTDOWN_DEADLINE, done_rx.recv()).await {
            Ok(_) => info!("UDP server shut down cleanly"),
            Err(_) => warn!(
                deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
                "shutdown deadline exceeded; abandoning outstanding handlers"
            ),
        }
    }
}

impl Engine {
    async fn receive_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("receive loop stopping");
                        break;
                    }
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            // The shared buffer is reused on the next read;
                            // hand each handler its own copy.
                            let data = buf[..len].to_vec();
                            tokio::spawn(self.clone().handle_packet(data, addr));
                        }
                        Err(e) => {
                            error!(error = %e, "error reading from UDP socket");
                        }
                    }
                }
            }
        }
    }

    async fn handle_packet(self: Arc<Self>, data: Vec<u8>, addr: SocketAddr) {
        let packet = match Packet::decode(&data) {
            Ok(packet) => packet,
            Err(e) => {
                // Malformed, wrong version or corrupt: drop without reply.
                // Answering unauthenticated garbage invites amplification.
                debug!(error = %e, from = %addr, len = data.len(), "dropping undecodable datagram");
                return;
            }
        };

        debug!(
            packet_type = ?packet.packet_type,
            from = %addr,
            message_id = %packet.message_id,
            chunk_index = packet.chunk_index,
            total_chunks = packet.total_chunks,
            "received packet"
        );

        match packet.packet_type {
            PacketType::Auth => self.handle_auth(packet, addr).await,
            PacketType::VoiceData => self.handle_voice_data(packet, addr).await,
            PacketType::Heartbeat => self.handle_heartbeat(packet, addr).await,
            PacketType::ListMessages => self.handle_list_messages(packet, addr).await,
            PacketType::Download => self.handle_download(packet, addr).await,
            PacketType::Ack | PacketType::AuthAck | PacketType::MessageList => {
                debug!(packet_type = ?packet.packet_type, from = %addr, "client-bound packet received server-side; dropping");
            }
            PacketType::Error => {
                warn!(from = %addr, payload = %String::from_utf8_lossy(&packet.payload), "error packet received; dropping");
            }
        }
    }

    async fn handle_auth(&self, packet: Packet, addr: SocketAddr) {
        let token = String::from_utf8_lossy(&packet.payload);

        let claims = match self.tokens.verify(&token) {
            Ok(claims) => claims,
            Err(e) => {
                warn!(error = %e, from = %addr, "invalid token in auth packet");
                self.send_error(addr, packet.message_id, "Invalid token").await;
                return;
            }
        };

        // The session is keyed by the token's subject, never by whatever
        // identity the packet claims.
        if let Err(e) = self
            .sessions
            .create_session(claims.user_id, &claims.username, addr)
            .await
        {
            error!(error = %e, user_id = %claims.user_id, "failed to create session");
            self.send_error(addr, packet.message_id, "Failed to create session")
                .await;
            return;
        }

        info!(
            user_id = %claims.user_id,
            username = %claims.username,
            address = %addr,
            "user authenticated"
        );

        self.send(&Packet::auth_ack(claims.user_id, packet.message_id), addr)
            .await;
    }

    async fn handle_voice_data(self: Arc<Self>, packet: Packet, addr: SocketAddr) {
        match self.sessions.get_session(packet.sender_id).await {
            Ok(_) => {}
            Err(SessionError::NotFound) => {
                // No ACK, no ERROR: session state must not leak to
                // unauthenticated peers.
                debug!(sender_id = %packet.sender_id, from = %addr, "voice data from unknown session; dropping");
                return;
            }
            Err(e) => {
                error!(error = %e, "session lookup failed; dropping chunk");
                return;
            }
        }

        if let Err(e) = self.sessions.update_last_seen(packet.sender_id).await {
            debug!(error = %e, sender_id = %packet.sender_id, "failed to refresh session");
        }

        let first_seen = match self
            .sessions
            .save_chunk(packet.message_id, packet.chunk_index, packet.payload.clone())
            .await
        {
            Ok(first_seen) => first_seen,
            Err(e) => {
                // No ACK: the client retransmits, and the idempotent put
                // makes the retry safe.
                error!(error = %e, message_id = %packet.message_id, chunk_index = packet.chunk_index, "failed to save chunk");
                return;
            }
        };

        let count = if first_seen {
            match self.sessions.increment_received(packet.message_id).await {
                Ok(count) => Some(count),
                Err(e) => {
                    error!(error = %e, message_id = %packet.message_id, "failed to increment chunk counter");
                    return;
                }
            }
        } else {
            // Late retry of a chunk we already counted. Still worth an ACK
            // so the client stops resending, but it must not advance the
            // counter or it could overshoot the total.
            debug!(message_id = %packet.message_id, chunk_index = packet.chunk_index, "duplicate chunk; not counted");
            None
        };

        if let Some(count) = count {
            debug!(
                message_id = %packet.message_id,
                chunk_index = packet.chunk_index,
                total_chunks = packet.total_chunks,
                received = count,
                "chunk received"
            );
        }

        // ACK before the reassembly decision so retries never block on
        // storage work.
        self.send(&Packet::ack_for(&packet), addr).await;

        if count == Some(packet.total_chunks as i64) {
            info!(
                message_id = %packet.message_id,
                total_chunks = packet.total_chunks,
                "all chunks received"
            );
            tokio::spawn(self.clone().process_complete_message(
                packet.message_id,
                packet.sender_id,
                packet.recipient_id,
                packet.total_chunks,
            ));
        }
    }

    /// Assemble a completed upload, persist it, record it, and route it.
    async fn process_complete_message(
        self: Arc<Self>,
        message_id: Uuid,
        sender_id: Uuid,
        recipient_id: Uuid,
        total_chunks: u32,
    ) {
        info!(message_id = %message_id, "processing complete message");

        // 1. Pull every chunk back out, in index order.
        let mut assembled = Vec::new();
        for index in 0..total_chunks {
            match self.sessions.get_chunk(message_id, index).await {
                Ok(chunk) => assembled.extend_from_slice(&chunk),
                Err(e) => {
                    error!(
                        message_id = %message_id,
                        chunk_index = index,
                        error = %e,
                        "missing chunk at assembly; abandoning message"
                    );
                    // Best effort; the record may not exist yet.
                    if let Err(e) = self
                        .ledger
                        .update_status_only(message_id, MessageStatus::Failed)
                        .await
                    {
                        debug!(error = %e, message_id = %message_id, "could not mark message failed");
                    }
                    return;
                }
            }
        }

        info!(message_id = %message_id, size = assembled.len(), "message assembled");

        if *self.shutdown.borrow() {
            warn!(message_id = %message_id, "shutdown in progress; leaving pending state for TTL expiry");
            return;
        }

        // 2. Persist the blob. A failed upload is still recorded so the
        // failure is observable from the ledger.
        let upload = self
            .blobs
            .upload(message_id, &assembled, DEFAULT_AUDIO_FORMAT)
            .await;
        let (object_key, status) = match upload {
            Ok(key) => (key, MessageStatus::Transmitted),
            Err(e) => {
                error!(error = %e, message_id = %message_id, "failed to store assembled message");
                (String::new(), MessageStatus::Failed)
            }
        };

        // 3. Durable record.
        let now = Utc::now();
        let record = VoiceMessage {
            id: message_id,
            sender_id,
            recipient_id,
            file_path: object_key,
            file_size: assembled.len() as i64,
            duration_secs: None,
            audio_format: DEFAULT_AUDIO_FORMAT.to_string(),
            total_chunks,
            chunks_received: total_chunks,
            status,
            created_at: now,
            transmitted_at: Some(now),
            delivered_at: None,
            listened_at: None,
        };

        if let Err(e) = self.ledger.create(&record).await {
            error!(error = %e, message_id = %message_id, "failed to create message record");
        } else {
            debug!(message_id = %message_id, status = %status, "message record created");
        }

        // 4. Route to the recipient when they are online; otherwise the
        // record stays `transmitted` for a later pull.
        if status == MessageStatus::Transmitted && !*self.shutdown.borrow() {
            match self.sessions.is_online(recipient_id).await {
                Ok(true) => {
                    self.forward_to_recipient(
                        message_id,
                        sender_id,
                        recipient_id,
                        &assembled,
                        total_chunks,
                    )
                    .await;
                }
                Ok(false) => {
                    info!(
                        message_id = %message_id,
                        recipient_id = %recipient_id,
                        "recipient offline; message stored for later retrieval"
                    );
                }
                Err(e) => {
                    warn!(error = %e, recipient_id = %recipient_id, "failed to check recipient presence");
                }
            }
        }

        // 5. Ephemeral cleanup, regardless of how routing went.
        if let Err(e) = self.sessions.delete_pending(message_id, total_chunks).await {
            warn!(error = %e, message_id = %message_id, "failed to clean up pending message");
        }
    }

    async fn forward_to_recipient(
        &self,
        message_id: Uuid,
        sender_id: Uuid,
        recipient_id: Uuid,
        data: &[u8],
        total_chunks: u32,
    ) {
        let session = match self.sessions.get_session(recipient_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, recipient_id = %recipient_id, "recipient session vanished; leaving message for pull");
                return;
            }
        };

        info!(
            message_id = %message_id,
            recipient = %session.username,
            address = %session.address,
            total_chunks,
            "forwarding message to recipient"
        );

        // The forward mirrors the upload's chunking so the recipient sees
        // the same `total_chunks` the sender announced.
        self.send_voice_chunks(
            sender_id,
            recipient_id,
            message_id,
            data,
            total_chunks,
            session.address,
        )
        .await;

        if let Err(e) = self
            .ledger
            .update(
                message_id,
                total_chunks,
                MessageStatus::Delivered,
                None,
                Some(Utc::now()),
                None,
            )
            .await
        {
            error!(error = %e, message_id = %message_id, "failed to mark message delivered");
        }
    }

    async fn handle_heartbeat(&self, packet: Packet, addr: SocketAddr) {
        match self.sessions.update_last_seen(packet.sender_id).await {
            Ok(()) => {
                self.send(&Packet::ack_for(&packet), addr).await;
            }
            Err(SessionError::NotFound) => {
                debug!(sender_id = %packet.sender_id, "heartbeat from unknown session; dropping");
            }
            Err(e) => {
                warn!(error = %e, sender_id = %packet.sender_id, "failed to refresh session on heartbeat");
            }
        }
    }

    async fn handle_list_messages(&self, packet: Packet, addr: SocketAddr) {
        if self.sessions.get_session(packet.sender_id).await.is_err() {
            debug!(sender_id = %packet.sender_id, "list request from unknown session; dropping");
            return;
        }

        let records = match self
            .ledger
            .list_by_recipient(packet.sender_id, LIST_DEFAULT_LIMIT, 0)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, user_id = %packet.sender_id, "failed to list messages");
                return;
            }
        };

        let mut infos = Vec::with_capacity(records.len());
        for record in &records {
            infos.push(MessageInfo {
                id: record.id,
                sender_id: record.sender_id,
                sender_name: self.display_name(record.sender_id).await,
                file_size: record.file_size,
                duration: record.duration_secs,
                audio_format: record.audio_format.clone(),
                status: record.status.to_string(),
                created_at: record.created_at.to_rfc3339(),
            });
        }

        let reply = match Packet::message_list(packet.sender_id, &infos) {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "failed to serialise message list");
                return;
            }
        };

        debug!(user_id = %packet.sender_id, count = infos.len(), "sending message list");
        self.send(&reply, addr).await;
    }

    async fn handle_download(&self, packet: Packet, addr: SocketAddr) {
        if self.sessions.get_session(packet.sender_id).await.is_err() {
            debug!(sender_id = %packet.sender_id, "download request from unknown session; dropping");
            return;
        }

        let record = match self.ledger.get_by_id(packet.message_id).await {
            Ok(record) => record,
            Err(parlo_store::StoreError::NotFound) => {
                self.send_error(addr, packet.message_id, "message not found")
                    .await;
                return;
            }
            Err(e) => {
                error!(error = %e, message_id = %packet.message_id, "failed to load message record");
                return;
            }
        };

        if record.recipient_id != packet.sender_id {
            warn!(
                message_id = %packet.message_id,
                requester = %packet.sender_id,
                recipient = %record.recipient_id,
                "download by non-recipient refused"
            );
            self.send_error(addr, packet.message_id, "forbidden").await;
            return;
        }

        let data = match self.blobs.download(&record.file_path).await {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, message_id = %record.id, key = %record.file_path, "failed to load message audio");
                self.send_error(addr, packet.message_id, "message unavailable")
                    .await;
                return;
            }
        };

        info!(
            message_id = %record.id,
            recipient = %record.recipient_id,
            size = data.len(),
            "serving message download"
        );

        self.send_voice_chunks(
            record.sender_id,
            record.recipient_id,
            record.id,
            &data,
            chunk_count(data.len()),
            addr,
        )
        .await;
    }

    /// Split `data` into `total_chunks` VOICE_DATA packets and emit them,
    /// paced so the burst stays inside the kernel send buffer. Each piece is
    /// within the wire payload bound as long as `total_chunks` is at least
    /// [`chunk_count`] of the data length.
    async fn send_voice_chunks(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        message_id: Uuid,
        data: &[u8],
        total_chunks: u32,
        addr: SocketAddr,
    ) {
        if data.is_empty() || total_chunks == 0 {
            let packet = Packet::voice_data(sender_id, recipient_id, message_id, 0, 1, Vec::new());
            self.send(&packet, addr).await;
            return;
        }

        let chunk_size = data.len().div_ceil(total_chunks as usize);
        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            let packet = Packet::voice_data(
                sender_id,
                recipient_id,
                message_id,
                index as u32,
                total_chunks,
                chunk.to_vec(),
            );
            self.send(&packet, addr).await;
            tokio::time::sleep(FORWARD_PACING).await;
        }
    }

    /// Best display name we have for a user: their live session's username,
    /// falling back to the bare id.
    async fn display_name(&self, user_id: Uuid) -> String {
        match self.sessions.get_session(user_id).await {
            Ok(session) => session.username,
            Err(_) => user_id.to_string(),
        }
    }

    /// Encode and emit one packet. Write failures are logged, never fatal:
    /// the peer's retry logic owns recovery.
    async fn send(&self, packet: &Packet, addr: SocketAddr) {
        let data = match packet.encode() {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, packet_type = ?packet.packet_type, "failed to encode packet");
                return;
            }
        };

        if let Err(e) = self.socket.send_to(&data, addr).await {
            error!(error = %e, to = %addr, "failed to send packet");
        }
    }

    async fn send_error(&self, addr: SocketAddr, message_id: Uuid, text: &str) {
        self.send(&Packet::error(message_id, text), addr).await;
    }
}

/// Number of `MAX_PAYLOAD_SIZE` chunks needed for `len` bytes (minimum 1).
fn chunk_count(len: usize) -> u32 {
    if len == 0 {
        return 1;
    }
    len.div_ceil(MAX_PAYLOAD_SIZE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;
    use tokio::net::UdpSocket;

    use parlo_client::RelayClient;
    use parlo_session::KvClient;
    use parlo_store::Database;

    struct Relay {
        addr: SocketAddr,
        sessions: SessionStore,
        ledger: MessageLedger,
        blobs: BlobStore,
        tokens: TokenService,
        server: UdpServer,
        _blob_dir: TempDir,
    }

    async fn start_relay() -> Relay {
        let sessions = SessionStore::new(KvClient::memory());
        let tokens = TokenService::new(
            "test-secret",
            ChronoDuration::minutes(15),
            ChronoDuration::days(7),
        );
        let ledger = MessageLedger::new(Database::open_in_memory().unwrap());

        let blob_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(
            blob_dir.path().to_path_buf(),
            "voice-messages",
            "http://localhost:9000",
        )
        .await
        .unwrap();

        let server = UdpServer::bind(
            "127.0.0.1:0",
            sessions.clone(),
            tokens.clone(),
            ledger.clone(),
            blobs.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        server.start();

        Relay {
            addr,
            sessions,
            ledger,
            blobs,
            tokens,
            server,
            _blob_dir: blob_dir,
        }
    }

    async fn authed_client(relay: &Relay, user: Uuid, name: &str) -> RelayClient {
        let token = relay.tokens.issue(user, name);
        let mut client = RelayClient::connect(relay.addr).await.unwrap();
        let canonical = client.authenticate(&token).await.unwrap();
        assert_eq!(canonical, user);
        client
    }

    async fn raw_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn send_raw(socket: &UdpSocket, bytes: &[u8], addr: SocketAddr) {
        socket.send_to(bytes, addr).await.unwrap();
    }

    async fn recv_packet(socket: &UdpSocket, wait: Duration) -> Option<Packet> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        match tokio::time::timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Packet::decode(&buf[..len]).ok(),
            _ => None,
        }
    }

    async fn await_record(ledger: &MessageLedger, id: Uuid) -> VoiceMessage {
        for _ in 0..250 {
            if let Ok(record) = ledger.get_by_id(id).await {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("ledger record {id} never appeared");
    }

    async fn await_status(
        ledger: &MessageLedger,
        id: Uuid,
        status: MessageStatus,
    ) -> VoiceMessage {
        for _ in 0..250 {
            if let Ok(record) = ledger.get_by_id(id).await {
                if record.status == status {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("record {id} never reached status {status}");
    }

    #[tokio::test]
    async fn auth_happy_path() {
        let relay = start_relay().await;
        let user = Uuid::new_v4();
        let token = relay.tokens.issue(user, "ada");

        let mut client = RelayClient::connect(relay.addr).await.unwrap();
        let canonical = client.authenticate(&token).await.unwrap();

        assert_eq!(canonical, user);
        assert!(relay.sessions.is_online(user).await.unwrap());

        let session = relay.sessions.get_session(user).await.unwrap();
        assert_eq!(session.username, "ada");
        assert_eq!(session.address, client.local_addr().unwrap());

        relay.server.shutdown().await;
    }

    #[tokio::test]
    async fn auth_with_bad_token_gets_error_packet() {
        let relay = start_relay().await;

        let socket = raw_socket().await;
        let packet = Packet::auth("garbage-token");
        send_raw(&socket, &packet.encode().unwrap(), relay.addr).await;

        let reply = recv_packet(&socket, Duration::from_secs(2))
            .await
            .expect("expected an error reply");
        assert_eq!(reply.packet_type, PacketType::Error);
        assert_eq!(reply.message_id, packet.message_id);
        assert_eq!(reply.payload, b"Invalid token");

        relay.server.shutdown().await;
    }

    #[tokio::test]
    async fn voice_from_unknown_sender_is_dropped_silently() {
        let relay = start_relay().await;
        let stranger = Uuid::new_v4();

        let socket = raw_socket().await;
        let packet = Packet::voice_data(
            stranger,
            Uuid::new_v4(),
            Uuid::new_v4(),
            0,
            1,
            b"X".to_vec(),
        );
        send_raw(&socket, &packet.encode().unwrap(), relay.addr).await;

        assert!(
            recv_packet(&socket, Duration::from_millis(300)).await.is_none(),
            "server must not reply to unauthenticated voice data"
        );
        assert!(!relay.sessions.is_online(stranger).await.unwrap());
        assert!(relay.ledger.get_by_id(packet.message_id).await.is_err());

        relay.server.shutdown().await;
    }

    #[tokio::test]
    async fn two_chunk_upload_offline_recipient() {
        let relay = start_relay().await;
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let message_id = Uuid::new_v4();

        let client = authed_client(&relay, sender, "ada").await;
        let socket = client.socket();

        // Chunks arrive out of order: idx 1 ("BB") first, then idx 0 ("AA").
        for (index, payload) in [(1u32, b"BB"), (0u32, b"AA")] {
            let packet = Packet::voice_data(
                sender,
                recipient,
                message_id,
                index,
                2,
                payload.to_vec(),
            );
            socket
                .send_to(&packet.encode().unwrap(), relay.addr)
                .await
                .unwrap();

            let ack = recv_packet(socket, Duration::from_secs(2))
                .await
                .expect("chunk must be ACKed");
            assert_eq!(ack.packet_type, PacketType::Ack);
            assert_eq!(ack.message_id, message_id);
            assert_eq!(ack.chunk_index, index);
        }

        let record = await_record(&relay.ledger, message_id).await;
        assert_eq!(record.status, MessageStatus::Transmitted);
        assert_eq!(record.file_size, 4);
        assert_eq!(record.total_chunks, 2);
        assert_eq!(record.chunks_received, 2);
        assert!(record.transmitted_at.is_some());
        assert!(record.delivered_at.is_none());

        // Reassembly preserved index order regardless of arrival order.
        let audio = relay.blobs.download(&record.file_path).await.unwrap();
        assert_eq!(audio, b"AABB");

        // Ephemeral state is gone.
        for index in 0..2 {
            assert!(relay
                .sessions
                .get_chunk(message_id, index)
                .await
                .is_err());
        }

        relay.server.shutdown().await;
    }

    #[tokio::test]
    async fn two_chunk_upload_online_recipient_gets_forwarded() {
        let relay = start_relay().await;
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let message_id = Uuid::new_v4();

        let sender_client = authed_client(&relay, sender, "ada").await;
        let mut recipient_client = authed_client(&relay, recipient, "grace").await;

        for (index, payload) in [(0u32, b"AA"), (1u32, b"BB")] {
            let packet = Packet::voice_data(
                sender,
                recipient,
                message_id,
                index,
                2,
                payload.to_vec(),
            );
            sender_client
                .socket()
                .send_to(&packet.encode().unwrap(), relay.addr)
                .await
                .unwrap();
            recv_packet(sender_client.socket(), Duration::from_secs(2))
                .await
                .expect("chunk must be ACKed");
        }

        let record = await_status(&relay.ledger, message_id, MessageStatus::Delivered).await;
        assert!(record.delivered_at.is_some());

        // The recipient received the relayed chunks; concatenated they are
        // the original audio.
        let audio = recipient_client
            .receive_voice_message(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(audio.message_id, message_id);
        assert_eq!(audio.sender_id, sender);
        assert_eq!(audio.data, b"AABB");

        relay.server.shutdown().await;
    }

    #[tokio::test]
    async fn list_and_download_round_trip() {
        let relay = start_relay().await;
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();

        let sender_client = authed_client(&relay, sender, "ada").await;
        let message_id = upload(&sender_client, &relay, sender, recipient, b"AABB", 2).await;
        await_record(&relay.ledger, message_id).await;

        let mut recipient_client = authed_client(&relay, recipient, "grace").await;

        let listed = recipient_client.list_messages().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, message_id);
        assert_eq!(listed[0].file_size, 4);
        assert_eq!(listed[0].audio_format, "opus");

        let audio = recipient_client.download(message_id).await.unwrap();
        assert_eq!(audio, b"AABB");

        relay.server.shutdown().await;
    }

    #[tokio::test]
    async fn download_by_non_recipient_is_forbidden() {
        let relay = start_relay().await;
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let snoop = Uuid::new_v4();

        let sender_client = authed_client(&relay, sender, "ada").await;
        let message_id = upload(&sender_client, &relay, sender, recipient, b"AABB", 2).await;
        await_record(&relay.ledger, message_id).await;

        let snoop_client = authed_client(&relay, snoop, "eve").await;
        let request = Packet::download(snoop, message_id);
        snoop_client
            .socket()
            .send_to(&request.encode().unwrap(), relay.addr)
            .await
            .unwrap();

        let reply = recv_packet(snoop_client.socket(), Duration::from_secs(2))
            .await
            .expect("expected a reply");
        assert_eq!(reply.packet_type, PacketType::Error);
        assert_eq!(reply.payload, b"forbidden");

        relay.server.shutdown().await;
    }

    #[tokio::test]
    async fn corrupted_chunk_is_dropped_without_ack() {
        let relay = start_relay().await;
        let sender = Uuid::new_v4();
        let message_id = Uuid::new_v4();

        let client = authed_client(&relay, sender, "ada").await;

        let packet = Packet::voice_data(
            sender,
            Uuid::new_v4(),
            message_id,
            0,
            1,
            b"QQ".to_vec(),
        );
        let mut bytes = packet.encode().unwrap();
        // Tamper with the checksum field.
        bytes[58] ^= 0xFF;
        client.socket().send_to(&bytes, relay.addr).await.unwrap();

        assert!(
            recv_packet(client.socket(), Duration::from_millis(300)).await.is_none(),
            "corrupt chunk must not be ACKed"
        );
        assert!(relay.ledger.get_by_id(message_id).await.is_err());
        // The counter never moved: a fresh increment starts at 1.
        assert_eq!(
            relay.sessions.increment_received(message_id).await.unwrap(),
            1
        );

        relay.server.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_chunks_do_not_break_completion() {
        let relay = start_relay().await;
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let message_id = Uuid::new_v4();

        let client = authed_client(&relay, sender, "ada").await;
        let socket = client.socket();

        // Chunk 0 delivered twice (a retry), then chunk 1. The duplicate is
        // ACKed but not counted, so completion still fires exactly when the
        // last distinct chunk lands.
        for (index, payload) in [(0u32, b"AA"), (0u32, b"AA"), (1u32, b"BB")] {
            let packet = Packet::voice_data(
                sender,
                recipient,
                message_id,
                index,
                2,
                payload.to_vec(),
            );
            socket
                .send_to(&packet.encode().unwrap(), relay.addr)
                .await
                .unwrap();
            recv_packet(socket, Duration::from_secs(2))
                .await
                .expect("every chunk, duplicate or not, is ACKed");
        }

        let record = await_record(&relay.ledger, message_id).await;
        assert_eq!(record.status, MessageStatus::Transmitted);

        let audio = relay.blobs.download(&record.file_path).await.unwrap();
        assert_eq!(audio, b"AABB");

        relay.server.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_refreshes_known_sessions_only() {
        let relay = start_relay().await;
        let user = Uuid::new_v4();
        let client = authed_client(&relay, user, "ada").await;

        let beat = Packet::heartbeat(user);
        client
            .socket()
            .send_to(&beat.encode().unwrap(), relay.addr)
            .await
            .unwrap();
        let ack = recv_packet(client.socket(), Duration::from_secs(2))
            .await
            .expect("heartbeat must be ACKed");
        assert_eq!(ack.packet_type, PacketType::Ack);

        // Unknown users get silence.
        let socket = raw_socket().await;
        let beat = Packet::heartbeat(Uuid::new_v4());
        send_raw(&socket, &beat.encode().unwrap(), relay.addr).await;
        assert!(recv_packet(&socket, Duration::from_millis(300)).await.is_none());

        relay.server.shutdown().await;
    }

    /// Push `data` as `total` equal chunks and return the message id.
    async fn upload(
        client: &RelayClient,
        relay: &Relay,
        sender: Uuid,
        recipient: Uuid,
        data: &[u8],
        total: u32,
    ) -> Uuid {
        let message_id = Uuid::new_v4();
        let size = data.len().div_ceil(total as usize);
        for (index, chunk) in data.chunks(size).enumerate() {
            let packet = Packet::voice_data(
                sender,
                recipient,
                message_id,
                index as u32,
                total,
                chunk.to_vec(),
            );
            client
                .socket()
                .send_to(&packet.encode().unwrap(), relay.addr)
                .await
                .unwrap();
            recv_packet(client.socket(), Duration::from_secs(2))
                .await
                .expect("chunk must be ACKed");
        }
        message_id
    }
}
