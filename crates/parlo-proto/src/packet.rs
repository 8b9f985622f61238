use thiserror::Error;
use uuid::Uuid;

use crate::{checksum, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("packet too small: {0} bytes")]
    PacketTooSmall(usize),

    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unknown packet type: {0:#04x}")]
    UnknownType(u8),

    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("truncated packet: header announces {expected} payload bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Auth = 0x01,
    AuthAck = 0x02,
    VoiceData = 0x03,
    Ack = 0x04,
    Heartbeat = 0x05,
    ListMessages = 0x06,
    MessageList = 0x07,
    Download = 0x08,
    Error = 0xFF,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Auth),
            0x02 => Some(Self::AuthAck),
            0x03 => Some(Self::VoiceData),
            0x04 => Some(Self::Ack),
            0x05 => Some(Self::Heartbeat),
            0x06 => Some(Self::ListMessages),
            0x07 => Some(Self::MessageList),
            0x08 => Some(Self::Download),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// One datagram on the wire.
///
/// `message_id` binds all chunks of a voice message together and doubles as
/// a correlation id for the stateless request types. A nil `recipient_id`
/// addresses the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub message_id: Uuid,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(
        packet_type: PacketType,
        sender_id: Uuid,
        recipient_id: Uuid,
        message_id: Uuid,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            message_id,
            chunk_index: 0,
            total_chunks: 0,
            sender_id,
            recipient_id,
            checksum: 0,
            payload: Vec::new(),
        }
    }

    /// Authentication request carrying the bearer token.
    pub fn auth(token: &str) -> Self {
        let mut p = Self::new(PacketType::Auth, Uuid::nil(), Uuid::nil(), Uuid::new_v4());
        p.payload = token.as_bytes().to_vec();
        p
    }

    /// Authentication reply. The client learns its canonical identity from
    /// `recipient_id`.
    pub fn auth_ack(user_id: Uuid, message_id: Uuid) -> Self {
        Self::new(PacketType::AuthAck, Uuid::nil(), user_id, message_id)
    }

    /// Acknowledgement for `original`, with sender/recipient flipped.
    pub fn ack_for(original: &Packet) -> Self {
        let mut p = Self::new(
            PacketType::Ack,
            original.recipient_id,
            original.sender_id,
            original.message_id,
        );
        p.chunk_index = original.chunk_index;
        p.total_chunks = original.total_chunks;
        p
    }

    pub fn voice_data(
        sender_id: Uuid,
        recipient_id: Uuid,
        message_id: Uuid,
        chunk_index: u32,
        total_chunks: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut p = Self::new(PacketType::VoiceData, sender_id, recipient_id, message_id);
        p.chunk_index = chunk_index;
        p.total_chunks = total_chunks;
        p.payload = data;
        p
    }

    pub fn heartbeat(user_id: Uuid) -> Self {
        Self::new(PacketType::Heartbeat, user_id, Uuid::nil(), Uuid::new_v4())
    }

    pub fn list_messages(user_id: Uuid) -> Self {
        Self::new(
            PacketType::ListMessages,
            user_id,
            Uuid::nil(),
            Uuid::new_v4(),
        )
    }

    /// Message-list reply; the payload is a JSON array of [`MessageInfo`].
    pub fn message_list(
        recipient_id: Uuid,
        messages: &[crate::MessageInfo],
    ) -> Result<Self, serde_json::Error> {
        let mut p = Self::new(
            PacketType::MessageList,
            Uuid::nil(),
            recipient_id,
            Uuid::new_v4(),
        );
        p.payload = serde_json::to_vec(messages)?;
        Ok(p)
    }

    /// Download request for the message named by `message_id`. Carries a
    /// sentinel payload so the request exercises the same checksummed decode
    /// path as data packets.
    pub fn download(user_id: Uuid, message_id: Uuid) -> Self {
        let mut p = Self::new(PacketType::Download, user_id, Uuid::nil(), message_id);
        p.payload = b"download".to_vec();
        p
    }

    /// Error reply with a short human-readable string.
    pub fn error(message_id: Uuid, text: &str) -> Self {
        let mut p = Self::new(PacketType::Error, Uuid::nil(), Uuid::nil(), message_id);
        p.payload = text.as_bytes().to_vec();
        p
    }

    /// Serialise to wire bytes.
    ///
    /// Recomputes the payload checksum; the `checksum` field of `self` is
    /// ignored on input.
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtoError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.version);
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(self.message_id.as_bytes());
        buf.extend_from_slice(&self.chunk_index.to_be_bytes());
        buf.extend_from_slice(&self.total_chunks.to_be_bytes());
        buf.extend_from_slice(self.sender_id.as_bytes());
        buf.extend_from_slice(self.recipient_id.as_bytes());
        buf.extend_from_slice(&checksum(&self.payload).to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse wire bytes.
    ///
    /// The header is consumed in full before the payload is validated, so a
    /// checksum failure is distinguishable from malformed framing.
    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtoError::PacketTooSmall(data.len()));
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }
        let packet_type =
            PacketType::from_byte(data[1]).ok_or(ProtoError::UnknownType(data[1]))?;

        let message_id = read_uuid(&data[2..18]);
        let chunk_index = read_u32(&data[18..22]);
        let total_chunks = read_u32(&data[22..26]);
        let sender_id = read_uuid(&data[26..42]);
        let recipient_id = read_uuid(&data[42..58]);
        let declared_checksum = read_u32(&data[58..62]);
        let payload_len = read_u16(&data[62..64]) as usize;

        let payload = if payload_len > 0 {
            let got = data.len() - HEADER_SIZE;
            if got < payload_len {
                return Err(ProtoError::Truncated {
                    expected: payload_len,
                    got,
                });
            }
            let payload = data[HEADER_SIZE..HEADER_SIZE + payload_len].to_vec();
            let computed = checksum(&payload);
            if computed != declared_checksum {
                return Err(ProtoError::ChecksumMismatch {
                    expected: declared_checksum,
                    got: computed,
                });
            }
            payload
        } else {
            Vec::new()
        };

        Ok(Self {
            version,
            packet_type,
            message_id,
            chunk_index,
            total_chunks,
            sender_id,
            recipient_id,
            checksum: declared_checksum,
            payload,
        })
    }
}

fn read_uuid(b: &[u8]) -> Uuid {
    let mut id = [0u8; 16];
    id.copy_from_slice(b);
    Uuid::from_bytes(id)
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn read_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}
