use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Metadata key carrying the authenticated user name of a connection
pub const USER_METADATA_KEY: &str = "x-user";

/// Largest frame body accepted or produced by the codec
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Hello { metadata: Metadata },
    Request { text: String },

    Response { user: String, text: String },
    Rejected { reason: String },
}

/// Connection-scoped key/value side channel sent once before any payload
///
/// A key may carry several values; callers decide whether that is legal.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(user: impl Into<String>) -> Self {
        let mut metadata = Self::new();
        metadata.insert(USER_METADATA_KEY, user);
        metadata
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Returns every value stored under `key`, in insertion order
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A chat line attributed to the user who sent it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub user: String,
    pub text: String,
}

impl Message {
    pub fn new(user: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            text: text.into(),
        }
    }
}

impl From<Message> for Packet {
    fn from(message: Message) -> Self {
        Packet::Response {
            user: message.user,
            text: message.text,
        }
    }
}

/// Reads one length-prefixed packet
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_packet<R>(reader: &mut R) -> io::Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let read = reader.read(&mut header).await?;
    if read == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[read..]).await?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    bincode::deserialize(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Writes one length-prefixed packet and flushes the writer
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Encodes a packet into the exact bytes `write_packet` puts on the wire
pub fn encode_frame(packet: &Packet) -> io::Result<Vec<u8>> {
    let body =
        bincode::serialize(packet).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "packet of {} bytes exceeds limit of {}",
                body.len(),
                MAX_FRAME_LEN
            ),
        ));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}
