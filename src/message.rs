use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// One chat message as it travels through the relay. Constructed by clients,
/// copied verbatim to every recipient; the server never edits the fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub group_name: String,
    pub text: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToServer {
    Message(ChatMessage),
    CreateGroup { group_name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerToClient {
    Message(ChatMessage),
    GroupCreated { group_name: String },
}

/// Reads the next frame from a newline-delimited JSON stream. Returns
/// `Ok(None)` once the peer closes its write side; blank lines are skipped so
/// keyboard-driven peers stay usable.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        let frame = line.trim_end_matches(['\r', '\n']);
        if frame.is_empty() {
            continue;
        }

        return serde_json::from_str(frame).map(Some).map_err(invalid_frame);
    }
}

/// Encodes one frame as a JSON line and flushes it, so peers see every frame
/// as soon as it is written.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(frame).map_err(invalid_frame)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// Milliseconds since the Unix epoch, for stamping outgoing messages.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn invalid_frame(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
