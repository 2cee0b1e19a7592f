//! Operator protocol between `procraft` clients and `procraft-server`
//!
//! Messages are MessagePack encoded and sent as frames:
//! `[4-byte length BE][payload]`.

mod message;

pub use message::{ClientMessage, ControllerInfo, ServerMessage};

use anyhow::{anyhow, bail, Result};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame payload (10 MB)
pub const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Protocol version mismatch: client={client}, server={server}")]
    VersionMismatch { client: u32, server: u32 },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },
}

/// Serialize a message to MessagePack bytes
pub fn serialize<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(msg)?)
}

/// Deserialize a message from MessagePack bytes
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| anyhow!(ProtocolError::MalformedMessage(e.to_string())))
}

/// Prefix a payload with its length
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_MESSAGE_SIZE {
        bail!(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&frame_message(payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one message
pub async fn recv<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(payload) => Ok(Some(deserialize(&payload)?)),
        None => Ok(None),
    }
}

/// Encode and write one message
pub async fn send<T, W>(writer: &mut W, msg: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &serialize(msg)?).await
}

/// Check if client and server protocol versions are compatible
pub fn check_version_compatibility(client_version: u32, server_version: u32) -> Result<()> {
    if client_version != server_version {
        bail!(ProtocolError::VersionMismatch {
            client: client_version,
            server: server_version
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_pipe() -> Result<()> {
        let (mut a, mut b) = tokio::io::duplex(1024);
        send(&mut a, &ClientMessage::Attach {
            controller: "alpha".into(),
        })
        .await?;
        drop(a);

        let msg: Option<ClientMessage> = recv(&mut b).await?;
        assert!(matches!(msg, Some(ClientMessage::Attach { controller }) if controller == "alpha"));

        let eof: Option<ClientMessage> = recv(&mut b).await?;
        assert!(eof.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_version_mismatch() {
        assert!(check_version_compatibility(1, 1).is_ok());
        let err = check_version_compatibility(2, 1).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }
}
