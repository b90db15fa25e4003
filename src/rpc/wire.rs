//! Wire format
//!
//! One request and one response per connection. Each side writes a single
//! bincode-encoded envelope and then half-closes its write direction, so the
//! end of the stream delimits the message.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// A call as it travels from stub to skeleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Contract the caller believes it is talking to
    pub interface: String,
    /// Operation name
    pub operation: String,
    /// Argument type descriptors, in order
    pub signature: Vec<String>,
    /// Individually encoded argument values, in order
    pub args: Vec<Vec<u8>>,
}

impl RpcRequest {
    /// Identifier used to look the call up in a dispatch table.
    pub fn route(&self) -> String {
        route_key(&self.operation, &self.signature)
    }
}

/// The single reply to an [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Encoded return value
    Return(Vec<u8>),
    /// Application error raised by the handler
    Raise(Error),
    /// The call could not be carried out by the transport
    Failure(String),
}

pub(crate) fn route_key<S: AsRef<str>>(operation: &str, signature: &[S]) -> String {
    let types: Vec<&str> = signature.iter().map(AsRef::as_ref).collect();
    format!("{}({})", operation, types.join(","))
}

/// Encode one argument or return value.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode one return value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Decode the argument at `index`.
pub fn decode_arg<T: DeserializeOwned>(args: &[Vec<u8>], index: usize) -> Result<T> {
    let bytes = args
        .get(index)
        .ok_or_else(|| Error::Rpc(format!("missing argument {}", index)))?;
    decode(bytes)
}

/// Write one message and half-close the stream.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(message)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Rpc(format!("write failed: {}", e)))?;
    writer
        .shutdown()
        .await
        .map_err(|e| Error::Rpc(format!("shutdown failed: {}", e)))?;
    Ok(())
}

/// Largest message a peer may send. Data-plane reads and writes are expected
/// to stay well below this; copies move in chunks.
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Read one message, consuming the stream until the peer half-closes it.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    read_message_limited(reader, MAX_MESSAGE_SIZE).await
}

/// Like [`read_message`], but rejects messages longer than `limit` bytes
/// without buffering more than `limit + 1` of them.
pub async fn read_message_limited<R, T>(reader: &mut R, limit: u64) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    (&mut *reader)
        .take(limit + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| Error::Rpc(format!("read failed: {}", e)))?;
    if buf.is_empty() {
        return Err(Error::Rpc("stream closed before a message arrived".to_string()));
    }
    if buf.len() as u64 > limit {
        return Err(Error::Rpc(format!("message exceeds {} bytes", limit)));
    }
    decode(&buf)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_route_key() {
        assert_eq!(route_key("read", &["Path", "u64", "u32"]), "read(Path,u64,u32)");
        assert_eq!(route_key::<&str>("list", &[]), "list()");
    }

    #[tokio::test]
    async fn test_message_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = RpcRequest {
            interface: "storage.Storage".to_string(),
            operation: "size".to_string(),
            signature: vec!["Path".to_string()],
            args: vec![encode("/a").unwrap()],
        };

        write_message(&mut client, &request).await.unwrap();
        let received: RpcRequest = read_message(&mut server).await.unwrap();
        assert_eq!(received, request);
        assert_eq!(received.route(), "size(Path)");
        assert_eq!(decode_arg::<String>(&received.args, 0).unwrap(), "/a");
        assert_matches!(decode_arg::<String>(&received.args, 1), Err(Error::Rpc(_)));
    }

    #[tokio::test]
    async fn test_empty_stream_is_transport_failure() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let result: Result<RpcResponse> = read_message(&mut server).await;
        assert_matches!(result, Err(Error::Rpc(_)));
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let writer = tokio::spawn(async move {
            // The reader stops early, so the tail of this write may fail.
            let _ = write_message(&mut client, &vec![7u8; 1000]).await;
        });

        let result: Result<Vec<u8>> = read_message_limited(&mut server, 256).await;
        assert_matches!(result, Err(Error::Rpc(msg)) if msg.contains("exceeds 256"));
        drop(server);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_message_at_the_limit_is_accepted() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let payload = vec![1u8; 100];
        let size = encode(&payload).unwrap().len() as u64;
        write_message(&mut client, &payload).await.unwrap();

        let received: Vec<u8> = read_message_limited(&mut server, size).await.unwrap();
        assert_eq!(received, payload);
    }
}
