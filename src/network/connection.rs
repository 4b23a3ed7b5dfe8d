//! TCP connection handling: handshake, newline-delimited JSON framing.

use super::protocol::ProtocolMessage;
use crate::error::{DbError, DbResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const HANDSHAKE_PREFIX: &str = "KNIRV:";

/// An established, handshaken connection to a peer.
pub struct Connection {
    peer_id: String,
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Connection {
    /// Completes the handshake as the connecting side: send our id first,
    /// then read theirs.
    pub async fn connect(stream: TcpStream, local_peer_id: &str) -> DbResult<Self> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("{HANDSHAKE_PREFIX}{local_peer_id}\n").as_bytes())
            .await?;

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let peer_id = parse_handshake(&line)?;

        Ok(Self {
            peer_id,
            reader,
            writer: write_half,
        })
    }

    /// Completes the handshake as the accepting side: read their id
    /// first, then send ours.
    pub async fn accept(stream: TcpStream, local_peer_id: &str) -> DbResult<Self> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let peer_id = parse_handshake(&line)?;

        write_half
            .write_all(format!("{HANDSHAKE_PREFIX}{local_peer_id}\n").as_bytes())
            .await?;

        Ok(Self {
            peer_id,
            reader,
            writer: write_half,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn send(&mut self, message: &ProtocolMessage) -> DbResult<usize> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let len = line.len();
        self.writer.write_all(&line).await?;
        Ok(len)
    }

    pub async fn receive(&mut self) -> DbResult<Option<ProtocolMessage>> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }
}

fn parse_handshake(line: &str) -> DbResult<String> {
    let trimmed = line.trim_end();
    trimmed
        .strip_prefix(HANDSHAKE_PREFIX)
        .map(|id| id.to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| DbError::conflict(format!("malformed handshake: '{trimmed}'")))
}

pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(addr: &str) -> DbResult<Self> {
        Ok(Self {
            inner: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> DbResult<std::net::SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    pub async fn accept(&self) -> DbResult<TcpStream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::MessageType;
    use serde_json::json;

    #[tokio::test]
    async fn handshake_and_roundtrip_message() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let stream = listener.accept().await.unwrap();
            let mut conn = Connection::accept(stream, "server").await.unwrap();
            assert_eq!(conn.peer_id(), "client");
            let msg = conn.receive().await.unwrap().unwrap();
            assert_eq!(msg.msg_type, MessageType::Heartbeat);
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Connection::connect(stream, "client").await.unwrap();
        assert_eq!(conn.peer_id(), "server");

        conn.send(&ProtocolMessage {
            msg_type: MessageType::Heartbeat,
            network_id: "net1".into(),
            sender_id: "client".into(),
            timestamp: 0,
            payload: json!(null),
        })
        .await
        .unwrap();

        server.await.unwrap();
    }

    #[test]
    fn parse_handshake_rejects_missing_prefix() {
        assert!(parse_handshake("not-a-handshake\n").is_err());
    }

    #[test]
    fn parse_handshake_extracts_peer_id() {
        assert_eq!(parse_handshake("KNIRV:abc123\n").unwrap(), "abc123");
    }
}
