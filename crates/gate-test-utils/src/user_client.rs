//! User-dialect clients for driving the receiver in tests.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::codec::FramedRead;

use gate_proto::ByteOrder;
use gate_proto::framing::FrameCodec;
use gate_proto::user::{ClientMsg, ServerMsg};

/// A user connection over raw TCP with length-prefixed frames.
pub struct TcpUserClient {
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
    order: ByteOrder,
}

impl TcpUserClient {
    pub async fn connect(addr: SocketAddr, order: ByteOrder) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        Ok(TcpUserClient {
            reader: FramedRead::new(read_half, FrameCodec::new(order)),
            writer,
            order,
        })
    }

    pub async fn send(&mut self, msg: &ClientMsg) -> std::io::Result<()> {
        let frame = msg
            .encode_frame(self.order)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        self.writer.write_all(&frame).await
    }

    /// Next server message, or None on timeout / closed connection /
    /// undecodable frame.
    pub async fn recv(&mut self, timeout: Duration) -> Option<ServerMsg> {
        let frame = tokio::time::timeout(timeout, self.reader.next())
            .await
            .ok()??
            .ok()?;
        ServerMsg::decode(&frame, self.order).ok()
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// A user connection over WebSocket; one body per binary message.
pub struct WsUserClient {
    ws: WsStream,
    order: ByteOrder,
}

impl WsUserClient {
    pub async fn connect(addr: SocketAddr, order: ByteOrder) -> std::io::Result<Self> {
        let url = format!("ws://{addr}");
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e.to_string()))?;
        Ok(WsUserClient { ws, order })
    }

    pub async fn send(&mut self, msg: &ClientMsg) -> std::io::Result<()> {
        let body = msg
            .encode_body(self.order)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        self.ws
            .send(Message::Binary(body.into()))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()))
    }

    pub async fn recv(&mut self, timeout: Duration) -> Option<ServerMsg> {
        loop {
            let msg = tokio::time::timeout(timeout, self.ws.next())
                .await
                .ok()??
                .ok()?;
            match msg {
                Message::Binary(body) => return ServerMsg::decode(&body, self.order).ok(),
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
