//! TCP transport.
//!
//! Splits the byte stream back into frames with a `FrameBuffer`; frames above
//! the configured size close the connection.

use std::net::SocketAddr;

use meshpack::FrameBuffer;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use crate::transport;
use crate::transport::Transport;

const READ_CHUNK: usize = 16 * 1024;

struct ReadSide {
    half: OwnedReadHalf,
    frames: FrameBuffer,
    chunk: Vec<u8>,
}

pub struct TcpTransport {
    reader: Mutex<ReadSide>,
    writer: Mutex<OwnedWriteHalf>,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransport {
    pub async fn connect(addr: impl ToSocketAddrs, max_frame: usize) -> transport::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream, max_frame))
    }

    pub fn from_stream(stream: TcpStream, max_frame: usize) -> Self {
        let _ = stream.set_nodelay(true);
        let peer_addr = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        Self {
            reader: Mutex::new(ReadSide {
                half: read,
                frames: FrameBuffer::with_max_frame(max_frame),
                chunk: vec![0u8; READ_CHUNK],
            }),
            writer: Mutex::new(write),
            peer_addr,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, frame: &[u8]) -> transport::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut guard = self.reader.lock().await;
        let side = &mut *guard;
        loop {
            if let Some(bytes) = side.frames.next_frame_bytes()? {
                return Ok(Some(bytes));
            }
            let n = side.half.read(&mut side.chunk).await?;
            if n == 0 {
                if side.frames.is_empty() {
                    return Ok(None);
                }
                return Err(transport::Error::ConnectionLost(format!(
                    "stream ended with {} bytes of a partial frame",
                    side.frames.len()
                )));
            }
            side.frames.extend(&side.chunk[..n]);
        }
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
