//! # Connections
//!
//! A `Connection` is an authenticated link to one peer server. Sending never
//! blocks: frames are queued to a writer task that owns the transport's write
//! side. Inbound frames are read by a pump task owned by the node.
//!
//! ## Invariants
//! - Once `is_active` turns false it never turns true again.
//! - Frames queued on one connection are written in order.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use meshpack::FRAME_HEADER_LEN;
use meshpack::Frame;
use meshrpc::Message;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::callback::CallError;
use crate::identity::ServerIdentity;
use crate::rpc::RpcAddon;
use crate::transport;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub enum Error {
    /// The connection is no longer active.
    Closed,
    /// The message could not be turned into a frame.
    Encode(meshrpc::Error),
    /// The frame is larger than the peer accepts; `len` counts the bytes
    /// after the length prefix.
    TooLarge(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::TooLarge(len) => write!(f, "frame of {} bytes exceeds the maximum", len),
        }
    }
}

impl std::error::Error for Error {}

impl From<meshrpc::Error> for Error {
    fn from(e: meshrpc::Error) -> Self {
        Self::Encode(e)
    }
}

impl From<Error> for CallError {
    fn from(e: Error) -> Self {
        match e {
            Error::Closed => Self::ConnectionLost,
            Error::Encode(_) | Error::TooLarge(_) => Self::Encode,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub trait Connection: Send + Sync + 'static {
    /// The authenticated server on the other end.
    fn peer(&self) -> &ServerIdentity;

    fn is_active(&self) -> bool;

    /// Queues one frame for writing.
    fn send(&self, frame: Frame) -> Result<()>;

    fn send_message(&self, msg: &dyn Message, seq: i32) -> Result<()> {
        self.send(msg.to_frame(seq)?)
    }

    /// Stops accepting frames and releases the underlying transport.
    fn close(&self) {}
}

/// A connection backed by a `Transport` and a writer task.
pub struct PeerConnection {
    peer: ServerIdentity,
    active: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Frame>,
    transport: Arc<dyn Transport>,
    max_frame: usize,
}

impl PeerConnection {
    /// Wraps an already-authenticated transport and spawns its writer task.
    ///
    /// Frames above `max_frame` are refused at `send`, so one oversized
    /// message never reaches the peer's reader and takes the link down.
    pub fn spawn(peer: ServerIdentity, transport: Arc<dyn Transport>, max_frame: usize) -> Arc<Self> {
        let (outbound, mut rx) = mpsc::unbounded_channel::<Frame>();
        let active = Arc::new(AtomicBool::new(true));

        let writer_transport = transport.clone();
        let writer_active = active.clone();
        let writer_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(peer = %writer_peer, msg_id = frame.msg_id, error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = writer_transport.send(&bytes).await {
                    warn!(peer = %writer_peer, error = %e, "write failed");
                    break;
                }
            }
            writer_active.store(false, Ordering::Release);
            writer_transport.close().await;
            debug!(peer = %writer_peer, "writer stopped");
        });

        Arc::new(Self {
            peer,
            active,
            outbound,
            transport,
            max_frame,
        })
    }

    /// Reads the next inbound frame.
    pub async fn recv_frame(&self) -> transport::Result<Option<Frame>> {
        recv_frame(self.transport.as_ref()).await
    }
}

impl Connection for PeerConnection {
    fn peer(&self) -> &ServerIdentity {
        &self.peer
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Closed);
        }
        let len = frame.body.len() + FRAME_HEADER_LEN - 4;
        if len > self.max_frame {
            warn!(peer = %self.peer, msg_id = frame.msg_id, seq = frame.seq, len, "frame too large");
            return Err(Error::TooLarge(len));
        }
        self.outbound.send(frame).map_err(|_| Error::Closed)
    }

    fn close(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(peer = %self.peer, "closing connection");
        let transport = self.transport.clone();
        tokio::spawn(async move { transport.close().await });
    }
}

/// Reads and decodes one frame from a transport.
pub(crate) async fn recv_frame(transport: &dyn Transport) -> transport::Result<Option<Frame>> {
    match transport.recv().await? {
        Some(bytes) => Ok(Some(Frame::decode(&bytes)?)),
        None => Ok(None),
    }
}

/// A connection together with its request/response bookkeeping.
pub struct Link {
    pub conn: Arc<dyn Connection>,
    pub rpc: RpcAddon,
}

impl Link {
    /// `local` is this node, written as the source of forwarded requests.
    pub fn new(conn: Arc<dyn Connection>, local: &ServerIdentity) -> Self {
        let rpc = RpcAddon::new(conn.clone(), local);
        Self { conn, rpc }
    }

    pub fn peer(&self) -> &ServerIdentity {
        self.conn.peer()
    }

    pub fn is_active(&self) -> bool {
        self.conn.is_active()
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("peer", self.conn.peer())
            .field("active", &self.conn.is_active())
            .field("pending", &self.rpc.pending_count())
            .finish()
    }
}
