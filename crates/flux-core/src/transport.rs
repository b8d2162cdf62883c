//! Transport enum and backends.
//!
//! The public API is the [`Transport`] enum; each backend lives in its own
//! module under `transport/`.  A transport moves whole [`Message`]
//! envelopes; only the stream backend ever sees the byte-level codec.

use std::fmt;

use flux_msg::{Message, ProtoError};

pub mod mem;
pub mod stream;

#[derive(Debug)]
pub enum TransportError {
    /// Peer gone or transport explicitly closed.
    Closed,
    Io(std::io::Error),
    /// The peer sent bytes that do not decode to a message.  Fatal to the
    /// connection; never relayed to the peer.
    Decode(ProtoError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Io(e) => write!(f, "transport I/O error: {}", e),
            TransportError::Decode(e) => write!(f, "transport decode error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Decode(e) => Some(e),
            TransportError::Closed => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Transport {
    Mem(mem::MemTransport),
    Stream(stream::StreamTransport),
}

impl Transport {
    /// Two connected in-process endpoints.
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    /// Wrap a byte stream (TCP, Unix socket, duplex pipe).
    pub fn stream<S>(stream: S) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Transport::Stream(stream::StreamTransport::new(stream))
    }

    /// Two stream endpoints over an in-memory duplex pipe, exercising the
    /// byte codec end to end.
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamTransport::pair();
        (Transport::Stream(a), Transport::Stream(b))
    }

    pub async fn send(&self, msg: Message) -> Result<(), TransportError> {
        match self {
            Transport::Mem(t) => t.send(msg).await,
            Transport::Stream(t) => t.send(msg).await,
        }
    }

    pub async fn recv(&self) -> Result<Message, TransportError> {
        match self {
            Transport::Mem(t) => t.recv().await,
            Transport::Stream(t) => t.recv().await,
        }
    }

    pub fn close(&self) {
        match self {
            Transport::Mem(t) => t.close(),
            Transport::Stream(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Transport::Mem(t) => t.is_closed(),
            Transport::Stream(t) => t.is_closed(),
        }
    }
}
