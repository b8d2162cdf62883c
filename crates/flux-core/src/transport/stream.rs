use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use flux_msg::{Message, ProtoError};

use super::TransportError;

/// Upper bound on a single encoded message.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Byte-stream transport.
///
/// Each wire record is a u32 network-order length followed by the encoded
/// envelope.  The envelope itself is self-delimiting only against a known
/// end, hence the outer length prefix.
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        StreamTransport {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Separate read and write halves (stdio, split TCP).
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        StreamTransport {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    pub async fn send(&self, msg: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let body = msg.encode();
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::Decode(ProtoError::invalid(
                "message exceeds maximum encoded size",
            )));
        }
        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .map_err(TransportError::Io)?;
        writer.write_all(&body).await.map_err(TransportError::Io)?;
        writer.flush().await.map_err(TransportError::Io)?;
        Ok(())
    }

    pub async fn recv(&self) -> Result<Message, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.inner.reader.lock().await;

        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // clean close at a record boundary
                return Err(TransportError::Closed);
            }
            Err(e) => return Err(TransportError::Io(e)),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_MESSAGE_SIZE {
            return Err(TransportError::Decode(ProtoError::decode(format!(
                "implausible record length {}",
                len
            ))));
        }

        let mut body = vec![0u8; len];
        match reader.read_exact(&mut body).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Decode(ProtoError::decode(
                    "stream ended mid-record",
                )));
            }
            Err(e) => return Err(TransportError::Io(e)),
        }
        Message::decode(&body).map_err(TransportError::Decode)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
