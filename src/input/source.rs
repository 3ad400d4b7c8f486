use crate::error::{RelayError, Result};
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// One upstream byte source delivering a raw MPEG-TS.
///
/// Implementations own exactly one descriptor. `open` blocks until the
/// transport is actually delivering (a FIFO waits for its writer, TCP
/// retries are the caller's loop), `read` returns 0 on EOF, and `close`
/// drops the descriptor so the next `open` starts fresh.
#[async_trait]
pub trait ByteSource: Send {
    /// Opens or re-opens the underlying transport.
    async fn open(&mut self) -> Result<()>;

    /// Reads available bytes; 0 means EOF / writer gone.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Drops the descriptor.
    fn close(&mut self);

    /// Human-readable address for logs.
    fn describe(&self) -> String;
}

/// Named-pipe source. Opening blocks until a writer attaches, which is the
/// FIFO's natural readiness signal.
pub struct FifoSource {
    path: String,
    file: Option<File>,
}

impl FifoSource {
    /// Creates a source for the FIFO at `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }
}

#[async_trait]
impl ByteSource for FifoSource {
    async fn open(&mut self) -> Result<()> {
        let file = File::open(&self.path).await?;
        self.file = Some(file);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.file.as_mut() {
            Some(file) => Ok(file.read(buf).await?),
            None => Err(RelayError::NotReady("fifo not open".into())),
        }
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// TCP client source for `tcp://host:port` inputs.
pub struct TcpSource {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpSource {
    /// Creates a source connecting to `addr` (host:port).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }
}

#[async_trait]
impl ByteSource for TcpSource {
    async fn open(&mut self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => Ok(stream.read(buf).await?),
            None => Err(RelayError::NotReady("socket not connected".into())),
        }
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Builds a source from a config `source` string: either a `tcp://` URL or
/// a filesystem path to a FIFO.
pub fn make_source(spec: &str) -> Result<Box<dyn ByteSource>> {
    if let Some(addr) = spec.strip_prefix("tcp://") {
        if addr.is_empty() || !addr.contains(':') {
            return Err(RelayError::Config(format!(
                "tcp source needs host:port, got {:?}",
                spec
            )));
        }
        Ok(Box::new(TcpSource::new(addr)))
    } else if spec.is_empty() {
        Err(RelayError::Config("empty source".into()))
    } else {
        Ok(Box::new(FifoSource::new(spec)))
    }
}
