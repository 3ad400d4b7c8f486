//! Output side: a blocking writer feeding the downstream publisher's FIFO.
//!
//! Writes never drop packets under backpressure; the pipe's kernel buffer
//! is grown where the platform allows, and a vanished reader (EPIPE) costs
//! exactly the packet that failed: the sink reopens and carries on rather
//! than letting downstream state diverge.

use crate::error::{RelayError, Result};
use crate::ts::TsPacket;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Target kernel pipe buffer.
const PIPE_BUFFER_BYTES: i32 = 1 << 20;

/// Grace period before reopening after the reader went away.
const REOPEN_GRACE: Duration = Duration::from_millis(100);

/// Write-side counters for the periodic stats line.
#[derive(Debug, Default, Clone)]
pub struct SinkStats {
    /// Total payload bytes written
    pub bytes_written: u64,
    /// Packets written
    pub packets_written: u64,
    /// Reader-restart reconnects survived
    pub reconnects: u64,
}

/// Owns the output FIFO descriptor.
pub struct OutputSink {
    path: String,
    file: Option<File>,
    stats: SinkStats,
}

impl OutputSink {
    /// Creates a sink for the FIFO at `path`. Nothing is opened yet.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            file: None,
            stats: SinkStats::default(),
        }
    }

    /// Opens the FIFO for writing, blocking until a reader attaches.
    ///
    /// The path must exist and be a FIFO; anything else is a fatal
    /// misconfiguration.
    pub async fn open(&mut self) -> Result<()> {
        let metadata = std::fs::metadata(&self.path).map_err(|e| {
            RelayError::Fatal(format!("output pipe {}: {}", self.path, e))
        })?;
        if !metadata.file_type().is_fifo() {
            return Err(RelayError::Fatal(format!(
                "output path {} is not a FIFO",
                self.path
            )));
        }

        let file = OpenOptions::new().write(true).open(&self.path).await?;
        grow_pipe_buffer(&file);
        self.file = Some(file);
        log::info!("output pipe {} open, reader attached", self.path);
        Ok(())
    }

    /// Writes one packet, fully blocking. On a broken pipe the descriptor
    /// is recycled and the packet counts as lost; any other error is
    /// propagated.
    pub async fn write_packet(&mut self, packet: &TsPacket) -> Result<()> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => {
                self.open().await?;
                self.file.as_mut().expect("just opened")
            }
        };

        match file.write_all(packet.as_bytes()).await {
            Ok(()) => {
                self.stats.bytes_written += packet.as_bytes().len() as u64;
                self.stats.packets_written += 1;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                log::warn!("output reader went away, reopening {}", self.path);
                self.stats.reconnects += 1;
                self.file = None;
                tokio::time::sleep(REOPEN_GRACE).await;
                self.open().await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a batch of packets in order.
    pub async fn write_packets(&mut self, packets: &[TsPacket]) -> Result<()> {
        for packet in packets {
            self.write_packet(packet).await?;
        }
        Ok(())
    }

    /// Flushes and closes the descriptor.
    pub async fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SinkStats {
        self.stats.clone()
    }
}

fn grow_pipe_buffer(file: &File) {
    let fd = file.as_raw_fd();
    // best effort; unprivileged processes may be capped lower
    let got = unsafe { libc::fcntl(fd, libc::F_SETPIPE_SZ, PIPE_BUFFER_BYTES) };
    if got < 0 {
        log::debug!("F_SETPIPE_SZ not honored on output pipe");
    } else {
        log::debug!("output pipe buffer set to {} bytes", got);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::{SYNC_BYTE, TS_PACKET_SIZE};
    use std::ffi::CString;
    use tokio::io::AsyncReadExt;

    fn make_fifo(tag: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "relaymux-sink-test-{}-{}.pipe",
            std::process::id(),
            tag
        ));
        let _ = std::fs::remove_file(&path);
        let cpath = CString::new(path.to_str().unwrap()).unwrap();
        let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o644) };
        assert_eq!(rc, 0, "mkfifo failed");
        path.to_str().unwrap().to_string()
    }

    fn test_packet(tag: u8) -> TsPacket {
        let mut raw = [0u8; TS_PACKET_SIZE];
        raw[0] = SYNC_BYTE;
        raw[1] = 0x00;
        raw[2] = tag;
        raw[3] = 0x10;
        TsPacket::from_slice(&raw).unwrap()
    }

    #[tokio::test]
    async fn rejects_non_fifo_path() {
        let path = std::env::temp_dir().join(format!(
            "relaymux-sink-regular-{}",
            std::process::id()
        ));
        std::fs::write(&path, b"x").unwrap();
        let mut sink = OutputSink::new(path.to_str().unwrap());
        let err = sink.open().await.unwrap_err();
        assert!(matches!(err, RelayError::Fatal(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn writes_aligned_packets_to_reader() {
        let path = make_fifo("write");
        let reader_path = path.clone();
        let reader = tokio::spawn(async move {
            let mut file = File::open(&reader_path).await.unwrap();
            let mut buf = vec![0u8; TS_PACKET_SIZE * 3];
            file.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut sink = OutputSink::new(&path);
        sink.open().await.unwrap();
        for tag in 0..3u8 {
            sink.write_packet(&test_packet(tag)).await.unwrap();
        }
        sink.close().await;

        let buf = reader.await.unwrap();
        for k in 0..3 {
            assert_eq!(buf[k * TS_PACKET_SIZE], SYNC_BYTE);
            assert_eq!(buf[k * TS_PACKET_SIZE + 2], k as u8);
        }
        assert_eq!(sink.stats().packets_written, 3);
        let _ = std::fs::remove_file(&path);
    }
}
