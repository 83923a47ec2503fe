//! Bulk transfer engine
//!
//! Moves fixed-size blocks between a file and the data connection. Downloads
//! use `sendfile(2)` on Linux; uploads and every other platform go through a
//! buffered copy. After each block the throttle decides whether to publish
//! progress and how long to pause.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::signals::interruptible;
use crate::sync::{SyncError, SyncMessage, SyncWriter, TransferStatus, XferInfo};
use crate::throttle::Throttle;

/// Bytes moved per block
pub const XFER_BLOCK_SIZE: usize = 64 * 1024;

/// Receives periodic transfer counters.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Publishes a progress snapshot.
    async fn progress(&self, info: &XferInfo) -> Result<(), SyncError>;
}

#[async_trait]
impl ProgressSink for SyncWriter {
    async fn progress(&self, info: &XferInfo) -> Result<(), SyncError> {
        self.send(&SyncMessage::XferProgress(*info)).await
    }
}

/// Sink that drops every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn progress(&self, _info: &XferInfo) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Which session total a finished transfer adds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server to client (RETR)
    Download,
    /// Client to server (STOR)
    Upload,
}

/// Maps an I/O failure to a transfer outcome: a vanished peer is an abort,
/// anything else a failure.
pub fn classify(err: &io::Error) -> TransferStatus {
    match err.raw_os_error() {
        Some(libc::EPIPE) | Some(libc::ECONNRESET) => TransferStatus::Aborted,
        _ => match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => TransferStatus::Aborted,
            _ => TransferStatus::Failed,
        },
    }
}

/// Wall-clock microseconds since the epoch.
pub fn unix_micros() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0)
}

/// One transfer in progress.
pub struct Transfer<'a> {
    info: &'a mut XferInfo,
    throttle: Throttle,
    sink: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
}

impl<'a> Transfer<'a> {
    /// Resets the per-transfer counters in `info` and starts the clock.
    pub fn begin(
        info: &'a mut XferInfo,
        rate: Option<u64>,
        sink: &'a dyn ProgressSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        info.xfer_len = 0;
        info.probe_len = 0;
        info.status = TransferStatus::Completed;
        info.started_at_us = unix_micros();
        Self {
            info,
            throttle: Throttle::new(rate, Instant::now()),
            sink,
            cancel,
        }
    }

    /// Records the outcome, folds the transfer into the session totals and
    /// returns the counters for the stop message.
    pub fn finish(self, status: TransferStatus, direction: Direction) -> XferInfo {
        match direction {
            Direction::Download => self.info.total_down += self.info.xfer_len,
            Direction::Upload => self.info.total_up += self.info.xfer_len,
        }
        self.info.status = status;
        *self.info
    }

    /// Accounts a block; false once shutdown was requested.
    async fn account(&mut self, n: usize) -> Result<bool, SyncError> {
        self.info.xfer_len += n as u64;
        self.info.probe_len += n as u64;

        let step = self.throttle.step(self.info, Instant::now());
        if let Some(snapshot) = step.report {
            self.sink.progress(&snapshot).await?;
        }
        if !step.pause.is_zero()
            && interruptible(self.cancel, tokio::time::sleep(step.pause))
                .await
                .is_none()
        {
            return Ok(false);
        }
        Ok(!self.cancel.is_cancelled())
    }

    fn fail(&self, err: io::Error) -> TransferStatus {
        let status = classify(&err);
        match status {
            TransferStatus::Aborted => debug!(error = %err, "peer left during transfer"),
            _ => error!(error = %err, bytes = self.info.xfer_len, "transfer I/O failed"),
        }
        status
    }

    /// Buffered copy until `reader` reaches end of stream.
    pub async fn copy<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<TransferStatus, SyncError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; XFER_BLOCK_SIZE];
        loop {
            let n = match interruptible(self.cancel, reader.read(&mut buf)).await {
                None => return Ok(TransferStatus::Shutdown),
                Some(Ok(0)) => break,
                Some(Ok(n)) => n,
                Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Some(Err(e)) => return Ok(self.fail(e)),
            };

            match interruptible(self.cancel, writer.write_all(&buf[..n])).await {
                None => return Ok(TransferStatus::Shutdown),
                Some(Ok(())) => {}
                Some(Err(e)) => return Ok(self.fail(e)),
            }

            if !self.account(n).await? {
                return Ok(TransferStatus::Shutdown);
            }
        }

        match writer.flush().await {
            Ok(()) => Ok(TransferStatus::Completed),
            Err(e) => Ok(self.fail(e)),
        }
    }

    /// Sends `len` bytes of `file`, starting at `offset`, with `sendfile(2)`.
    #[cfg(target_os = "linux")]
    pub async fn send_file(
        &mut self,
        file: &mut tokio::fs::File,
        offset: u64,
        len: u64,
        data: &mut TcpStream,
    ) -> Result<TransferStatus, SyncError> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        let mut pos = libc::off_t::try_from(offset).unwrap_or(libc::off_t::MAX);
        let mut remaining = len;

        while remaining > 0 {
            let count = remaining.min(XFER_BLOCK_SIZE as u64) as usize;
            let n = match interruptible(self.cancel, sendfile_block(data, fd, &mut pos, count)).await {
                None => return Ok(TransferStatus::Shutdown),
                Some(Ok(0)) => {
                    error!(remaining, "file shrank during transfer");
                    return Ok(TransferStatus::Failed);
                }
                Some(Ok(n)) => n,
                Some(Err(e)) => return Ok(self.fail(e)),
            };
            remaining -= n as u64;

            if !self.account(n).await? {
                return Ok(TransferStatus::Shutdown);
            }
        }

        Ok(TransferStatus::Completed)
    }

    /// Sends `len` bytes of `file`, starting at `offset`.
    #[cfg(not(target_os = "linux"))]
    pub async fn send_file(
        &mut self,
        file: &mut tokio::fs::File,
        offset: u64,
        len: u64,
        data: &mut TcpStream,
    ) -> Result<TransferStatus, SyncError> {
        use tokio::io::AsyncSeekExt;

        if let Err(e) = file.seek(std::io::SeekFrom::Start(offset)).await {
            return Ok(self.fail(e));
        }
        let mut limited = file.take(len);
        self.copy(&mut limited, data).await
    }
}

#[cfg(target_os = "linux")]
async fn sendfile_block(
    sock: &TcpStream,
    fd: std::os::unix::io::RawFd,
    pos: &mut libc::off_t,
    count: usize,
) -> io::Result<usize> {
    use std::os::unix::io::AsRawFd;
    use tokio::io::Interest;

    loop {
        sock.writable().await?;
        let res = sock.try_io(Interest::WRITABLE, || {
            let mut off = *pos;
            // SAFETY: both descriptors are owned by live objects borrowed for
            // the duration of the call and `off` is a valid out pointer.
            let n = unsafe { libc::sendfile(sock.as_raw_fd(), fd, &mut off, count) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            *pos = off;
            Ok(n as usize)
        });
        match res {
            Ok(n) => return Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue
            }
            Err(e) => return Err(e),
        }
    }
}
