//! Worker to master state synchronization
//!
//! Workers never touch the master's roster. Everything the master knows about
//! a session arrives as a framed message on one shared pipe:
//!
//! ```text
//! +-----------+-----------+-----------+---------------------------+
//! | sender u32| magic u32 | type u32  | payload (size per type)   |
//! +-----------+-----------+-----------+---------------------------+
//! ```
//!
//! All integers are little-endian. Payload sizes come from a static registry,
//! so the reader always knows how many bytes belong to the frame even when it
//! discards the message. A frame is written with a single `write(2)` and never
//! exceeds `PIPE_BUF`, which keeps concurrent writers from interleaving inside
//! a frame.

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::trace;

use crate::vfs::{MAX_NAME, MAX_PATH};

/// Magic constant carried by every frame header
pub const SYNC_MAGIC: u32 = 0xDEAD_BEEF;

/// Header size in bytes (sender:4 + magic:4 + type:4)
pub const HEADER_LEN: usize = 12;

/// Capacity of the login name field, NUL included
pub const MAX_LOGIN_NAME: usize = 64;

/// Encoded size of [`XferInfo`]
pub const XFER_INFO_LEN: usize = 48;

/// Largest frame on the wire
pub const MAX_FRAME_LEN: usize = HEADER_LEN + max_payload_len();

const _: () = assert!(MAX_FRAME_LEN <= libc::PIPE_BUF);

/// Identifies a worker; assigned by the master, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message types known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// A session logged in
    Login = 0,
    /// A session changed its working directory
    Chdir = 1,
    /// A transfer started
    XferStart = 2,
    /// Periodic transfer counters
    XferProgress = 3,
    /// Final transfer counters and status
    XferStop = 4,
}

struct Registration {
    kind: MessageType,
    payload_len: usize,
}

const REGISTRY: [Registration; 5] = [
    Registration {
        kind: MessageType::Login,
        payload_len: MAX_LOGIN_NAME,
    },
    Registration {
        kind: MessageType::Chdir,
        payload_len: MAX_PATH,
    },
    Registration {
        kind: MessageType::XferStart,
        payload_len: MAX_NAME,
    },
    Registration {
        kind: MessageType::XferProgress,
        payload_len: XFER_INFO_LEN,
    },
    Registration {
        kind: MessageType::XferStop,
        payload_len: XFER_INFO_LEN,
    },
];

const fn max_payload_len() -> usize {
    let mut max = 0;
    let mut i = 0;
    while i < REGISTRY.len() {
        if REGISTRY[i].payload_len > max {
            max = REGISTRY[i].payload_len;
        }
        i += 1;
    }
    max
}

impl MessageType {
    /// Looks up a raw type value in the registry.
    pub fn from_wire(raw: u32) -> Option<Self> {
        REGISTRY
            .iter()
            .find(|r| r.kind as u32 == raw)
            .map(|r| r.kind)
    }

    /// Fixed payload size for this type.
    pub fn payload_len(self) -> usize {
        REGISTRY
            .iter()
            .find(|r| r.kind == self)
            .map_or(0, |r| r.payload_len)
    }
}

/// How a transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum TransferStatus {
    /// All bytes moved
    #[default]
    Completed = 0,
    /// The peer went away
    Aborted = 1,
    /// Local I/O failure
    Failed = 2,
    /// Cut short by server shutdown
    Shutdown = 3,
}

impl TransferStatus {
    /// Decodes a wire value; unknown values read as `Failed`.
    pub fn from_wire(raw: u32) -> Self {
        match raw {
            0 => TransferStatus::Completed,
            1 => TransferStatus::Aborted,
            3 => TransferStatus::Shutdown,
            _ => TransferStatus::Failed,
        }
    }

    /// Word used in the master's log line.
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Completed => "completed",
            TransferStatus::Aborted => "aborted",
            TransferStatus::Failed | TransferStatus::Shutdown => "failed",
        }
    }
}

/// Transfer counters shared with the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XferInfo {
    /// Bytes sent to the client over the whole session
    pub total_down: u64,
    /// Bytes received from the client over the whole session
    pub total_up: u64,
    /// Bytes moved by the current transfer
    pub xfer_len: u64,
    /// Bytes moved since the last probe reset
    pub probe_len: u64,
    /// Outcome, meaningful in a stop message
    pub status: TransferStatus,
    /// Wall-clock transfer start, microseconds since the epoch
    pub started_at_us: u64,
}

impl XferInfo {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.total_down);
        buf.put_u64_le(self.total_up);
        buf.put_u64_le(self.xfer_len);
        buf.put_u64_le(self.probe_len);
        buf.put_u32_le(self.status as u32);
        buf.put_u32_le(0);
        buf.put_u64_le(self.started_at_us);
    }

    fn get(mut buf: &[u8]) -> Self {
        let total_down = buf.get_u64_le();
        let total_up = buf.get_u64_le();
        let xfer_len = buf.get_u64_le();
        let probe_len = buf.get_u64_le();
        let status = TransferStatus::from_wire(buf.get_u32_le());
        buf.advance(4);
        let started_at_us = buf.get_u64_le();
        Self {
            total_down,
            total_up,
            xfer_len,
            probe_len,
            status,
            started_at_us,
        }
    }
}

/// A decoded State-Sync message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Login name
    Login(String),
    /// New virtual working directory
    Chdir(String),
    /// File name of the transfer that just started
    XferStart(String),
    /// Counters while a transfer runs
    XferProgress(XferInfo),
    /// Counters once a transfer ended
    XferStop(XferInfo),
}

impl SyncMessage {
    /// Registry type of this message.
    pub fn kind(&self) -> MessageType {
        match self {
            SyncMessage::Login(_) => MessageType::Login,
            SyncMessage::Chdir(_) => MessageType::Chdir,
            SyncMessage::XferStart(_) => MessageType::XferStart,
            SyncMessage::XferProgress(_) => MessageType::XferProgress,
            SyncMessage::XferStop(_) => MessageType::XferStop,
        }
    }
}

/// A message together with the worker that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sending worker
    pub sender: WorkerId,
    /// Payload
    pub message: SyncMessage,
}

/// State-Sync failures.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The stream is out of step; nothing after this point can be trusted
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Expected value
        expected: u32,
        /// Value found on the wire
        got: u32,
    },
    /// Type not present in the registry
    #[error("unknown message type {0}")]
    UnknownType(u32),
    /// A string does not fit its fixed field
    #[error("{field} of {len} bytes does not fit in {capacity} bytes")]
    FieldTooLong {
        /// Which field
        field: &'static str,
        /// Length of the value
        len: usize,
        /// Field capacity, NUL included
        capacity: usize,
    },
    /// The pipe accepted only part of a frame
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes written
        written: usize,
        /// Frame length
        expected: usize,
    },
    /// Every write end of the channel is gone
    #[error("state-sync channel closed")]
    Closed,
    /// Underlying pipe failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn put_str(
    buf: &mut BytesMut,
    value: &str,
    capacity: usize,
    field: &'static str,
) -> Result<(), SyncError> {
    if value.len() >= capacity {
        return Err(SyncError::FieldTooLong {
            field,
            len: value.len(),
            capacity,
        });
    }
    buf.put_slice(value.as_bytes());
    buf.put_bytes(0, capacity - value.len());
    Ok(())
}

fn get_str(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn truncate_to(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Encodes one frame. Login names are truncated to fit; paths and file
/// names that do not fit are an error.
pub fn encode(sender: WorkerId, message: &SyncMessage) -> Result<Bytes, SyncError> {
    let kind = message.kind();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + kind.payload_len());
    buf.put_u32_le(sender.0);
    buf.put_u32_le(SYNC_MAGIC);
    buf.put_u32_le(kind as u32);

    match message {
        SyncMessage::Login(name) => {
            let name = truncate_to(name, MAX_LOGIN_NAME - 1);
            put_str(&mut buf, name, MAX_LOGIN_NAME, "login name")?;
        }
        SyncMessage::Chdir(path) => put_str(&mut buf, path, MAX_PATH, "path")?,
        SyncMessage::XferStart(name) => put_str(&mut buf, name, MAX_NAME, "file name")?,
        SyncMessage::XferProgress(info) | SyncMessage::XferStop(info) => info.put(&mut buf),
    }

    debug_assert_eq!(buf.len(), HEADER_LEN + kind.payload_len());
    Ok(buf.freeze())
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` until a whole frame is buffered; consumed bytes are
/// removed. A bad magic or unknown type is an error and leaves `buf` as is.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, SyncError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut header = &buf[..HEADER_LEN];
    let sender = WorkerId(header.get_u32_le());
    let magic = header.get_u32_le();
    let raw_type = header.get_u32_le();

    if magic != SYNC_MAGIC {
        return Err(SyncError::InvalidMagic {
            expected: SYNC_MAGIC,
            got: magic,
        });
    }

    let kind = MessageType::from_wire(raw_type).ok_or(SyncError::UnknownType(raw_type))?;
    let len = kind.payload_len();
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(len);
    let message = match kind {
        MessageType::Login => SyncMessage::Login(get_str(&payload)),
        MessageType::Chdir => SyncMessage::Chdir(get_str(&payload)),
        MessageType::XferStart => SyncMessage::XferStart(get_str(&payload)),
        MessageType::XferProgress => SyncMessage::XferProgress(XferInfo::get(&payload)),
        MessageType::XferStop => SyncMessage::XferStop(XferInfo::get(&payload)),
    };

    Ok(Some(Frame { sender, message }))
}

/// Creates the shared channel: a write end for workers and the master's reader.
pub fn channel() -> io::Result<(Arc<pipe::Sender>, SyncReader)> {
    let (tx, rx) = pipe::pipe()?;
    Ok((Arc::new(tx), SyncReader::new(rx)))
}

/// A worker's handle on the shared write end.
#[derive(Debug, Clone)]
pub struct SyncWriter {
    id: WorkerId,
    pipe: Arc<pipe::Sender>,
}

impl SyncWriter {
    /// Binds the shared write end to a worker id.
    pub fn new(id: WorkerId, pipe: Arc<pipe::Sender>) -> Self {
        Self { id, pipe }
    }

    /// Id stamped on every frame this writer sends.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Sends one message with a single write.
    pub async fn send(&self, message: &SyncMessage) -> Result<(), SyncError> {
        let frame = encode(self.id, message)?;
        loop {
            self.pipe.writable().await?;
            match self.pipe.try_write(&frame) {
                Ok(n) if n == frame.len() => {
                    trace!(worker = %self.id, kind = ?message.kind(), "state sent");
                    return Ok(());
                }
                Ok(n) => {
                    return Err(SyncError::ShortWrite {
                        written: n,
                        expected: frame.len(),
                    })
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// The master's end of the channel.
#[derive(Debug)]
pub struct SyncReader {
    pipe: pipe::Receiver,
    buf: BytesMut,
}

impl SyncReader {
    fn new(pipe: pipe::Receiver) -> Self {
        Self {
            pipe,
            buf: BytesMut::with_capacity(MAX_FRAME_LEN * 4),
        }
    }

    /// Waits for the next complete frame.
    ///
    /// Cancel safe: partially received frames stay buffered.
    pub async fn recv(&mut self) -> Result<Frame, SyncError> {
        loop {
            if let Some(frame) = decode(&mut self.buf)? {
                return Ok(frame);
            }
            self.buf.reserve(MAX_FRAME_LEN);
            let n = self.pipe.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(SyncError::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: SyncMessage) -> Frame {
        let bytes = encode(WorkerId(7), &message).unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        frame
    }

    #[test]
    fn test_registry_sizes() {
        assert_eq!(MessageType::Login.payload_len(), 64);
        assert_eq!(MessageType::Chdir.payload_len(), 1024);
        assert_eq!(MessageType::XferStart.payload_len(), 256);
        assert_eq!(MessageType::XferProgress.payload_len(), XFER_INFO_LEN);
        assert_eq!(MessageType::XferStop.payload_len(), XFER_INFO_LEN);
        assert_eq!(MAX_FRAME_LEN, HEADER_LEN + 1024);
    }

    #[test]
    fn test_from_wire_unknown() {
        assert_eq!(MessageType::from_wire(2), Some(MessageType::XferStart));
        assert_eq!(MessageType::from_wire(99), None);
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(WorkerId(0x0102_0304), &SyncMessage::Login("bob".into())).unwrap();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &SYNC_MAGIC.to_le_bytes());
        assert_eq!(&bytes[8..12], &0u32.to_le_bytes());
        assert_eq!(&bytes[12..15], b"bob");
        assert!(bytes[15..].iter().all(|b| *b == 0));
        assert_eq!(bytes.len(), HEADER_LEN + MAX_LOGIN_NAME);
    }

    #[test]
    fn test_xfer_stop_counters_survive() {
        let info = XferInfo {
            total_up: 0,
            total_down: 12345,
            xfer_len: 12345,
            probe_len: 45,
            status: TransferStatus::Aborted,
            started_at_us: 1_700_000_000_000_000,
        };
        let frame = roundtrip(SyncMessage::XferStop(info));
        assert_eq!(frame.sender, WorkerId(7));
        assert_eq!(frame.message, SyncMessage::XferStop(info));
    }

    #[test]
    fn test_chdir_path() {
        let frame = roundtrip(SyncMessage::Chdir("/pub/incoming".into()));
        assert_eq!(frame.message, SyncMessage::Chdir("/pub/incoming".into()));
    }

    #[test]
    fn test_login_name_truncated() {
        let long = "é".repeat(40);
        let frame = roundtrip(SyncMessage::Login(long.clone()));
        match frame.message {
            SyncMessage::Login(name) => {
                assert!(name.len() < MAX_LOGIN_NAME);
                assert!(long.starts_with(&name));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_file_name_too_long() {
        let name = "f".repeat(MAX_NAME);
        assert!(matches!(
            encode(WorkerId(1), &SyncMessage::XferStart(name)),
            Err(SyncError::FieldTooLong { capacity: 256, .. })
        ));
    }

    #[test]
    fn test_decode_partial_frame() {
        let bytes = encode(WorkerId(3), &SyncMessage::XferStart("a.iso".into())).unwrap();
        let mut buf = BytesMut::from(&bytes[..HEADER_LEN - 1]);
        assert!(decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[HEADER_LEN - 1..100]);
        assert!(decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[100..]);
        let frame = decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.message, SyncMessage::XferStart("a.iso".into()));
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut bytes = BytesMut::from(&encode(WorkerId(3), &SyncMessage::Login("x".into())).unwrap()[..]);
        bytes[4] ^= 0xFF;
        assert!(matches!(
            decode(&mut bytes),
            Err(SyncError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u32_le(SYNC_MAGIC);
        buf.put_u32_le(42);
        assert!(matches!(decode(&mut buf), Err(SyncError::UnknownType(42))));
    }

    #[test]
    fn test_decode_back_to_back() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(WorkerId(1), &SyncMessage::Login("a".into())).unwrap());
        buf.extend_from_slice(&encode(WorkerId(2), &SyncMessage::Chdir("/b".into())).unwrap());
        assert_eq!(decode(&mut buf).unwrap().unwrap().sender, WorkerId(1));
        assert_eq!(decode(&mut buf).unwrap().unwrap().sender, WorkerId(2));
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_status_from_wire() {
        assert_eq!(TransferStatus::from_wire(0), TransferStatus::Completed);
        assert_eq!(TransferStatus::from_wire(3), TransferStatus::Shutdown);
        assert_eq!(TransferStatus::from_wire(77), TransferStatus::Failed);
        assert_eq!(TransferStatus::Shutdown.as_str(), "failed");
    }

    #[tokio::test]
    async fn test_pipe_send_recv() {
        let (tx, mut reader) = channel().unwrap();
        let writer = SyncWriter::new(WorkerId(9), tx);
        writer.send(&SyncMessage::Login("anonymous".into())).await.unwrap();
        let frame = reader.recv().await.unwrap();
        assert_eq!(frame.sender, WorkerId(9));
        assert_eq!(frame.message, SyncMessage::Login("anonymous".into()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_never_interleave() {
        let (tx, mut reader) = channel().unwrap();
        let writers = 8u32;
        let per_writer = 50usize;

        let mut handles = Vec::new();
        for id in 0..writers {
            let writer = SyncWriter::new(WorkerId(id), tx.clone());
            handles.push(tokio::spawn(async move {
                for i in 0..per_writer {
                    let path = format!("/w{id}/{i}");
                    writer.send(&SyncMessage::Chdir(path)).await.unwrap();
                }
            }));
        }

        let mut next = vec![0usize; writers as usize];
        for _ in 0..writers as usize * per_writer {
            let frame = reader.recv().await.unwrap();
            let id = frame.sender.0 as usize;
            let expected = format!("/w{id}/{}", next[id]);
            assert_eq!(frame.message, SyncMessage::Chdir(expected));
            next[id] += 1;
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(next.iter().all(|n| *n == per_writer));
    }
}
