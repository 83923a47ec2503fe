//! Master-side table of live workers
//!
//! The roster is owned by the master loop alone. Entries are created when a
//! worker is spawned, updated only by applying State-Sync frames and removed
//! when the worker's exit is reaped.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use tracing::info;

use crate::sync::{Frame, SyncMessage, WorkerId, XferInfo};
use crate::transfer::unix_micros;

/// Last known facts about one worker.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    /// Worker id
    pub id: WorkerId,
    /// When the connection was accepted
    pub connected: Instant,
    /// Client address
    pub peer: IpAddr,
    /// Login name; empty until login
    pub login: String,
    /// Last reported working directory
    pub path: String,
    /// Name of the last file transferred
    pub filename: String,
    /// Last reported counters
    pub xfer: XferInfo,
    /// A transfer started and has not stopped yet
    pub in_progress: bool,
}

impl RosterEntry {
    /// A fresh entry for a worker serving `peer`.
    pub fn new(id: WorkerId, peer: IpAddr) -> Self {
        Self {
            id,
            connected: Instant::now(),
            peer,
            login: String::new(),
            path: "/".to_string(),
            filename: String::new(),
            xfer: XferInfo::default(),
            in_progress: false,
        }
    }

    /// Logs the per-worker summary written when the worker is reaped.
    pub fn log_summary(&self) {
        info!(
            worker = %self.id,
            peer = %self.peer,
            login = %self.login,
            online_secs = self.connected.elapsed().as_secs(),
            down_kb = self.xfer.total_down / 1024,
            up_kb = self.xfer.total_up / 1024,
            "client disconnected"
        );
    }
}

/// What applying a frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The sender's entry was updated
    Updated,
    /// The sender is not in the roster; frame discarded
    UnknownSender,
}

/// Transfer rate in kB/s (bytes per millisecond).
///
/// Elapsed time below one millisecond, including a start time in the future,
/// counts as one millisecond.
pub fn rate_kbps(xfer_len: u64, started_at_us: u64, now_us: u64) -> u64 {
    let elapsed_ms = (now_us.saturating_sub(started_at_us) / 1000).max(1);
    xfer_len / elapsed_ms
}

/// Live workers by id.
#[derive(Debug, Default)]
pub struct Roster {
    entries: HashMap<WorkerId, RosterEntry>,
}

impl Roster {
    /// An empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a newly spawned worker.
    pub fn insert(&mut self, entry: RosterEntry) {
        self.entries.insert(entry.id, entry);
    }

    /// Stops tracking a worker, returning its last state.
    pub fn remove(&mut self, id: WorkerId) -> Option<RosterEntry> {
        self.entries.remove(&id)
    }

    /// Looks up a worker.
    pub fn get(&self, id: WorkerId) -> Option<&RosterEntry> {
        self.entries.get(&id)
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no worker is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of live workers serving `addr`.
    pub fn count_addr(&self, addr: IpAddr) -> usize {
        self.entries.values().filter(|e| e.peer == addr).count()
    }

    /// All live workers, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &RosterEntry> {
        self.entries.values()
    }

    /// Applies one decoded frame to its sender's entry.
    pub fn apply(&mut self, frame: Frame) -> Applied {
        let Some(entry) = self.entries.get_mut(&frame.sender) else {
            return Applied::UnknownSender;
        };

        match frame.message {
            SyncMessage::Login(name) => {
                info!(worker = %entry.id, peer = %entry.peer, login = %name, "new login");
                entry.login = name;
            }
            SyncMessage::Chdir(path) => {
                info!(worker = %entry.id, path = %path, "client changed directory");
                entry.path = path;
            }
            SyncMessage::XferStart(name) => {
                info!(worker = %entry.id, file = %name, "transfer started");
                entry.filename = name;
                entry.in_progress = true;
            }
            SyncMessage::XferProgress(xfer) => {
                entry.xfer = xfer;
            }
            SyncMessage::XferStop(xfer) => {
                entry.xfer = xfer;
                entry.in_progress = false;
                let rate = rate_kbps(xfer.xfer_len, xfer.started_at_us, unix_micros());
                info!(
                    worker = %entry.id,
                    file = %entry.filename,
                    bytes = xfer.xfer_len,
                    "transfer {} ({} kB/s)",
                    xfer.status.as_str(),
                    rate
                );
            }
        }

        Applied::Updated
    }
}
