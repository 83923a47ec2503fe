//! Master loop
//!
//! The master accepts control connections, applies admission limits, spawns
//! one worker per admitted client and keeps the roster current from the
//! State-Sync channel and worker exit notifications. It is the only owner of
//! the roster.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::CredentialOracle;
use crate::config::FtpConfig;
use crate::reply::Reply;
use crate::roster::{Applied, Roster, RosterEntry};
use crate::sync::{self, SyncError, SyncReader, SyncWriter, WorkerId};
use crate::worker::{self, ExitGuard, WorkerContext};

/// How long shutdown waits for workers to report their exit.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long a refused client gets to take its 421 reply.
pub const REFUSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Fatal master errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Listener or channel setup failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The State-Sync channel is corrupted
    #[error("state sync: {0}")]
    Sync(#[from] SyncError),
}

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// `max_clients` reached
    TooManyClients,
    /// `max_clients_per_addr` reached for the peer
    TooManyFromAddr,
}

impl Refusal {
    /// Reply written to the refused client.
    pub fn reply(self) -> Reply {
        match self {
            Refusal::TooManyClients => Reply::new(421, "Too many clients"),
            Refusal::TooManyFromAddr => Reply::new(421, "Too many connections from your address"),
        }
    }
}

/// Decides whether a new connection from `peer` may get a worker.
///
/// Unset limits are not checked.
pub fn admit(roster: &Roster, config: &FtpConfig, peer: IpAddr) -> Result<(), Refusal> {
    if config.max_clients.is_some_and(|max| roster.len() >= max) {
        return Err(Refusal::TooManyClients);
    }
    if config
        .max_clients_per_addr
        .is_some_and(|max| roster.count_addr(peer) >= max)
    {
        return Err(Refusal::TooManyFromAddr);
    }
    Ok(())
}

/// A bound, not yet running FTP server.
pub struct Server {
    listener: TcpListener,
    ctx: WorkerContext,
    shutdown: CancellationToken,
}

impl Server {
    /// Binds the control listener on `config.bind`.
    pub async fn bind(
        config: Arc<FtpConfig>,
        oracle: Arc<dyn CredentialOracle>,
        shutdown: CancellationToken,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        Ok(Self {
            listener,
            ctx: WorkerContext { config, oracle },
            shutdown,
        })
    }

    /// Address the control listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until `shutdown` fires or the State-Sync channel fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let (pipe, reader) = sync::channel()?;
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        info!(addr = %self.local_addr()?, "FTP server listening");

        let mut master = Master {
            ctx: self.ctx,
            shutdown: self.shutdown,
            roster: Roster::new(),
            next_id: 1,
            pipe,
            exit_tx,
        };
        master.serve(self.listener, reader, exit_rx).await
    }
}

struct Master {
    ctx: WorkerContext,
    shutdown: CancellationToken,
    roster: Roster,
    next_id: u32,
    pipe: Arc<tokio::net::unix::pipe::Sender>,
    exit_tx: mpsc::UnboundedSender<WorkerId>,
}

impl Master {
    async fn serve(
        &mut self,
        listener: TcpListener,
        mut reader: SyncReader,
        mut exit_rx: mpsc::UnboundedReceiver<WorkerId>,
    ) -> Result<(), ServerError> {
        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("terminating signal caught");
                    break Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                frame = reader.recv() => match frame {
                    Ok(frame) => {
                        let sender = frame.sender;
                        if self.roster.apply(frame) == Applied::UnknownSender {
                            debug!(worker = %sender, "state from unknown worker discarded");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "state sync channel failed");
                        break Err(ServerError::from(e));
                    }
                },
                Some(id) = exit_rx.recv() => self.reap(id),
            }
        };

        drop(listener);
        self.shutdown.cancel();
        self.drain(&mut exit_rx).await;
        info!(remaining = self.roster.len(), "FTP server stopped");
        result
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(refusal) = admit(&self.roster, &self.ctx.config, peer.ip()) {
            info!(peer = %peer, reason = ?refusal, "connection refused");
            tokio::spawn(refuse(stream, refusal));
            return;
        }

        let id = self.allocate_id();
        self.roster.insert(RosterEntry::new(id, peer.ip()));
        debug!(worker = %id, peer = %peer, clients = self.roster.len(), "worker spawned");

        let exit = ExitGuard::new(id, self.exit_tx.clone());
        let writer = SyncWriter::new(id, Arc::clone(&self.pipe));
        tokio::spawn(worker::serve(
            stream,
            peer,
            self.ctx.clone(),
            writer,
            self.shutdown.child_token(),
            exit,
        ));
    }

    fn allocate_id(&mut self) -> WorkerId {
        loop {
            let id = WorkerId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if self.roster.get(id).is_none() {
                return id;
            }
        }
    }

    fn reap(&mut self, id: WorkerId) {
        match self.roster.remove(id) {
            Some(entry) => entry.log_summary(),
            None => debug!(worker = %id, "exit of unknown worker"),
        }
    }

    async fn drain(&mut self, exit_rx: &mut mpsc::UnboundedReceiver<WorkerId>) {
        for entry in self.roster.iter().filter(|e| e.in_progress) {
            info!(
                worker = %entry.id,
                login = %entry.login,
                file = %entry.filename,
                bytes = entry.xfer.xfer_len,
                "transfer interrupted by shutdown"
            );
        }

        let wait = async {
            while !self.roster.is_empty() {
                match exit_rx.recv().await {
                    Some(id) => self.reap(id),
                    None => break,
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, wait).await.is_err() {
            warn!(remaining = self.roster.len(), "workers still running at shutdown");
        }
    }
}

/// Writes the refusal reply and closes, without holding up the accept loop.
async fn refuse(mut stream: TcpStream, refusal: Refusal) {
    let text = refusal.reply().to_string();
    match tokio::time::timeout(REFUSE_TIMEOUT, stream.write_all(text.as_bytes())).await {
        Ok(Ok(())) => {
            let _ = stream.shutdown().await;
        }
        Ok(Err(e)) => debug!(error = %e, "couldn't send refusal"),
        Err(_) => debug!("refused client did not read its reply"),
    }
}
