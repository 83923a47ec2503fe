//! Per-connection worker
//!
//! One worker task serves one control connection. It owns its session, its
//! sockets and a handle on the State-Sync channel, and shares nothing mutable
//! with the master. Its exit is reported through an [`ExitGuard`].

use std::fs::Metadata;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::CredentialOracle;
use crate::command::{self, CommandLine, Verb, MAX_COMMAND_LINE};
use crate::config::FtpConfig;
use crate::error::{FtpError, FTP_CANT_OPEN_DATA, FTP_LOCAL_ERROR, FTP_SERVICE_UNAVAILABLE};
use crate::listing;
use crate::reply::Reply;
use crate::session::{LoginPolicy, PassOutcome, Session, UserOutcome};
use crate::signals::interruptible;
use crate::sync::{SyncError, SyncMessage, SyncWriter, TransferStatus, WorkerId, XferInfo};
use crate::transfer::{classify, Direction, Transfer};
use crate::vfs::{basename, Jail, PathPair, MAX_NAME};

/// Shared, read-only inputs of every worker.
#[derive(Clone)]
pub struct WorkerContext {
    /// Server configuration
    pub config: Arc<FtpConfig>,
    /// Verifies named logins
    pub oracle: Arc<dyn CredentialOracle>,
}

/// Reports a worker's exit to the master when dropped, however the worker
/// ends.
#[derive(Debug)]
pub struct ExitGuard {
    id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerId>,
}

impl ExitGuard {
    /// Arms a guard for worker `id`.
    pub fn new(id: WorkerId, tx: mpsc::UnboundedSender<WorkerId>) -> Self {
        Self { id, tx }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        // The master may already be gone during shutdown.
        let _ = self.tx.send(self.id);
    }
}

/// Failures that end a connection.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The control connection broke
    #[error("control connection: {0}")]
    Control(#[from] io::Error),
    /// The State-Sync channel failed
    #[error("state sync: {0}")]
    Sync(#[from] SyncError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

enum LineRead {
    Line,
    Closed,
    Idle,
    Shutdown,
    TooLong,
}

enum DataConn {
    Open(TcpStream),
    Failed,
    Shutdown,
}

/// Serves one control connection until it closes.
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: WorkerContext,
    sync: SyncWriter,
    cancel: CancellationToken,
    exit: ExitGuard,
) {
    let _exit = exit;
    let id = sync.id();

    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(worker = %id, error = %e, "couldn't get socket name");
            return;
        }
    };

    info!(worker = %id, peer = %peer, "client connected");

    let (read_half, write_half) = stream.into_split();
    let mut worker = Worker {
        ctx,
        session: Session::new(),
        reader: BufReader::new(read_half),
        writer: write_half,
        sync,
        cancel,
        local,
        passive: None,
    };

    match worker.run().await {
        Ok(()) => {}
        Err(WorkerError::Control(e)) => debug!(worker = %id, error = %e, "control connection failed"),
        Err(e) => error!(worker = %id, error = %e, "closing connection"),
    }

    if worker.cancel.is_cancelled() {
        let _ = worker.writer.write_all(b"421 Goodbye!\r\n").await;
    }

    let login = worker.session.identity().map(|identity| identity.name.as_str());
    info!(worker = %id, peer = %peer, login = login.unwrap_or("-"), "connection closed");
}

struct Worker {
    ctx: WorkerContext,
    session: Session,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    sync: SyncWriter,
    cancel: CancellationToken,
    local: SocketAddr,
    passive: Option<TcpListener>,
}

impl Worker {
    async fn run(&mut self) -> Result<(), WorkerError> {
        let banner = format!("{} ready", self.ctx.config.server_name);
        self.reply(Reply::new(220, banner)).await?;

        let mut line = Vec::with_capacity(MAX_COMMAND_LINE);
        loop {
            line.clear();
            let flow = match self.read_line(&mut line).await? {
                LineRead::Line => self.handle_line(&line).await?,
                LineRead::Closed | LineRead::Shutdown => Flow::Close,
                LineRead::Idle => {
                    info!(worker = %self.sync.id(), "idle timeout");
                    self.reply(Reply::new(FTP_SERVICE_UNAVAILABLE, "Goodbye!")).await?;
                    Flow::Close
                }
                LineRead::TooLong => {
                    self.reply(Reply::new(FTP_SERVICE_UNAVAILABLE, "Command line too long"))
                        .await?;
                    Flow::Close
                }
            };
            if flow == Flow::Close {
                return Ok(());
            }
        }
    }

    async fn read_line(&mut self, line: &mut Vec<u8>) -> Result<LineRead, WorkerError> {
        let idle = self.ctx.config.idle_timeout();
        let mut limited = (&mut self.reader).take(MAX_COMMAND_LINE as u64);
        let read = limited.read_until(b'\n', line);

        match interruptible(&self.cancel, tokio::time::timeout(idle, read)).await {
            None => Ok(LineRead::Shutdown),
            Some(Err(_)) => Ok(LineRead::Idle),
            Some(Ok(Err(e))) if e.kind() == io::ErrorKind::ConnectionReset => Ok(LineRead::Closed),
            Some(Ok(Err(e))) => Err(e.into()),
            Some(Ok(Ok(0))) => Ok(LineRead::Closed),
            Some(Ok(Ok(_))) if line.ends_with(b"\n") => Ok(LineRead::Line),
            Some(Ok(Ok(_))) if line.len() >= MAX_COMMAND_LINE => Ok(LineRead::TooLong),
            Some(Ok(Ok(_))) => Ok(LineRead::Closed),
        }
    }

    async fn reply(&mut self, reply: Reply) -> Result<(), WorkerError> {
        let text = reply.to_string();
        debug!(worker = %self.sync.id(), "---> {}", text.trim_end());
        self.writer.write_all(text.as_bytes()).await?;
        Ok(())
    }

    async fn handle_line(&mut self, raw: &[u8]) -> Result<Flow, WorkerError> {
        let text = String::from_utf8_lossy(raw);
        let cmd = CommandLine::parse(&text);
        debug!(worker = %self.sync.id(), "<--- {}", cmd);

        let Some(spec) = command::lookup(cmd.verb) else {
            self.reply(Reply::new(500, "Unknown command")).await?;
            return Ok(Flow::Continue);
        };

        // A pending REST belongs to this transfer command even if it is refused.
        let restart = match spec.verb {
            Verb::Retr | Verb::Stor => self.session.take_restart(),
            _ => 0,
        };

        if let Err(failed) = spec.check(self.session.is_logged_in(), self.passive.is_some(), cmd.arg) {
            self.reply(failed.reply()).await?;
            return Ok(Flow::Continue);
        }

        self.dispatch(spec.verb, cmd.arg, restart).await
    }

    async fn dispatch(&mut self, verb: Verb, arg: &str, restart: u64) -> Result<Flow, WorkerError> {
        let reply = match verb {
            Verb::Abor => Reply::new(226, "Abort successful"),
            Verb::Acct => Reply::new(202, "ACCT is obsolete"),
            Verb::Allo => Reply::new(202, "ALLO is obsolete"),
            Verb::Cdup => self.change_dir("..").await?,
            Verb::Clnt => Reply::new(200, "Noted"),
            Verb::Cwd => self.change_dir(arg).await?,
            Verb::Dele => match self.unlink(arg).await {
                Ok(_) => Reply::new(250, "File deleted"),
                Err(e) => self.fs_error(e),
            },
            Verb::Feat => feat_reply(),
            Verb::List => return self.list(arg).await,
            Verb::Mdtm => match self.stat(arg).await {
                Ok((_, md)) if md.is_file() => {
                    Reply::new(213, listing::format_mdtm(listing::mtime(&md)))
                }
                Ok(_) => Reply::new(550, "Can only time regular files"),
                Err(e) => self.fs_error(e),
            },
            Verb::Mkd => match self.mkdir(arg).await {
                Ok(_) => Reply::new(257, format!("\"{}\" created", quote(arg))),
                Err(e) => self.fs_error(e),
            },
            Verb::Noop => Reply::new(200, "Zzz"),
            Verb::Opts => Reply::new(501, "No such command"),
            Verb::Pass => return self.pass(arg).await,
            Verb::Pasv => self.pasv().await,
            Verb::Pwd => Reply::new(
                257,
                format!("\"{}\" is your current location", quote(self.session.cwd())),
            ),
            Verb::Quit => {
                self.reply(Reply::new(221, "Goodbye!")).await?;
                return Ok(Flow::Close);
            }
            Verb::Rest => self.rest(arg),
            Verb::Retr => return self.retr(arg, restart).await,
            Verb::Rmd => match self.rmdir(arg).await {
                Ok(_) => Reply::new(250, "Directory removed"),
                Err(e) => self.fs_error(e),
            },
            Verb::Size => match self.stat(arg).await {
                Ok((_, md)) if md.is_file() => Reply::new(213, md.len().to_string()),
                Ok(_) => Reply::new(550, "Can only size regular files"),
                Err(e) => self.fs_error(e),
            },
            Verb::Stor => return self.stor(arg, restart).await,
            Verb::Syst => Reply::new(215, "UNIX Type: L8"),
            Verb::Type => type_reply(arg),
            Verb::User => self.user(arg),
        };

        self.reply(reply).await?;
        Ok(Flow::Continue)
    }

    fn fs_error(&self, err: FtpError) -> Reply {
        if !err.is_expected() {
            warn!(worker = %self.sync.id(), error = %err, "filesystem error");
        }
        err.reply()
    }

    fn jail(&self) -> Result<&Jail, FtpError> {
        self.session.jail()
    }

    async fn stat(&self, arg: &str) -> Result<(PathPair, Metadata), FtpError> {
        self.jail()?.stat(self.session.cwd(), arg).await
    }

    async fn mkdir(&self, arg: &str) -> Result<PathPair, FtpError> {
        self.jail()?.mkdir(self.session.cwd(), arg).await
    }

    async fn rmdir(&self, arg: &str) -> Result<PathPair, FtpError> {
        self.jail()?.rmdir(self.session.cwd(), arg).await
    }

    async fn unlink(&self, arg: &str) -> Result<PathPair, FtpError> {
        self.jail()?.unlink(self.session.cwd(), arg).await
    }

    fn user(&mut self, name: &str) -> Reply {
        let config = Arc::clone(&self.ctx.config);
        let policy = LoginPolicy {
            allow_anonymous: config.allow_anonymous,
            anon_root: &config.anon_root,
            allow_symlinks: config.allow_symlinks,
        };
        match self.session.user(name, &policy) {
            UserOutcome::AnonymousPending => Reply::new(331, "Any pass will do"),
            UserOutcome::PasswordRequired(name) => {
                Reply::new(331, format!("Pass required for user {}", name))
            }
            UserOutcome::AnonymousDisabled => Reply::new(550, "No anonymous connections allowed"),
            UserOutcome::AlreadyLoggedIn => Reply::new(503, "Already logged in"),
        }
    }

    async fn pass(&mut self, password: &str) -> Result<Flow, WorkerError> {
        let ctx = self.ctx.clone();
        let policy = LoginPolicy {
            allow_anonymous: ctx.config.allow_anonymous,
            anon_root: &ctx.config.anon_root,
            allow_symlinks: ctx.config.allow_symlinks,
        };

        match self.session.pass(password, ctx.oracle.as_ref(), &policy) {
            PassOutcome::LoggedIn(identity) => {
                info!(worker = %self.sync.id(), login = %identity.name, "login successful");
                self.sync.send(&SyncMessage::Login(identity.name)).await?;
                self.reply(Reply::new(230, "Login successful")).await?;
            }
            PassOutcome::NoUser => self.reply(Reply::new(503, "Login with USER first")).await?,
            PassOutcome::AlreadyLoggedIn => self.reply(Reply::new(503, "Already logged in")).await?,
            PassOutcome::Failed => {
                warn!(worker = %self.sync.id(), "wrong password entered");
                self.reply(Reply::new(530, "Login failed")).await?;
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    async fn change_dir(&mut self, arg: &str) -> Result<Reply, WorkerError> {
        let (pair, md) = match self.stat(arg).await {
            Ok(found) => found,
            Err(e) => return Ok(self.fs_error(e)),
        };
        if !md.is_dir() {
            return Ok(Reply::new(550, "Not a directory"));
        }

        self.session.set_cwd(pair.virtual_path.clone());
        self.sync.send(&SyncMessage::Chdir(pair.virtual_path)).await?;
        Ok(Reply::new(250, "OK"))
    }

    fn rest(&mut self, arg: &str) -> Reply {
        match arg.trim().parse::<u64>() {
            Ok(offset) if offset < i64::MAX as u64 => {
                self.session.set_restart(offset);
                Reply::new(350, format!("Restarting transfer at {}", offset))
            }
            _ => {
                self.session.set_restart(0);
                Reply::multi(501, ["Invalid seek argument", "Seek reset to 0"])
            }
        }
    }

    async fn pasv(&mut self) -> Reply {
        self.passive = None;

        let advertised = match self.ctx.config.pasv_address {
            Some(ip) => Some(ip),
            None => match self.local.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(ip) => ip.to_ipv4_mapped(),
            },
        };
        let Some(advertised) = advertised else {
            warn!(worker = %self.sync.id(), "no IPv4 address to advertise");
            return Reply::new(FTP_CANT_OPEN_DATA, "Can't open data connection");
        };

        let config = &self.ctx.config;
        match bind_passive(config.pasv_port_start, config.pasv_port_end).await {
            Ok(listener) => {
                let port = match listener.local_addr() {
                    Ok(addr) => addr.port(),
                    Err(e) => return self.fs_error(FtpError::Passive { reason: e.to_string() }),
                };
                debug!(worker = %self.sync.id(), port, "passive listener open");
                self.passive = Some(listener);
                pasv_reply(advertised, port)
            }
            Err(e) => self.fs_error(e),
        }
    }

    /// Accepts the single data connection of the current passive session.
    async fn accept_data(&mut self) -> Result<DataConn, WorkerError> {
        let Some(listener) = self.passive.take() else {
            self.reply(Reply::new(FTP_CANT_OPEN_DATA, "Cannot open data connection"))
                .await?;
            return Ok(DataConn::Failed);
        };

        let idle = self.ctx.config.idle_timeout();
        match interruptible(&self.cancel, tokio::time::timeout(idle, listener.accept())).await {
            None => Ok(DataConn::Shutdown),
            Some(Ok(Ok((stream, addr)))) => {
                debug!(worker = %self.sync.id(), data_peer = %addr, "data connection open");
                Ok(DataConn::Open(stream))
            }
            Some(Ok(Err(e))) => {
                warn!(worker = %self.sync.id(), error = %e, "unable to accept data connection");
                self.reply(Reply::new(FTP_CANT_OPEN_DATA, "Cannot open data connection"))
                .await?;
                Ok(DataConn::Failed)
            }
            Some(Err(_)) => {
                warn!(worker = %self.sync.id(), "no data connection before timeout");
                self.reply(Reply::new(FTP_CANT_OPEN_DATA, "Cannot open data connection"))
                .await?;
                Ok(DataConn::Failed)
            }
        }
    }

    async fn list(&mut self, arg: &str) -> Result<Flow, WorkerError> {
        let (opts, path) = listing::parse_list_args(arg);
        let path = if path.is_empty() { "." } else { path };

        let (pair, md) = match self.stat(path).await {
            Ok(found) => found,
            Err(e) => {
                let reply = self.fs_error(e);
                self.reply(reply).await?;
                return Ok(Flow::Continue);
            }
        };

        let mut data = match self.accept_data().await? {
            DataConn::Open(stream) => stream,
            DataConn::Failed => return Ok(Flow::Continue),
            DataConn::Shutdown => return Ok(Flow::Close),
        };

        self.reply(Reply::new(125, "Data connection OK, transferring listing"))
            .await?;

        let rendered = match self.jail() {
            Ok(jail) => listing::render(jail, &pair, &md, opts).await,
            Err(e) => Err(e),
        };
        let body = match rendered {
            Ok(lines) => lines.concat(),
            Err(e) => {
                if !e.is_expected() {
                    warn!(worker = %self.sync.id(), error = %e, "listing failed");
                }
                drop(data);
                self.reply(Reply::new(450, "Error during transfer")).await?;
                return Ok(Flow::Continue);
            }
        };

        let sent = interruptible(&self.cancel, data.write_all(body.as_bytes())).await;
        let _ = data.shutdown().await;
        drop(data);

        let reply = match sent {
            None => return Ok(Flow::Close),
            Some(Ok(())) => Reply::new(226, "Listing sent OK"),
            Some(Err(e)) => match classify(&e) {
                TransferStatus::Aborted => Reply::new(226, "Listing aborted"),
                _ => {
                    warn!(worker = %self.sync.id(), error = %e, "error sending listing");
                    Reply::new(450, "Error during transfer")
                }
            },
        };
        self.reply(reply).await?;
        Ok(Flow::Continue)
    }

    async fn retr(&mut self, arg: &str, offset: u64) -> Result<Flow, WorkerError> {
        let name = basename(arg);
        if name.len() >= MAX_NAME {
            self.reply(Reply::new(550, "Filename too long")).await?;
            return Ok(Flow::Continue);
        }

        let opened = match self.stat(arg).await {
            Ok((_, md)) if !md.is_file() => Err(Reply::new(550, "Can only retrieve regular files")),
            Ok((_, md)) => match self.open(arg).await {
                Ok(file) => Ok((file, md.len())),
                Err(e) => Err(self.fs_error(e)),
            },
            Err(e) => Err(self.fs_error(e)),
        };
        let (mut file, size) = match opened {
            Ok(opened) => opened,
            Err(reply) => {
                self.reply(reply).await?;
                return Ok(Flow::Continue);
            }
        };

        let mut data = match self.accept_data().await? {
            DataConn::Open(stream) => stream,
            DataConn::Failed => return Ok(Flow::Continue),
            DataConn::Shutdown => return Ok(Flow::Close),
        };

        if offset > size {
            drop(data);
            self.reply(Reply::new(
                FTP_LOCAL_ERROR,
                format!(
                    "Restarting position {} too large for file {} of size {}",
                    offset, name, size
                ),
            ))
            .await?;
            return Ok(Flow::Continue);
        }

        self.reply(Reply::new(125, "Data connection OK, transfer starting"))
            .await?;
        self.sync.send(&SyncMessage::XferStart(name.to_string())).await?;

        let rate = self.ctx.config.rate_limit();
        let mut transfer = Transfer::begin(&mut self.session.info, rate, &self.sync, &self.cancel);
        let status = transfer
            .send_file(&mut file, offset, size - offset, &mut data)
            .await?;
        let stop = transfer.finish(status, Direction::Download);
        drop(data);

        self.end_transfer(status, stop).await
    }

    async fn stor(&mut self, arg: &str, offset: u64) -> Result<Flow, WorkerError> {
        let name = basename(arg);
        if name.len() >= MAX_NAME {
            self.reply(Reply::new(550, "Filename too long")).await?;
            return Ok(Flow::Continue);
        }

        let created = match self.jail() {
            Ok(jail) => jail.create(self.session.cwd(), arg, offset).await,
            Err(e) => Err(e),
        };
        let mut file = match created {
            Ok((_, file)) => file,
            Err(e) => {
                let reply = self.fs_error(e);
                self.reply(reply).await?;
                return Ok(Flow::Continue);
            }
        };

        let mut data = match self.accept_data().await? {
            DataConn::Open(stream) => stream,
            DataConn::Failed => return Ok(Flow::Continue),
            DataConn::Shutdown => return Ok(Flow::Close),
        };

        self.reply(Reply::new(125, "Data connection OK, transfer starting"))
            .await?;
        self.sync.send(&SyncMessage::XferStart(name.to_string())).await?;

        let rate = self.ctx.config.rate_limit();
        let mut transfer = Transfer::begin(&mut self.session.info, rate, &self.sync, &self.cancel);
        let status = transfer.copy(&mut data, &mut file).await?;
        let stop = transfer.finish(status, Direction::Upload);
        drop(data);

        self.end_transfer(status, stop).await
    }

    async fn open(&self, arg: &str) -> Result<File, FtpError> {
        let (_, file) = self.jail()?.open(self.session.cwd(), arg).await?;
        Ok(file)
    }

    async fn end_transfer(
        &mut self,
        status: TransferStatus,
        stop: XferInfo,
    ) -> Result<Flow, WorkerError> {
        if let Some(reply) = transfer_reply(status) {
            self.reply(reply).await?;
        }
        self.sync.send(&SyncMessage::XferStop(stop)).await?;
        Ok(match status {
            TransferStatus::Shutdown => Flow::Close,
            _ => Flow::Continue,
        })
    }
}

/// Binds the first free port of `start..=end` on all IPv4 interfaces.
pub async fn bind_passive(start: u16, end: u16) -> Result<TcpListener, FtpError> {
    for port in start..=end {
        match TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => {
                return Err(FtpError::Passive {
                    reason: e.to_string(),
                })
            }
        }
    }
    Err(FtpError::Passive {
        reason: format!("no free ports in {}-{}", start, end),
    })
}

/// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
pub fn pasv_reply(ip: Ipv4Addr, port: u16) -> Reply {
    let [h1, h2, h3, h4] = ip.octets();
    Reply::new(
        227,
        format!(
            "Entering Passive Mode ({},{},{},{},{},{})",
            h1,
            h2,
            h3,
            h4,
            port >> 8,
            port & 0xff
        ),
    )
}

/// Doubles embedded quotes for a 257 reply.
pub fn quote(path: &str) -> String {
    path.replace('"', "\"\"")
}

fn feat_reply() -> Reply {
    Reply::multi(
        211,
        ["Extensions supported:", " SIZE", " MDTM", " REST STREAM", "End."],
    )
}

fn type_reply(arg: &str) -> Reply {
    let mut chars = arg.chars();
    match chars.next().map(|c| c.to_ascii_uppercase()) {
        Some('A') => Reply::new(200, "TYPE is now ASCII"),
        Some('I') => Reply::new(200, "TYPE is now BINARY"),
        Some('L') => match chars.as_str().trim() {
            "" | "8" => Reply::multi(504, ["Only 8-bit bytes allowed", "TYPE is now Binary"]),
            _ => Reply::new(504, "Bad parameter"),
        },
        _ => Reply::new(504, "Bad parameter"),
    }
}

fn transfer_reply(status: TransferStatus) -> Option<Reply> {
    match status {
        TransferStatus::Completed => Some(Reply::new(226, "File transfer successful")),
        TransferStatus::Aborted => Some(Reply::new(426, "File transfer aborted")),
        TransferStatus::Failed => Some(Reply::new(450, "Error during transfer")),
        TransferStatus::Shutdown => None,
    }
}
