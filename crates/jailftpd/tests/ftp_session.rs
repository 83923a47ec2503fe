//! End-to-end tests: a real server on loopback driven by a minimal client.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jailftpd::auth::{CredentialOracle, UserTable};
use jailftpd::config::UserEntry;
use jailftpd::daemon::ServerError;
use jailftpd::{FtpConfig, Server};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), ServerError>>,
}

fn test_config(root: &Path) -> FtpConfig {
    FtpConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        anon_root: root.to_path_buf(),
        ..FtpConfig::default()
    }
}

async fn start(config: FtpConfig) -> TestServer {
    let oracle: Arc<dyn CredentialOracle> = Arc::new(UserTable::from_config(&config));
    let shutdown = CancellationToken::new();
    let server = Server::bind(Arc::new(config), oracle, shutdown.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(server.run());
    TestServer {
        addr,
        shutdown,
        handle,
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    async fn line(&mut self) -> String {
        let mut line = String::new();
        timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("reply timed out")
            .unwrap();
        line
    }

    /// Reads one complete reply, joining multi-line replies.
    async fn reply(&mut self) -> String {
        let first = self.line().await;
        let mut text = first.clone();
        if first.as_bytes().get(3) == Some(&b'-') {
            let end = format!("{} ", &first[..3]);
            loop {
                let next = self.line().await;
                assert!(!next.is_empty(), "connection closed inside a reply");
                text.push_str(&next);
                if next.starts_with(&end) {
                    break;
                }
            }
        }
        text
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.reply().await
    }

    async fn login_anonymous(&mut self) {
        assert!(self.reply().await.starts_with("220 "));
        assert!(self.cmd("USER anonymous").await.starts_with("331 "));
        assert_eq!(self.cmd("PASS guest@").await, "230 Login successful\r\n");
    }

    /// Enters passive mode and opens the data connection.
    async fn pasv(&mut self) -> TcpStream {
        let reply = self.cmd("PASV").await;
        assert!(reply.starts_with("227 "), "{}", reply);
        let open = reply.find('(').unwrap();
        let close = reply.find(')').unwrap();
        let nums: Vec<u16> = reply[open + 1..close]
            .split(',')
            .map(|n| n.parse().unwrap())
            .collect();
        assert_eq!(nums.len(), 6);
        let ip = Ipv4Addr::new(nums[0] as u8, nums[1] as u8, nums[2] as u8, nums[3] as u8);
        let port = nums[4] << 8 | nums[5];
        TcpStream::connect(SocketAddrV4::new(ip, port)).await.unwrap()
    }

    async fn closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(
            timeout(WAIT, self.reader.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}

async fn read_all(mut data: TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    timeout(WAIT, data.read_to_end(&mut out))
        .await
        .expect("data timed out")
        .unwrap();
    out
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_greeting_and_preconditions() {
    let root = TempDir::new().unwrap();
    let server = start(test_config(root.path())).await;
    let mut client = Client::connect(server.addr).await;

    assert_eq!(client.reply().await, "220 jailftpd ready\r\n");
    assert_eq!(client.cmd("PWD").await, "530 You're not logged in\r\n");
    assert_eq!(client.cmd("XYZZY").await, "500 Unknown command\r\n");
    assert_eq!(client.cmd("syst").await, "215 UNIX Type: L8\r\n");
    assert_eq!(client.cmd("NOOP").await, "200 Zzz\r\n");
    assert_eq!(
        client.cmd("FEAT").await,
        "211-Extensions supported:\r\n SIZE\r\n MDTM\r\n REST STREAM\r\n211 End.\r\n"
    );
    assert_eq!(client.cmd("OPTS UTF8 ON").await, "501 No such command\r\n");
    assert_eq!(client.cmd("QUIT").await, "221 Goodbye!\r\n");
    assert!(client.closed().await);

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_anonymous_login_and_navigation() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir(root.path().join("pub")).unwrap();
    std::fs::write(root.path().join("pub/readme"), b"hello").unwrap();
    let server = start(test_config(root.path())).await;
    let mut client = Client::connect(server.addr).await;
    client.login_anonymous().await;

    assert_eq!(client.cmd("PWD").await, "257 \"/\" is your current location\r\n");
    assert_eq!(client.cmd("CWD pub").await, "250 OK\r\n");
    assert_eq!(client.cmd("PWD").await, "257 \"/pub\" is your current location\r\n");
    assert_eq!(client.cmd("CWD readme").await, "550 Not a directory\r\n");
    assert_eq!(client.cmd("CWD missing").await, "550 No such file or directory\r\n");
    assert_eq!(client.cmd("PWD").await, "257 \"/pub\" is your current location\r\n");
    assert_eq!(client.cmd("CWD ../../../..").await, "250 OK\r\n");
    assert_eq!(client.cmd("PWD").await, "257 \"/\" is your current location\r\n");
    assert_eq!(client.cmd("CWD /pub").await, "250 OK\r\n");
    assert_eq!(client.cmd("CDUP").await, "250 OK\r\n");
    assert_eq!(client.cmd("PWD").await, "257 \"/\" is your current location\r\n");

    assert_eq!(client.cmd("SIZE pub/readme").await, "213 5\r\n");
    assert_eq!(client.cmd("SIZE pub").await, "550 Can only size regular files\r\n");
    assert!(client.cmd("MDTM /pub/readme").await.starts_with("213 "));
    assert_eq!(client.cmd("CWD").await, "501 Missing argument\r\n");
    assert_eq!(client.cmd("TYPE I").await, "200 TYPE is now BINARY\r\n");

    assert_eq!(client.cmd("MKD new").await, "257 \"new\" created\r\n");
    assert!(root.path().join("new").is_dir());
    assert_eq!(client.cmd("RMD new").await, "250 Directory removed\r\n");
    assert!(!root.path().join("new").exists());
    assert_eq!(client.cmd("RMD /").await, "550 Permission denied\r\n");
    assert_eq!(client.cmd("DELE pub/readme").await, "250 File deleted\r\n");
    assert!(!root.path().join("pub/readme").exists());

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_login_sequence_errors() {
    let root = TempDir::new().unwrap();
    let server = start(test_config(root.path())).await;
    let mut client = Client::connect(server.addr).await;

    assert!(client.reply().await.starts_with("220 "));
    assert_eq!(client.cmd("PASS nothing").await, "503 Login with USER first\r\n");
    assert_eq!(client.cmd("USER anonymous").await, "331 Any pass will do\r\n");
    assert_eq!(client.cmd("PASS x").await, "230 Login successful\r\n");
    assert_eq!(client.cmd("USER anonymous").await, "503 Already logged in\r\n");
    assert_eq!(client.cmd("PASS x").await, "503 Already logged in\r\n");
    assert_eq!(client.cmd("PWD").await, "257 \"/\" is your current location\r\n");

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_named_user_login() {
    let anon = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    std::fs::write(home.path().join("mine"), b"alice's").unwrap();

    let mut config = test_config(anon.path());
    config.allow_anonymous = false;
    config.users = vec![UserEntry {
        name: "alice".to_string(),
        password_sha256: hex::encode(Sha256::digest(b"secret")),
        root: home.path().to_path_buf(),
    }];
    let server = start(config).await;

    let mut client = Client::connect(server.addr).await;
    assert!(client.reply().await.starts_with("220 "));
    assert_eq!(
        client.cmd("USER anonymous").await,
        "550 No anonymous connections allowed\r\n"
    );
    assert_eq!(client.cmd("USER alice").await, "331 Pass required for user alice\r\n");
    assert_eq!(client.cmd("PASS wrong").await, "530 Login failed\r\n");
    assert!(client.closed().await);

    let mut client = Client::connect(server.addr).await;
    assert!(client.reply().await.starts_with("220 "));
    client.cmd("USER alice").await;
    assert_eq!(client.cmd("PASS secret").await, "230 Login successful\r\n");
    assert_eq!(client.cmd("SIZE /mine").await, "213 7\r\n");

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_retr_with_restart_offset_consumed() {
    let root = TempDir::new().unwrap();
    let content = pattern(1000);
    std::fs::write(root.path().join("file.bin"), &content).unwrap();
    let server = start(test_config(root.path())).await;
    let mut client = Client::connect(server.addr).await;
    client.login_anonymous().await;

    assert_eq!(client.cmd("RETR file.bin").await, "425 Cannot open data connection\r\n");

    let data = client.pasv().await;
    assert_eq!(client.cmd("REST 500").await, "350 Restarting transfer at 500\r\n");
    assert_eq!(
        client.cmd("RETR file.bin").await,
        "125 Data connection OK, transfer starting\r\n"
    );
    assert_eq!(read_all(data).await, &content[500..]);
    assert_eq!(client.reply().await, "226 File transfer successful\r\n");

    let data = client.pasv().await;
    client.cmd("RETR file.bin").await;
    assert_eq!(read_all(data).await, content);
    assert_eq!(client.reply().await, "226 File transfer successful\r\n");

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_restart_consumed_by_refused_transfer() {
    let root = TempDir::new().unwrap();
    let content = pattern(1000);
    std::fs::write(root.path().join("file.bin"), &content).unwrap();
    std::fs::write(root.path().join("up.bin"), b"0123456789").unwrap();
    let server = start(test_config(root.path())).await;
    let mut client = Client::connect(server.addr).await;
    client.login_anonymous().await;

    assert_eq!(client.cmd("REST 500").await, "350 Restarting transfer at 500\r\n");
    assert_eq!(client.cmd("RETR file.bin").await, "425 Cannot open data connection\r\n");
    let data = client.pasv().await;
    client.cmd("RETR file.bin").await;
    assert_eq!(read_all(data).await, content);
    assert_eq!(client.reply().await, "226 File transfer successful\r\n");

    assert_eq!(client.cmd("REST 4").await, "350 Restarting transfer at 4\r\n");
    assert_eq!(client.cmd("STOR up.bin").await, "425 Cannot open data connection\r\n");
    let mut data = client.pasv().await;
    assert_eq!(
        client.cmd("STOR up.bin").await,
        "125 Data connection OK, transfer starting\r\n"
    );
    data.write_all(b"abc").await.unwrap();
    drop(data);
    assert_eq!(client.reply().await, "226 File transfer successful\r\n");
    assert_eq!(std::fs::read(root.path().join("up.bin")).unwrap(), b"abc");

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_peer_disconnect_mid_retr_aborts_transfer() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("big.bin"), pattern(4 << 20)).unwrap();
    let server = start(FtpConfig {
        max_bytes_per_sec: 256 * 1024,
        ..test_config(root.path())
    })
    .await;
    let mut client = Client::connect(server.addr).await;
    client.login_anonymous().await;

    let mut data = client.pasv().await;
    assert_eq!(
        client.cmd("RETR big.bin").await,
        "125 Data connection OK, transfer starting\r\n"
    );
    let mut head = [0u8; 1024];
    timeout(WAIT, data.read_exact(&mut head))
        .await
        .expect("data timed out")
        .unwrap();
    assert_eq!(&head[..], &pattern(1024)[..]);
    // Closing with unread bytes queued resets the connection.
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(data);

    assert_eq!(client.reply().await, "426 File transfer aborted\r\n");
    assert_eq!(client.cmd("NOOP").await, "200 Zzz\r\n");
    assert_eq!(
        client.cmd("PWD").await,
        "257 \"/\" is your current location\r\n"
    );

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_retr_errors() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("small"), b"0123456789").unwrap();
    std::fs::create_dir(root.path().join("dir")).unwrap();
    let server = start(test_config(root.path())).await;
    let mut client = Client::connect(server.addr).await;
    client.login_anonymous().await;

    let _data = client.pasv().await;
    assert_eq!(
        client.cmd("RETR dir").await,
        "550 Can only retrieve regular files\r\n"
    );
    assert_eq!(
        client.cmd("RETR nothing").await,
        "550 No such file or directory\r\n"
    );

    assert_eq!(
        client.cmd("REST abc").await,
        "501-Invalid seek argument\r\n501 Seek reset to 0\r\n"
    );
    assert_eq!(client.cmd("REST 11").await, "350 Restarting transfer at 11\r\n");
    assert_eq!(
        client.cmd("RETR small").await,
        "451 Restarting position 11 too large for file small of size 10\r\n"
    );

    let long = "n".repeat(300);
    let _data = client.pasv().await;
    assert_eq!(
        client.cmd(&format!("RETR {}", long)).await,
        "550 Filename too long\r\n"
    );

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stor_list_and_resume() {
    let root = TempDir::new().unwrap();
    let server = start(test_config(root.path())).await;
    let mut client = Client::connect(server.addr).await;
    client.login_anonymous().await;

    let content = pattern(200_000);
    let mut data = client.pasv().await;
    assert_eq!(
        client.cmd("STOR up.bin").await,
        "125 Data connection OK, transfer starting\r\n"
    );
    data.write_all(&content[..150_000]).await.unwrap();
    data.shutdown().await.unwrap();
    drop(data);
    assert_eq!(client.reply().await, "226 File transfer successful\r\n");

    let mut data = client.pasv().await;
    client.cmd("REST 150000").await;
    client.cmd("STOR up.bin").await;
    data.write_all(&content[150_000..]).await.unwrap();
    data.shutdown().await.unwrap();
    drop(data);
    assert_eq!(client.reply().await, "226 File transfer successful\r\n");
    assert_eq!(std::fs::read(root.path().join("up.bin")).unwrap(), content);

    let data = client.pasv().await;
    assert_eq!(
        client.cmd("LIST").await,
        "125 Data connection OK, transferring listing\r\n"
    );
    let listing = String::from_utf8(read_all(data).await).unwrap();
    assert_eq!(client.reply().await, "226 Listing sent OK\r\n");
    let line = listing.lines().find(|l| l.ends_with(" up.bin")).unwrap();
    assert!(line.starts_with('-'));
    assert_eq!(line.split_whitespace().nth(4), Some("200000"));

    let data = client.pasv().await;
    client.cmd("LIST -la /up.bin").await;
    let listing = String::from_utf8(read_all(data).await).unwrap();
    assert_eq!(client.reply().await, "226 Listing sent OK\r\n");
    assert_eq!(listing.lines().count(), 1);

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_max_clients_refuses_extra_connection() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(root.path());
    config.max_clients = Some(2);
    let server = start(config).await;

    let mut first = Client::connect(server.addr).await;
    assert!(first.reply().await.starts_with("220 "));
    let mut second = Client::connect(server.addr).await;
    assert!(second.reply().await.starts_with("220 "));

    let mut third = Client::connect(server.addr).await;
    assert_eq!(third.line().await, "421 Too many clients\r\n");
    assert!(third.closed().await);

    // Both admitted sessions are untouched by the refusal.
    assert_eq!(first.cmd("NOOP").await, "200 Zzz\r\n");
    assert_eq!(second.cmd("NOOP").await, "200 Zzz\r\n");

    first.cmd("QUIT").await;
    assert!(first.closed().await);

    // The slot frees once the master reaps the worker.
    let mut admitted = false;
    for _ in 0..50 {
        let mut next = Client::connect(server.addr).await;
        if next.line().await.starts_with("220 ") {
            admitted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(admitted);

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_per_address_limit() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(root.path());
    config.max_clients_per_addr = Some(1);
    let server = start(config).await;

    let mut first = Client::connect(server.addr).await;
    assert!(first.reply().await.starts_with("220 "));
    let mut second = Client::connect(server.addr).await;
    assert_eq!(
        second.line().await,
        "421 Too many connections from your address\r\n"
    );

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_control_line_limits_and_idle_timeout() {
    let root = TempDir::new().unwrap();
    let mut config = test_config(root.path());
    config.idle_timeout_ms = 300;
    let server = start(config).await;

    let mut client = Client::connect(server.addr).await;
    assert!(client.reply().await.starts_with("220 "));
    client
        .writer
        .write_all("A".repeat(1024).as_bytes())
        .await
        .unwrap();
    assert_eq!(client.line().await, "421 Command line too long\r\n");
    assert!(client.closed().await);

    let mut idle = Client::connect(server.addr).await;
    assert!(idle.reply().await.starts_with("220 "));
    assert_eq!(idle.line().await, "421 Goodbye!\r\n");
    assert!(idle.closed().await);

    server.shutdown.cancel();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_says_goodbye() {
    let root = TempDir::new().unwrap();
    let server = start(test_config(root.path())).await;

    let mut client = Client::connect(server.addr).await;
    client.login_anonymous().await;

    server.shutdown.cancel();
    assert_eq!(client.line().await, "421 Goodbye!\r\n");
    assert!(client.closed().await);
    timeout(WAIT, server.handle).await.unwrap().unwrap().unwrap();
}
