#![allow(dead_code)] // each test binary uses a different slice of this

//! Shared harness for wire-level integration tests.
//!
//! Assembles the daemon in-process (local + TCP transports feeding one
//! dispatcher over a temp runtime directory) and provides a minimal
//! framed test client. Clients from this process carry the test binary's
//! pid on the local transport; TCP clients claim an arbitrary identity,
//! which the tests use to play separate actors.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use varbus_core::wire::{OPEN_FLAG_NOTIFY_CHANNEL, OpenPayload, PushCode};
use varbus_core::{DaemonConfig, Frame, FrameHeader, RequestCode, StatusCode};
use varbus_daemon::metrics::MetricsRegistry;
use varbus_daemon::state::ServerContext;
use varbus_daemon::transport::local::{LocalIo, LocalTransport};
use varbus_daemon::transport::tcp::{TcpIo, TcpTransport};
use varbus_daemon::transport::ConnIo;

/// Wire-level responses should arrive quickly; only pushes and deferred
/// replies are awaited with this cap so a broken test fails instead of
/// hanging.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestDaemon {
    pub socket: PathBuf,
    pub tcp_addr: SocketAddr,
    _dir: TempDir,
}

/// Starts the daemon in-process and returns its endpoints.
pub async fn spawn_daemon() -> TestDaemon {
    let dir = TempDir::new().expect("tempdir");
    let config = DaemonConfig {
        runtime_dir: dir.path().to_path_buf(),
        tcp_enabled: true,
        metrics_enabled: false,
        ..DaemonConfig::default()
    };
    let metrics = MetricsRegistry::new().expect("metrics").daemon_metrics();
    let (events_tx, events_rx) = mpsc::channel(64);

    let socket = config.socket_path();
    let local = LocalTransport::bind(&socket).expect("bind local");
    tokio::spawn(local.serve(events_tx.clone()));

    let tcp = TcpTransport::bind(0).await.expect("bind tcp");
    let tcp_addr = tcp.local_addr().expect("tcp addr");
    tokio::spawn(tcp.serve(events_tx.clone()));

    tokio::spawn(ServerContext::new(config, metrics).run(events_rx));

    TestDaemon {
        socket,
        tcp_addr,
        _dir: dir,
    }
}

/// A minimal framed client over either transport.
pub struct TestClient<T: ConnIo> {
    io: T,
    pub client_id: u32,
    txn: u32,
}

impl TestClient<LocalIo> {
    /// Connects over the local transport (kernel identity).
    pub async fn connect_local(daemon: &TestDaemon) -> Self {
        let stream = UnixStream::connect(&daemon.socket).await.expect("connect");
        let mut client = Self {
            io: LocalIo::new(stream),
            client_id: 0,
            txn: 0,
        };
        let resp = client.request(RequestCode::Open, 0, 0, Bytes::new()).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        client.client_id = resp.frame.header.param1;
        client
    }

    /// Attaches a notify channel for this process's registration.
    pub async fn attach_notify(daemon: &TestDaemon) -> NotifyChannel {
        let stream = UnixStream::connect(&daemon.socket).await.expect("connect");
        let mut io = LocalIo::new(stream);
        let mut header = FrameHeader::request(RequestCode::Open.wire(), 0, 1);
        header.param1 = OPEN_FLAG_NOTIFY_CHANNEL;
        io.write_frame(Frame::new(header), None).await.expect("send");
        let (ack, _) = read_with_timeout(&mut io).await.expect("ack");
        assert_eq!(ack.header.status, StatusCode::Ok.wire(), "notify attach refused");
        NotifyChannel { io }
    }
}

impl TestClient<TcpIo> {
    /// Connects over TCP with a claimed identity.
    pub async fn connect_tcp(daemon: &TestDaemon, pid: u32, gid: u32) -> Self {
        let stream = TcpStream::connect(daemon.tcp_addr).await.expect("connect");
        let mut client = Self {
            io: TcpIo::new(stream),
            client_id: 0,
            txn: 0,
        };
        let payload = OpenPayload { pid, gid }.encode();
        let resp = client.request(RequestCode::Open, 0, 0, payload).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        client.client_id = resp.frame.header.param1;
        client
    }
}

impl<T: ConnIo> TestClient<T> {
    fn next_txn(&mut self) -> u32 {
        self.txn += 1;
        self.txn
    }

    /// Sends a request and awaits the (possibly deferred) response.
    pub async fn request(
        &mut self,
        code: RequestCode,
        param1: u32,
        param2: u32,
        payload: Bytes,
    ) -> TestResponse {
        self.request_with_fd(code, param1, param2, payload, None).await
    }

    /// Sends a hand-rolled frame verbatim and awaits one response frame.
    pub async fn request_raw(&mut self, header: FrameHeader, payload: Bytes) -> TestResponse {
        self.io
            .write_frame(Frame::with_payload(header, payload), None)
            .await
            .expect("send request");
        let (frame, fd) = self
            .io
            .read_frame()
            .await
            .expect("read response")
            .expect("connection open");
        TestResponse { frame, fd }
    }

    /// Sends a request carrying a descriptor (local transport only).
    pub async fn request_with_fd(
        &mut self,
        code: RequestCode,
        param1: u32,
        param2: u32,
        payload: Bytes,
        fd: Option<OwnedFd>,
    ) -> TestResponse {
        let txn = self.next_txn();
        let mut header = FrameHeader::request(code.wire(), self.client_id, txn);
        header.param1 = param1;
        header.param2 = param2;
        self.io
            .write_frame(Frame::with_payload(header, payload), fd)
            .await
            .expect("send request");
        let (frame, fd) = self
            .io
            .read_frame()
            .await
            .expect("read response")
            .expect("connection open");
        assert_eq!(frame.header.txn_id, txn, "response correlates to request");
        TestResponse { frame, fd }
    }
}

/// A received response frame plus any descriptor that rode along.
pub struct TestResponse {
    pub frame: Frame,
    pub fd: Option<OwnedFd>,
}

impl TestResponse {
    pub fn status(&self) -> StatusCode {
        StatusCode::from_wire(self.frame.header.status).expect("known status code")
    }
}

/// The client side of an attached notify channel.
pub struct NotifyChannel {
    io: LocalIo,
}

impl NotifyChannel {
    /// Awaits the next push frame.
    pub async fn next_push(&mut self) -> Frame {
        read_with_timeout(&mut self.io).await.expect("push frame").0
    }

    /// Awaits a push and asserts it is a delegation signal, returning
    /// (kind, handle, transaction id).
    pub async fn next_signal(&mut self) -> (u32, u32, u32) {
        let frame = self.next_push().await;
        assert_eq!(frame.header.code, PushCode::Signal.wire());
        (frame.header.param2, frame.header.param1, frame.header.txn_id)
    }
}

async fn read_with_timeout(io: &mut LocalIo) -> Option<(Frame, Option<OwnedFd>)> {
    tokio::time::timeout(TEST_TIMEOUT, io.read_frame())
        .await
        .expect("timed out waiting for frame")
        .expect("read frame")
}
