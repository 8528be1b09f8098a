//! NDT control-session state machine.
//!
//! One [`Client::run`] call discovers candidate servers, then drives the
//! control protocol against each in turn: login, queue wait, version and
//! suite announcements, the granted subtests, the final results block,
//! logout, and teardown. A busy server or a failed candidate moves the
//! session on to the next one.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::download;
use crate::emitter::{LogObserver, Observer};
use crate::error::{Error, Result};
use crate::locate;
use crate::msg::{Channel, MsgType};
use crate::net::{self, Conn, Stream};
use crate::params;
use crate::settings::{NettestFlags, ProtocolFlags, Settings, Verbosity};
use crate::upload;
use crate::ws;

/// Shared, serialized handle to the caller's observer.
pub type SharedObserver = Arc<Mutex<dyn Observer + Send>>;

/// An NDT client. Configure it through [`Settings`], then call
/// [`Client::run`] once; the session owns its sockets and releases them on
/// return.
pub struct Client {
    settings: Settings,
    observer: SharedObserver,
    abort: CancellationToken,
}

enum Outcome {
    Complete,
    ServerBusy,
}

impl Client {
    /// A client reporting events to the default stderr observer.
    pub fn new(settings: Settings) -> Self {
        Client::with_observer(settings, Arc::new(Mutex::new(LogObserver::stderr())))
    }

    /// A client reporting events to the given observer.
    pub fn with_observer(settings: Settings, observer: SharedObserver) -> Self {
        Client {
            settings,
            observer,
            abort: CancellationToken::new(),
        }
    }

    /// A token that aborts the run at its next suspension point, releasing
    /// every socket. Partial results are discarded.
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Run one full NDT session.
    pub async fn run(&self) -> Result<()> {
        self.settings.validate()?;
        tokio::select! {
            _ = self.abort.cancelled() => Err(Error::Interrupted),
            outcome = self.run_session() => outcome,
        }
    }

    async fn run_session(&self) -> Result<()> {
        let candidates = if self.settings.hostname.is_empty() {
            locate::query(&self.settings).await?
        } else {
            vec![self.settings.hostname.clone()]
        };
        let port = if self.settings.port.is_empty() {
            self.settings.default_port().to_owned()
        } else {
            self.settings.port.clone()
        };

        let mut last = Error::IoError;
        for hostname in candidates {
            self.emit(Verbosity::Info, |o| {
                o.on_info(&format!("trying {hostname}:{port}"));
            });
            match Session::attempt(self, hostname.clone(), port.clone()).await {
                Ok(Outcome::Complete) => return Ok(()),
                Ok(Outcome::ServerBusy) => {}
                Err(err) => {
                    self.emit(Verbosity::Debug, |o| {
                        o.on_debug(&format!("candidate {hostname} failed: {err}"));
                    });
                    last = err;
                }
            }
        }
        Err(last)
    }

    fn emit(&self, level: Verbosity, call: impl FnOnce(&mut dyn Observer)) {
        if self.settings.verbosity >= level {
            let mut observer = self.observer.lock().unwrap_or_else(|err| err.into_inner());
            call(&mut *observer);
        }
    }
}

/// One candidate attempt: the control channel plus everything the subtest
/// engines need to reach the same server again.
pub(crate) struct Session {
    pub(crate) settings: Settings,
    pub(crate) observer: SharedObserver,
    pub(crate) hostname: String,
    pub(crate) channel: Channel<Stream>,
    suite: Vec<u8>,
}

impl Session {
    async fn attempt(client: &Client, hostname: String, port: String) -> Result<Outcome> {
        let settings = client.settings.clone();
        let json = settings.protocol_flags.contains(ProtocolFlags::JSON);
        let websocket = settings.protocol_flags.contains(ProtocolFlags::WEBSOCKET);

        let conn = net::dial_stack(
            &settings,
            &hostname,
            &port,
            ws::F_ALL,
            params::WS_PROTO_CONTROL,
        )
        .await?;
        let channel = Channel::new(conn, json, websocket);

        let mut session = Session {
            settings,
            observer: Arc::clone(&client.observer),
            hostname,
            channel,
            suite: Vec::new(),
        };

        session.send_login().await?;
        session.recv_kickoff().await?;
        if !session.wait_in_queue().await? {
            return Ok(Outcome::ServerBusy);
        }
        session.recv_version().await?;
        session.recv_tests_ids().await?;
        session.run_tests().await?;
        session.recv_results_and_logout().await?;
        session.wait_close().await?;
        session.emit_info("session complete");
        Ok(Outcome::Complete)
    }

    /// Request our subtests. The status flag is always set: the server
    /// requires it to speak the extended protocol.
    async fn send_login(&mut self) -> Result<()> {
        let tests = self.settings.nettest_flags | NettestFlags::STATUS;
        let kind = if self.settings.protocol_flags.contains(ProtocolFlags::JSON) {
            MsgType::ExtendedLogin
        } else {
            MsgType::Login
        };
        self.channel.msg_write(kind, &tests.bits().to_string()).await
    }

    /// Plain-protocol servers send a fixed 13-octet banner before queueing.
    async fn recv_kickoff(&mut self) -> Result<()> {
        if self.settings.protocol_flags.contains(ProtocolFlags::JSON)
            || self.settings.protocol_flags.contains(ProtocolFlags::WEBSOCKET)
        {
            self.emit_debug("kickoff: skipped in json/websocket mode");
            return Ok(());
        }
        let mut banner = [0u8; 13];
        self.channel.conn_mut().recvn(&mut banner).await?;
        if &banner != params::KICKOFF {
            return Err(Error::WsProto);
        }
        Ok(())
    }

    /// Poll SRV_QUEUE until the server is ready. Returns `false` when the
    /// server declares itself busy, which is not an error.
    ///
    /// `9990` is a keepalive; any other nonzero value is a wait hint in
    /// seconds, so the next read's deadline stretches to cover it.
    async fn wait_in_queue(&mut self) -> Result<bool> {
        let ready = loop {
            let value = self.channel.msg_expect(MsgType::SrvQueue).await?;
            let value = value.trim().to_owned();
            match value.as_str() {
                params::QUEUE_READY => break true,
                params::QUEUE_BUSY => {
                    let mut observer =
                        self.observer.lock().unwrap_or_else(|err| err.into_inner());
                    observer.on_server_busy(&value);
                    break false;
                }
                params::QUEUE_HEARTBEAT => self.emit_debug("queue: keepalive"),
                other => {
                    let wait: u64 = other.parse().map_err(|_| Error::WsProto)?;
                    self.emit_info(&format!("queued, expected wait ~{wait} s"));
                    let stretched = self.settings.timeout + std::time::Duration::from_secs(wait);
                    self.channel.conn_mut().set_deadline(stretched);
                }
            }
        };
        self.channel.conn_mut().set_deadline(self.settings.timeout);
        Ok(ready)
    }

    async fn recv_version(&mut self) -> Result<()> {
        let version = self.channel.msg_expect(MsgType::Login).await?;
        self.emit_debug(&format!("server version: {version}"));
        Ok(())
    }

    async fn recv_tests_ids(&mut self) -> Result<()> {
        let ids = self.channel.msg_expect(MsgType::Login).await?;
        for token in ids.split_ascii_whitespace() {
            let id: u8 = token.parse().map_err(|_| Error::WsProto)?;
            self.suite.push(id);
        }
        self.emit_debug(&format!("granted suite: {:?}", self.suite));
        Ok(())
    }

    /// Run every granted subtest in the server's declared order.
    async fn run_tests(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.suite) {
            let flag = NettestFlags(id);
            match flag {
                NettestFlags::UPLOAD | NettestFlags::UPLOAD_EXT => {
                    upload::run(self, flag).await?
                }
                NettestFlags::DOWNLOAD | NettestFlags::DOWNLOAD_EXT => {
                    download::run(self, flag).await?
                }
                NettestFlags::META => self.run_meta().await?,
                _ => {
                    self.emit_warning(&format!("skipping unhandled test id {id}"));
                    self.run_passive().await?;
                }
            }
        }
        Ok(())
    }

    /// Consume a granted subtest we do not measure: PREPARE, START and any
    /// TEST_MSGs, through to TEST_FINALIZE.
    async fn run_passive(&mut self) -> Result<()> {
        loop {
            let (kind, _body) = self.channel.msg_read().await?;
            match kind {
                MsgType::TestPrepare | MsgType::TestStart | MsgType::TestMsg => {}
                MsgType::TestFinalize => return Ok(()),
                _ => return Err(Error::WsProto),
            }
        }
    }

    /// The META subtest: one `key:value` TEST_MSG per metadata entry, then
    /// an empty terminator.
    async fn run_meta(&mut self) -> Result<()> {
        self.channel.msg_expect_empty(MsgType::TestPrepare).await?;
        self.channel.msg_expect_empty(MsgType::TestStart).await?;
        for (key, value) in &self.settings.metadata {
            self.channel
                .msg_write(MsgType::TestMsg, &format!("{key}:{value}"))
                .await?;
        }
        self.channel.msg_write(MsgType::TestMsg, "").await?;
        self.channel.msg_expect_empty(MsgType::TestFinalize).await?;
        Ok(())
    }

    /// Read RESULTS blocks until the server logs us out.
    async fn recv_results_and_logout(&mut self) -> Result<()> {
        loop {
            let (kind, body) = self.channel.msg_read().await?;
            match kind {
                MsgType::Results => self.emit_keyed_results(&body),
                MsgType::Logout => return Ok(()),
                _ => return Err(Error::WsProto),
            }
        }
    }

    /// Linger briefly for the peer's close, then shut down both ends.
    async fn wait_close(&mut self) -> Result<()> {
        let conn = self.channel.conn_mut();
        conn.set_deadline(params::CLOSE_GRACE);
        let mut scrap = [0u8; 512];
        loop {
            match conn.recv(&mut scrap).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = conn.shutdown().await;
        Ok(())
    }

    /// Dial one measurement connection through the same stack as the
    /// control connection. Measurement upgrades do not require the
    /// subprotocol echo, matching the reference server.
    pub(crate) async fn dial_measurement(
        &self,
        port: &str,
        ws_protocol: &str,
    ) -> Result<Conn<Stream>> {
        net::dial_stack(
            &self.settings,
            &self.hostname,
            port,
            ws::F_CONNECTION | ws::F_SEC_WS_ACCEPT | ws::F_UPGRADE,
            ws_protocol,
        )
        .await
    }

    /// Split a newline-separated `key: value` block into scoped results.
    ///
    /// `web100.*` and `tcp_info.*` prefixes select their scope and are
    /// stripped from the name; everything else lands in `summary`.
    pub(crate) fn emit_keyed_results(&self, block: &str) {
        for line in block.lines() {
            let Some((name, value)) = line.split_once(':') else {
                if !line.trim().is_empty() {
                    self.emit_warning(&format!("malformed result line: {line}"));
                }
                continue;
            };
            let name = name.trim();
            let value = value.trim();
            let (scope, name) = if let Some(rest) = name.strip_prefix("web100.") {
                ("web100", rest)
            } else if let Some(rest) = name.strip_prefix("tcp_info.") {
                ("tcp_info", rest)
            } else {
                ("summary", name)
            };
            self.emit_result(scope, name, value);
        }
    }

    pub(crate) fn emit_result(&self, scope: &str, name: &str, value: &str) {
        let mut observer = self.observer.lock().unwrap_or_else(|err| err.into_inner());
        observer.on_result(scope, name, value);
    }

    pub(crate) fn emit_performance(
        &self,
        tid: NettestFlags,
        nflows: u8,
        measured_bytes: f64,
        measurement_interval: f64,
        elapsed: f64,
        max_runtime: f64,
    ) {
        let mut observer = self.observer.lock().unwrap_or_else(|err| err.into_inner());
        observer.on_performance(
            tid,
            nflows,
            measured_bytes,
            measurement_interval,
            elapsed,
            max_runtime,
        );
    }

    pub(crate) fn emit_warning(&self, msg: &str) {
        if self.settings.verbosity >= Verbosity::Warning {
            let mut observer = self.observer.lock().unwrap_or_else(|err| err.into_inner());
            observer.on_warning(msg);
        }
    }

    pub(crate) fn emit_info(&self, msg: &str) {
        if self.settings.verbosity >= Verbosity::Info {
            let mut observer = self.observer.lock().unwrap_or_else(|err| err.into_inner());
            observer.on_info(msg);
        }
    }

    pub(crate) fn emit_debug(&self, msg: &str) {
        if self.settings.verbosity >= Verbosity::Debug {
            let mut observer = self.observer.lock().unwrap_or_else(|err| err.into_inner());
            observer.on_debug(msg);
        }
    }
}
