//! Reconnecting outbound command client.
//!
//! The channel is an explicit `Disconnected -> Connecting -> Connected` state
//! machine. Sends never wait: while the link is down they fail immediately with
//! [`LinkError::NotConnected`] and nothing is queued. Retry scheduling is owned
//! by one supervisor thread that is woken through a channel message, so a burst
//! of failures still produces a single reconnection loop.

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use intercept::VelocityCommand;
use tracing::{debug, info, warn};

use crate::{
    error::LinkError,
    protocol,
    ws::{self, WsStream},
};

/// One live connection. A failed transport is dropped, never reused.
pub trait Transport: Send {
    fn send_text(&mut self, text: &str) -> Result<(), LinkError>;
    fn close(&mut self);
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> Result<Box<dyn Transport>, LinkError>;
    fn endpoint(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on a single blocking write.
    pub send_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_millis(250),
        }
    }
}

pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, options: &ChannelOptions) -> Self {
        Self {
            url: url.into(),
            connect_timeout: options.connect_timeout,
            send_timeout: options.send_timeout,
        }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> Result<Box<dyn Transport>, LinkError> {
        let socket = ws::connect(&self.url, self.connect_timeout)?;
        socket.get_ref().set_write_timeout(Some(self.send_timeout))?;
        Ok(Box::new(WsTransport { socket }))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

struct WsTransport {
    socket: WsStream,
}

impl Transport for WsTransport {
    fn send_text(&mut self, text: &str) -> Result<(), LinkError> {
        ws::send_text(&mut self.socket, text)
    }

    fn close(&mut self) {
        ws::close(&mut self.socket);
    }
}

enum SupervisorMsg {
    Reconnect,
    Shutdown,
}

struct Link {
    state: ChannelState,
    transport: Option<Box<dyn Transport>>,
}

struct Inner<C> {
    connector: C,
    options: ChannelOptions,
    link: Mutex<Link>,
    /// Serializes handshakes; never held while sending.
    connect_guard: Mutex<()>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
}

impl<C: Connector> Inner<C> {
    fn link(&self) -> MutexGuard<'_, Link> {
        match self.link.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Clear the retry flag after a successful reconnect. A send that failed
    /// before the flag cleared had its wakeup swallowed, so re-arm and return
    /// `true` if the link is already down again.
    fn finish_reconnect(&self) -> bool {
        self.reconnecting.store(false, Ordering::SeqCst);
        let dropped_again =
            self.link().state == ChannelState::Disconnected && !self.closed.load(Ordering::SeqCst);
        dropped_again
            && self
                .reconnecting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    fn try_connect(&self) -> Result<(), LinkError> {
        let _guard = match self.connect_guard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        {
            let mut link = self.link();
            if link.state == ChannelState::Connected {
                return Ok(());
            }
            link.state = ChannelState::Connecting;
        }

        let endpoint = self.connector.endpoint();
        debug!("connecting to {endpoint}");
        let result = self.connector.connect();

        let mut link = self.link();
        match result {
            Ok(mut transport) if self.closed.load(Ordering::SeqCst) => {
                transport.close();
                link.state = ChannelState::Disconnected;
                Err(LinkError::NotConnected)
            }
            Ok(transport) => {
                link.transport = Some(transport);
                link.state = ChannelState::Connected;
                info!("command link connected to {endpoint}");
                Ok(())
            }
            Err(err) => {
                link.state = ChannelState::Disconnected;
                Err(err)
            }
        }
    }
}

pub struct CommandChannel<C: Connector> {
    inner: Arc<Inner<C>>,
    supervisor_tx: Sender<SupervisorMsg>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl CommandChannel<WsConnector> {
    pub fn websocket(url: impl Into<String>, options: ChannelOptions) -> Self {
        let connector = WsConnector::new(url, &options);
        Self::new(connector, options)
    }
}

impl<C: Connector> CommandChannel<C> {
    /// Create a disconnected channel and its idle reconnect supervisor.
    pub fn new(connector: C, options: ChannelOptions) -> Self {
        let inner = Arc::new(Inner {
            connector,
            options,
            link: Mutex::new(Link {
                state: ChannelState::Disconnected,
                transport: None,
            }),
            connect_guard: Mutex::new(()),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let (supervisor_tx, supervisor_rx) = unbounded();
        let worker = inner.clone();
        let supervisor = thread::Builder::new()
            .name("link-supervisor".into())
            .spawn(move || supervise(worker, supervisor_rx))
            .expect("failed to spawn link supervisor thread");

        Self {
            inner,
            supervisor_tx,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.inner.connector.endpoint()
    }

    pub fn state(&self) -> ChannelState {
        self.inner.link().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// One handshake attempt. On failure the background retry loop is started.
    pub fn connect(&self) -> Result<(), LinkError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        self.inner.try_connect().inspect_err(|err| {
            warn!("connection to {} failed: {err}", self.endpoint());
            self.request_reconnect();
        })
    }

    pub fn send(&self, command: &VelocityCommand) -> Result<(), LinkError> {
        self.send_text(&protocol::encode(command))
    }

    pub fn send_text(&self, text: &str) -> Result<(), LinkError> {
        let mut link = self.inner.link();
        let transport = match (link.state, link.transport.as_mut()) {
            (ChannelState::Connected, Some(transport)) => transport,
            _ => return Err(LinkError::NotConnected),
        };

        match transport.send_text(text) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(mut broken) = link.transport.take() {
                    broken.close();
                }
                link.state = ChannelState::Disconnected;
                drop(link);
                warn!("send to {} failed, link down: {err}", self.endpoint());
                self.request_reconnect();
                Err(err)
            }
        }
    }

    /// Wake the supervisor unless a retry loop is already active.
    fn request_reconnect(&self) {
        if !self.inner.options.auto_reconnect || self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            && self.supervisor_tx.send(SupervisorMsg::Reconnect).is_err()
        {
            self.inner.reconnecting.store(false, Ordering::SeqCst);
        }
    }

    /// Stop retrying, send a best-effort stop command, then close the link.
    pub fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let supervisor = match self.supervisor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = supervisor {
            let _ = self.supervisor_tx.send(SupervisorMsg::Shutdown);
            let _ = handle.join();
        }

        let mut link = self.inner.link();
        if let Some(mut transport) = link.transport.take() {
            let stop = protocol::encode(&VelocityCommand::STOP);
            if let Err(err) = transport.send_text(&stop) {
                warn!("could not deliver stop command before closing: {err}");
            }
            transport.close();
            info!("command link to {} closed", self.inner.connector.endpoint());
        }
        link.state = ChannelState::Disconnected;
    }
}

impl<C: Connector> Drop for CommandChannel<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn supervise<C: Connector>(inner: Arc<Inner<C>>, rx: Receiver<SupervisorMsg>) {
    loop {
        match rx.recv() {
            Ok(SupervisorMsg::Reconnect) => {}
            Ok(SupervisorMsg::Shutdown) | Err(_) => return,
        }

        loop {
            if !retry_until_connected(&inner, &rx) {
                return;
            }
            if !inner.finish_reconnect() {
                break;
            }
            debug!("link dropped while reconnecting; retrying");
        }
    }
}

/// Retry every `reconnect_delay` until connected. `false` means shut down.
fn retry_until_connected<C: Connector>(inner: &Inner<C>, rx: &Receiver<SupervisorMsg>) -> bool {
    let delay = inner.options.reconnect_delay;
    let mut attempt: u64 = 0;
    loop {
        match rx.recv_timeout(delay) {
            Ok(SupervisorMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
            Ok(SupervisorMsg::Reconnect) | Err(RecvTimeoutError::Timeout) => {}
        }
        if inner.closed.load(Ordering::SeqCst) {
            return false;
        }

        attempt += 1;
        metrics::counter!("link_reconnect_attempts_total").increment(1);
        info!("reconnecting to {} (attempt {attempt})", inner.connector.endpoint());
        match inner.try_connect() {
            Ok(()) => return true,
            Err(err) => warn!("reconnect attempt {attempt} failed: {err}"),
        }
    }
}
