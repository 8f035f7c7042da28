use bytes::Bytes;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    engine::CommandSink,
    error::{ErgoError, Result},
    link::{Channel, Link, LinkHandle, Notifier},
    protocol::Command,
    types::{ConnectionState, SessionConfig},
};

/// Task handle that aborts its task when dropped
#[derive(Debug)]
pub(crate) struct AbortOnDrop(JoinHandle<()>);

impl AbortOnDrop {
    pub(crate) const fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Events the session reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Link established
    Connected,
    /// Link torn down
    Disconnected,
    /// Status notification received
    Frame(Bytes),
}

enum LinkState {
    Disconnected,
    Connecting,
    Active(Arc<dyn LinkHandle>),
}

struct Shared {
    expiry: Instant,
    running: bool,
    closed: bool,
    link: LinkState,
}

/// At-most-one-in-flight slot plus one deferred status request
#[derive(Debug, Default)]
struct SendGate {
    in_flight: AtomicBool,
    status_pending: AtomicBool,
}

impl SendGate {
    fn try_acquire(&self) -> bool {
        !self.in_flight.swap(true, Ordering::AcqRel)
    }

    /// Remember a status request. Returns `true` when the slot came free in
    /// the meantime and the caller now holds it to write the request itself.
    fn defer_status(&self) -> bool {
        self.status_pending.store(true, Ordering::Release);
        if !self.try_acquire() {
            return false;
        }
        self.status_pending.swap(false, Ordering::AcqRel) || self.finish()
    }

    fn clear_deferred(&self) {
        self.status_pending.store(false, Ordering::Release);
    }

    /// Called by the slot holder after a write. Returns `true` when a
    /// deferred status request must be written next, with the slot kept.
    fn finish(&self) -> bool {
        loop {
            if self.status_pending.swap(false, Ordering::AcqRel) {
                return true;
            }
            self.in_flight.store(false, Ordering::Release);

            // a request deferred between the swap and the release would
            // otherwise sit until some later send
            if !self.status_pending.load(Ordering::Acquire) || !self.try_acquire() {
                return false;
            }
        }
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        !self.in_flight.load(Ordering::Acquire) && !self.status_pending.load(Ordering::Acquire)
    }
}

struct SessionInner {
    link: Arc<dyn Link>,
    config: SessionConfig,
    shared: Mutex<Shared>,
    wake: Notify,
    gate: SendGate,
    events: mpsc::UnboundedSender<SessionEvent>,
}

enum SendOutcome {
    Sent,
    Busy,
    NotConnected,
}

/// Keeps one physical link to the bed alive while callers show interest
///
/// Interest is a sliding deadline: every [`extend_session`](Self::extend_session)
/// pushes it [`SessionConfig::active_time_ms`] into the future and starts the
/// session loop if it is not running. The loop connects, subscribes to status
/// notifications and holds the link until the deadline passes, then
/// disconnects. Transient failures are logged and retried after a cooldown
/// for as long as the deadline lies in the future.
///
/// Cloning is cheap; all clones drive the same session.
///
/// # Examples
///
/// ```no_run
/// use ergobed::{ble::BleLink, session::ConnectionSession, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = SessionConfig::default();
///     let link = BleLink::find("AA:BB:CC:DD:EE:FF", &config).await?;
///     let (session, mut events) = ConnectionSession::new(link, config);
///
///     session.extend_session();
///     while let Some(event) = events.recv().await {
///         println!("{event:?}");
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionSession {
    inner: Arc<SessionInner>,
}

impl ConnectionSession {
    /// Create an idle session over `link`
    ///
    /// Nothing connects until [`extend_session`](Self::extend_session) is called.
    pub fn new(
        link: impl Link,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();

        let inner = SessionInner {
            link: Arc::new(link),
            config,
            shared: Mutex::new(Shared {
                expiry: Instant::now(),
                running: false,
                closed: false,
                link: LinkState::Disconnected,
            }),
            wake: Notify::new(),
            gate: SendGate::default(),
            events,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Peer address of the underlying link
    #[must_use]
    pub fn address(&self) -> String {
        self.inner.link.address()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let shared = self.lock();
        match shared.link {
            LinkState::Disconnected => ConnectionState::Disconnected,
            LinkState::Connecting => ConnectionState::Connecting,
            LinkState::Active(_) => ConnectionState::Active {
                expires_at: shared.expiry,
            },
        }
    }

    /// Whether the link is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.lock().link, LinkState::Active(_))
    }

    /// Whether the session loop is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Push the session deadline forward, starting the loop if needed
    ///
    /// Has no effect after [`close`](Self::close).
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime while the loop is stopped.
    pub fn extend_session(&self) {
        let mut shared = self.lock();
        if shared.closed {
            return;
        }

        shared.expiry = Instant::now() + Duration::from_millis(self.inner.config.active_time_ms);

        if !shared.running {
            shared.running = true;
            drop(shared);

            debug!("Starting session loop");
            tokio::spawn(self.clone().run());
        }
    }

    /// End the session for good; the loop tears the link down and exits
    pub fn close(&self) {
        {
            let mut shared = self.lock();
            shared.closed = true;
            shared.expiry = Instant::now();
        }
        self.inner.wake.notify_one();
    }

    /// Transmit a command if connected and nothing else is in flight
    ///
    /// Returns `false` when the command was dropped. Commands are never
    /// queued: the reconciliation cycle re-issues whatever is still needed.
    pub fn send(&self, command: Command) -> bool {
        match self.try_send(command) {
            SendOutcome::Sent => true,
            SendOutcome::Busy => {
                debug!("Send in flight, dropping {}", command);
                false
            }
            SendOutcome::NotConnected => {
                debug!("Not connected, dropping {}", command);
                false
            }
        }
    }

    /// Ask the bed for a fresh status frame
    ///
    /// A request made while a send is in flight is remembered and written
    /// right after that send completes. Returns `false` when not connected.
    pub fn request_status(&self) -> bool {
        let Some(handle) = self.active_handle() else {
            return false;
        };

        if self.inner.gate.try_acquire() || self.inner.gate.defer_status() {
            tokio::spawn(self.clone().transmit(handle, Command::StatusRequest));
        }
        true
    }

    fn try_send(&self, command: Command) -> SendOutcome {
        let Some(handle) = self.active_handle() else {
            return SendOutcome::NotConnected;
        };

        if !self.inner.gate.try_acquire() {
            return SendOutcome::Busy;
        }

        tokio::spawn(self.clone().transmit(handle, command));
        SendOutcome::Sent
    }

    async fn transmit(self, handle: Arc<dyn LinkHandle>, mut command: Command) {
        loop {
            debug!("Sending command {}", command);
            if let Err(e) = handle.write(Channel::Command, &command.to_bytes()).await {
                log_failure("send", &e);
            }

            if !self.inner.gate.finish() {
                break;
            }
            command = Command::StatusRequest;
        }
    }

    async fn run(self) {
        loop {
            {
                let mut shared = self.lock();
                if shared.closed || shared.expiry <= Instant::now() {
                    shared.running = false;
                    debug!("Session expired, loop exiting");
                    return;
                }
            }

            if let Err(e) = self.connect_and_serve().await {
                log_failure("session", &e);
            }

            let closed = self.lock().closed;
            if !closed {
                tokio::time::sleep(Duration::from_millis(self.inner.config.cooldown_ms)).await;
            }
        }
    }

    async fn connect_and_serve(&self) -> Result<()> {
        self.set_link(LinkState::Connecting);
        debug!("Connecting to {}", self.address());

        let handle = match self.inner.link.connect(self.inner.config.connect_retries).await {
            Ok(handle) => handle,
            Err(e) => {
                self.set_link(LinkState::Disconnected);
                return Err(e);
            }
        };

        self.set_link(LinkState::Active(handle.clone()));
        info!("Session connected to {}", self.address());
        self.emit(SessionEvent::Connected);

        let result = self.serve(handle.as_ref()).await;
        self.teardown(handle.as_ref()).await;
        result
    }

    async fn serve(&self, handle: &dyn LinkHandle) -> Result<()> {
        let events = self.inner.events.clone();
        let notifier: Notifier = Arc::new(move |data| {
            let _ = events.send(SessionEvent::Frame(data));
        });
        handle.subscribe(Channel::Status, notifier).await?;

        self.request_status();

        // dropped on every exit path below, which aborts the poll task
        let _poller = self
            .inner
            .config
            .poll_interval_ms
            .map(|ms| AbortOnDrop::new(tokio::spawn(self.clone().poll(Duration::from_millis(ms)))));

        self.wait_for_expiry().await;
        Ok(())
    }

    async fn teardown(&self, handle: &dyn LinkHandle) {
        self.set_link(LinkState::Disconnected);
        self.inner.gate.clear_deferred();
        debug!("Disconnecting from {}", self.address());

        if let Err(e) = handle.unsubscribe(Channel::Status).await {
            log_failure("unsubscribe", &e);
        }
        if let Err(e) = handle.disconnect().await {
            log_failure("disconnect", &e);
        }

        info!("Session disconnected from {}", self.address());
        self.emit(SessionEvent::Disconnected);
    }

    async fn poll(self, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            debug!("Polling status");
            self.request_status();
        }
    }

    async fn wait_for_expiry(&self) {
        loop {
            let expiry = {
                let shared = self.lock();
                if shared.closed {
                    return;
                }
                shared.expiry
            };

            if expiry <= Instant::now() {
                return;
            }

            // the deadline may move while asleep, so re-read it on every wake
            tokio::select! {
                () = tokio::time::sleep_until(expiry) => {}
                () = self.inner.wake.notified() => {}
            }
        }
    }

    fn active_handle(&self) -> Option<Arc<dyn LinkHandle>> {
        match &self.lock().link {
            LinkState::Active(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    fn set_link(&self, link: LinkState) {
        self.lock().link = link;
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("Session event receiver dropped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl CommandSink for ConnectionSession {
    fn send(&self, command: Command) -> bool {
        Self::send(self, command)
    }

    fn request_status(&self) -> bool {
        Self::request_status(self)
    }

    fn extend_session(&self) {
        Self::extend_session(self);
    }
}

fn log_failure(context: &str, error: &ErgoError) {
    if error.is_transient() {
        debug!("{} error: {}", context, error);
    } else {
        warn!("{} error: {}", context, error);
    }
}
