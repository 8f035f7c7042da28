use crate::{
    ble::BleLink,
    engine::{Observer, ReconciliationEngine},
    error::Result,
    link::Link,
    session::{AbortOnDrop, ConnectionSession, SessionEvent},
    types::{
        Attribute, AttributeView, BedView, ConnectionState, EngineConfig, ObserverKind,
        SessionConfig, StatusSnapshot, TargetValue,
    },
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Requests from the facade to the engine task
enum DeviceMessage {
    SetTarget(Attribute, TargetValue),
    RegisterObserver(ObserverKind, Observer),
}

/// Main interface for controlling an Ergomotion bed
///
/// `BedDevice` exposes the bed as a set of named attributes (see
/// [`Attribute`]) that can be read, written and observed. Writing an attribute
/// records a target; the bed is then driven towards it one command per status
/// frame until the reported state matches.
///
/// The device owns a [`ConnectionSession`] and a [`ReconciliationEngine`]
/// running on a background task. Session events and attribute writes are
/// processed on that task in arrival order, so observers always see a
/// consistent view. Every write extends the session, so the link stays up for
/// [`SessionConfig::active_time_ms`] after the last interaction.
///
/// # Examples
///
/// ```no_run
/// use ergobed::{BedDevice, ObserverKind, TargetValue};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let bed = BedDevice::connect("AA:BB:CC:DD:EE:FF").await?;
///
///     bed.register_observer(ObserverKind::State, |view| {
///         println!("head {} foot {}", view.snapshot.head_position, view.snapshot.foot_position);
///     });
///
///     bed.write_attribute("foot_position", TargetValue::Position(300))?;
///     bed.write_attribute("head_massage", TargetValue::Percentage(50))?;
///
///     Ok(())
/// }
/// ```
pub struct BedDevice {
    session: ConnectionSession,
    messages: mpsc::UnboundedSender<DeviceMessage>,
    view: watch::Receiver<BedView>,
    _engine_task: AbortOnDrop,
}

impl BedDevice {
    /// Scan for the bed at `address` and start a session with default settings
    ///
    /// # Errors
    ///
    /// Returns [`ErgoError::DeviceNotFound`](crate::ErgoError::DeviceNotFound) if the bed was not seen during the
    /// scan, or [`ErgoError::Ble`](crate::ErgoError::Ble) for adapter failures.
    pub async fn connect(address: &str) -> Result<Self> {
        Self::connect_with_config(address, SessionConfig::default(), EngineConfig::default()).await
    }

    /// Scan for the bed at `address` and start a session with custom settings
    ///
    /// # Errors
    ///
    /// Returns [`ErgoError::DeviceNotFound`](crate::ErgoError::DeviceNotFound) if the bed was not seen during the
    /// scan, or [`ErgoError::Ble`](crate::ErgoError::Ble) for adapter failures.
    pub async fn connect_with_config(
        address: &str,
        session_config: SessionConfig,
        engine_config: EngineConfig,
    ) -> Result<Self> {
        let link = BleLink::find(address, &session_config).await?;
        Ok(Self::with_link(link, session_config, engine_config))
    }

    /// Build a device over any [`Link`] and start its session
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    #[must_use]
    pub fn with_link(
        link: impl Link,
        session_config: SessionConfig,
        engine_config: EngineConfig,
    ) -> Self {
        let (session, events) = ConnectionSession::new(link, session_config);
        let engine = ReconciliationEngine::new(session.clone(), engine_config, session.address());
        let view = engine.subscribe();
        let (messages, inbox) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_engine(engine, events, inbox));

        info!("Starting session for bed {}", session.address());
        session.extend_session();

        Self {
            session,
            messages,
            view,
            _engine_task: AbortOnDrop::new(task),
        }
    }

    /// Bed address
    #[must_use]
    pub fn address(&self) -> String {
        self.session.address()
    }

    /// Whether the link is up, as last reported to the engine
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.view.borrow().connected
    }

    /// Lifecycle state of the underlying session
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Latest decoded status
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        self.view.borrow().snapshot
    }

    /// Receiver of every view the engine publishes
    ///
    /// Useful for awaiting changes instead of registering a callback.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<BedView> {
        self.view.clone()
    }

    /// Current view of every attribute, in declaration order
    #[must_use]
    pub fn attributes(&self) -> Vec<(Attribute, AttributeView)> {
        let view = self.view.borrow();
        Attribute::ALL
            .iter()
            .map(|&attribute| (attribute, view.attribute(attribute)))
            .collect()
    }

    /// Register a callback fired on connectivity or state changes
    ///
    /// Callbacks run on the engine task and must not block.
    pub fn register_observer<F>(&self, kind: ObserverKind, handler: F)
    where
        F: Fn(&BedView) + Send + Sync + 'static,
    {
        self.post(DeviceMessage::RegisterObserver(kind, Box::new(handler)));
    }

    /// Read the current view of a named attribute
    ///
    /// # Errors
    ///
    /// Returns [`ErgoError::UnknownAttribute`](crate::ErgoError::UnknownAttribute) if `name` is not an attribute.
    pub fn read_attribute(&self, name: &str) -> Result<AttributeView> {
        let attribute: Attribute = name.parse()?;
        Ok(self.view.borrow().attribute(attribute))
    }

    /// Set the target of a named attribute
    ///
    /// The bed is driven towards the target in the background; this call
    /// returns as soon as the target is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ErgoError::UnknownAttribute`](crate::ErgoError::UnknownAttribute) if `name` is not an attribute,
    /// or [`ErgoError::InvalidTarget`](crate::ErgoError::InvalidTarget) if the value does not fit it.
    pub fn write_attribute(&self, name: &str, value: TargetValue) -> Result<()> {
        let attribute: Attribute = name.parse()?;
        self.set_target(attribute, value)
    }

    /// Typed form of [`write_attribute`](Self::write_attribute)
    ///
    /// # Errors
    ///
    /// Returns [`ErgoError::InvalidTarget`](crate::ErgoError::InvalidTarget) if the value does not fit the
    /// attribute.
    pub fn set_target(&self, attribute: Attribute, value: TargetValue) -> Result<()> {
        attribute.validate(&value)?;
        self.post(DeviceMessage::SetTarget(attribute, value));
        Ok(())
    }

    /// Stop every movement and drop all pending targets
    pub fn stop(&self) {
        self.post(DeviceMessage::SetTarget(Attribute::Stop, TargetValue::Stop));
    }

    /// Shut the session down; further writes are recorded but never sent
    pub fn close(&self) {
        info!("Closing session for bed {}", self.address());
        self.session.close();
    }

    fn post(&self, message: DeviceMessage) {
        if self.messages.send(message).is_err() {
            warn!("Engine task gone, dropping request");
        }
    }
}

impl std::fmt::Debug for BedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BedDevice")
            .field("address", &self.address())
            .field("state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

impl Drop for BedDevice {
    fn drop(&mut self) {
        self.session.close();
    }
}

async fn run_engine(
    mut engine: ReconciliationEngine<ConnectionSession>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut inbox: mpsc::UnboundedReceiver<DeviceMessage>,
) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                SessionEvent::Connected => engine.on_connection_changed(true),
                SessionEvent::Disconnected => engine.on_connection_changed(false),
                SessionEvent::Frame(data) => engine.on_frame(&data),
            },
            Some(message) = inbox.recv() => match message {
                DeviceMessage::SetTarget(attribute, value) => {
                    if let Err(e) = engine.set_target(attribute, value) {
                        warn!("Rejected target for {}: {}", attribute, e);
                    }
                }
                DeviceMessage::RegisterObserver(kind, observer) => {
                    engine.register_observer(kind, observer);
                }
            },
            else => break,
        }
    }
    debug!("Engine task exiting");
}
