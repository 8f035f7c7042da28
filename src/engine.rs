use indexmap::IndexMap;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::{
    error::Result,
    protocol::{decode_frame, Command},
    types::{
        Attribute, AttributePolicy, BedView, EngineConfig, ObserverKind, StatusSnapshot,
        TargetValue,
    },
};

/// Outbound side of the engine
///
/// Implemented by [`ConnectionSession`](crate::session::ConnectionSession);
/// the engine never touches the link directly.
pub trait CommandSink {
    /// Transmit a command. Returns `false` when the command was dropped.
    fn send(&self, command: Command) -> bool;

    /// Ask the bed for a fresh status frame
    fn request_status(&self) -> bool;

    /// Keep the link alive for another session period
    fn extend_session(&self);
}

/// Callback fired on connectivity or state changes
pub type Observer = Box<dyn Fn(&BedView) + Send + Sync>;

/// Desired attribute values, iterated in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetState {
    entries: IndexMap<Attribute, TargetValue>,
}

impl TargetState {
    /// Empty target state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a target; a replaced entry keeps its position
    pub fn insert(&mut self, attribute: Attribute, value: TargetValue) {
        self.entries.insert(attribute, value);
    }

    /// Remove a target, preserving the order of the rest
    pub fn remove(&mut self, attribute: Attribute) -> Option<TargetValue> {
        self.entries.shift_remove(&attribute)
    }

    /// Pending target of `attribute`
    #[must_use]
    pub fn get(&self, attribute: Attribute) -> Option<TargetValue> {
        self.entries.get(&attribute).copied()
    }

    /// Whether `attribute` has a pending target
    #[must_use]
    pub fn contains(&self, attribute: Attribute) -> bool {
        self.entries.contains_key(&attribute)
    }

    /// Drop every pending target
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of pending targets
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Pending targets, oldest first
    pub fn iter(&self) -> impl Iterator<Item = (Attribute, TargetValue)> + '_ {
        self.entries.iter().map(|(attr, value)| (*attr, *value))
    }
}

/// Outcome of evaluating one pending target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// Goal met, drop the entry; `stop` halts a motor that was driving it
    Satisfied { stop: bool },
    /// Emit `command`; `keep` leaves the entry pending for the next cycle
    Emit { command: Command, keep: bool },
}

/// Reconciles the caller's desired state against the observed bed state
///
/// Each [`reconcile`](Self::reconcile) call emits at most one command through
/// the [`CommandSink`]. The engine is driven from a single task, so calls
/// never overlap.
pub struct ReconciliationEngine<S: CommandSink> {
    sink: S,
    config: EngineConfig,
    address: String,
    connected: bool,
    current_state: StatusSnapshot,
    last_frame: Option<Vec<u8>>,
    target_state: TargetState,
    stop_pending: bool,
    idle_frames: u32,
    connectivity_observers: Vec<Observer>,
    state_observers: Vec<Observer>,
    view: watch::Sender<BedView>,
}

impl<S: CommandSink> ReconciliationEngine<S> {
    /// Create an engine emitting through `sink`
    pub fn new(sink: S, config: EngineConfig, address: impl Into<String>) -> Self {
        let address = address.into();
        let (view, _) = watch::channel(BedView {
            address: address.clone(),
            ..BedView::default()
        });

        Self {
            sink,
            config,
            address,
            connected: false,
            current_state: StatusSnapshot::default(),
            last_frame: None,
            target_state: TargetState::new(),
            stop_pending: false,
            idle_frames: 0,
            connectivity_observers: Vec::new(),
            state_observers: Vec::new(),
            view,
        }
    }

    /// Latest decoded state
    #[must_use]
    pub const fn current_state(&self) -> &StatusSnapshot {
        &self.current_state
    }

    /// Pending targets
    #[must_use]
    pub const fn target_state(&self) -> &TargetState {
        &self.target_state
    }

    /// Whether the session reported the link as up
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Receiver of the view published after every change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BedView> {
        self.view.subscribe()
    }

    /// Register a change observer
    pub fn register_observer(&mut self, kind: ObserverKind, observer: Observer) {
        match kind {
            ObserverKind::Connectivity => self.connectivity_observers.push(observer),
            ObserverKind::State => self.state_observers.push(observer),
        }
    }

    /// Link came up or went down
    pub fn on_connection_changed(&mut self, connected: bool) {
        debug!("Connection changed: {}", connected);
        self.connected = connected;
        if !connected {
            self.stop_pending = false;
        }

        let view = self.publish();
        for observer in &self.connectivity_observers {
            observer(&view);
        }
    }

    /// Status notification received
    pub fn on_frame(&mut self, raw: &[u8]) {
        if self.last_frame.as_deref() != Some(raw) {
            if let Some(snapshot) = decode_frame(raw) {
                debug!("Accepted status frame: {:02X?}", raw);
                self.last_frame = Some(raw.to_vec());
                self.current_state = snapshot;

                let view = self.publish();
                for observer in &self.state_observers {
                    observer(&view);
                }
            } else {
                debug!("Ignoring frame: {:02X?}", raw);
            }
        }

        if !self.target_state.is_empty() || self.stop_pending {
            self.reconcile();
        } else if self.config.idle_poll_every > 0 {
            self.idle_frames += 1;
            if self.idle_frames >= self.config.idle_poll_every {
                self.idle_frames = 0;
                self.sink.request_status();
            }
        }
    }

    /// Record a desired value and act on it right away when connected
    ///
    /// # Errors
    ///
    /// Returns [`ErgoError::InvalidTarget`](crate::ErgoError::InvalidTarget)
    /// if the value does not fit the attribute.
    pub fn set_target(&mut self, attribute: Attribute, value: TargetValue) -> Result<()> {
        attribute.validate(&value)?;
        debug!("Set target {} = {:?}", attribute, value);

        self.target_state.insert(attribute, value);
        if self.connected {
            self.reconcile();
        }
        self.sink.extend_session();

        Ok(())
    }

    /// Run one reconciliation cycle
    ///
    /// Returns the command sent for a pending target, if any. A target whose
    /// command the sink dropped stays pending and is retried on the next
    /// cycle.
    pub fn reconcile(&mut self) -> Option<Command> {
        debug!("Reconciling {} pending target(s)", self.target_state.len());

        if self.target_state.contains(Attribute::Stop) {
            self.target_state.clear();
            if self.send_stop() {
                return Some(Command::Stop);
            }
            debug!("Stop dropped, retrying on next frame");
            self.target_state.insert(Attribute::Stop, TargetValue::Stop);
            return None;
        }

        if self.stop_pending {
            // the stop payload doubles as the flat preset; only repeat it while moving
            if !self.current_state.is_moving() {
                self.stop_pending = false;
            } else if self.send_stop() {
                return Some(Command::Stop);
            } else {
                return None;
            }
        }

        let pending: Vec<_> = self.target_state.iter().collect();
        let mut stopped = false;

        for (attribute, target) in pending {
            match self.evaluate(attribute, target) {
                Decision::Satisfied { stop } => {
                    self.target_state.remove(attribute);
                    if stop {
                        debug!("{} reached {:?}", attribute, target);
                        if !self.send_stop() {
                            return None;
                        }
                        stopped = true;
                    }
                }
                Decision::Emit { command, keep } => {
                    debug!("Emitting {}", command);
                    if !self.sink.send(command) {
                        debug!("{} dropped, {} stays pending", command, attribute);
                        return None;
                    }
                    if !keep {
                        self.target_state.remove(attribute);
                    }
                    if command.is_motion() {
                        self.sink.request_status();
                    }
                    return Some(command);
                }
            }
        }

        if !stopped && self.target_state.is_empty() && self.current_state.is_moving() {
            debug!("No targets left but bed still moving, stopping");
            self.send_stop();
        }

        None
    }

    /// Send a stop, remembering it for the next cycle when dropped
    fn send_stop(&mut self) -> bool {
        let sent = self.sink.send(Command::Stop);
        self.stop_pending = !sent;
        sent
    }

    fn evaluate(&self, attribute: Attribute, target: TargetValue) -> Decision {
        match (attribute.policy(), target) {
            (AttributePolicy::Continuous { up, down }, TargetValue::Position(target)) => {
                let current = self.position(attribute);
                if current.abs_diff(target) < self.config.min_step {
                    Decision::Satisfied { stop: true }
                } else {
                    Decision::Emit {
                        command: if current < target { up } else { down },
                        keep: true,
                    }
                }
            }
            // the controller has no massage-off button; zero is dropped
            (AttributePolicy::Massage(_), TargetValue::Percentage(0)) => {
                Decision::Satisfied { stop: false }
            }
            (AttributePolicy::Massage(command), TargetValue::Percentage(_))
            | (AttributePolicy::Cycle(command), _) => Decision::Emit {
                command,
                keep: false,
            },
            (AttributePolicy::Preset, TargetValue::Scene(preset)) => Decision::Emit {
                command: preset.command(),
                keep: false,
            },
            (AttributePolicy::Toggle(command), TargetValue::Switch(on)) => {
                if self.current_state.led_on == on {
                    Decision::Satisfied { stop: false }
                } else {
                    Decision::Emit {
                        command,
                        keep: false,
                    }
                }
            }
            (policy, value) => {
                error!(
                    "Dropping target {} = {:?}: does not fit policy {:?}",
                    attribute, value, policy
                );
                Decision::Satisfied { stop: false }
            }
        }
    }

    const fn position(&self, attribute: Attribute) -> u16 {
        match attribute {
            Attribute::FootPosition => self.current_state.foot_position,
            _ => self.current_state.head_position,
        }
    }

    fn publish(&self) -> BedView {
        let view = BedView {
            address: self.address.clone(),
            connected: self.connected,
            snapshot: self.current_state,
        };
        self.view.send_replace(view.clone());
        view
    }
}
