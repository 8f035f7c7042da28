use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tokio::time::Instant;

use crate::{
    error::{ErgoError, Result},
    protocol::Command,
};

/// Movement tolerance in device-native position units
///
/// A continuous goal is reached once the reported position is strictly closer
/// than this to the target. The same threshold decides whether the bed is
/// considered to be "in a scene" (raised away from flat).
pub const MIN_STEP: u16 = 100;

/// Sliding session lifetime after the last caller interaction, in milliseconds
pub const ACTIVE_TIME_MS: u64 = 120_000;

/// Massage timer presets, in minutes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerOption {
    /// 10 minutes
    Ten,
    /// 20 minutes
    Twenty,
    /// 30 minutes
    Thirty,
}

impl TimerOption {
    /// All presets in the order the device cycles through them
    pub const ALL: [Self; 3] = [Self::Ten, Self::Twenty, Self::Thirty];

    /// Map the raw timer byte of a status frame (1-based) to a preset
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1..=3 => Some(Self::ALL[usize::from(raw - 1)]),
            _ => None,
        }
    }

    /// Option label as exposed on the attribute surface
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ten => "10",
            Self::Twenty => "20",
            Self::Thirty => "30",
        }
    }

    /// Timer length in minutes
    #[must_use]
    pub const fn minutes(self) -> u8 {
        match self {
            Self::Ten => 10,
            Self::Twenty => 20,
            Self::Thirty => 30,
        }
    }
}

impl fmt::Display for TimerOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimerOption {
    type Err = ErgoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|option| option.as_str() == s)
            .ok_or_else(|| ErgoError::invalid_target("timer_target", format!("no timer preset {s:?}")))
    }
}

/// Scene presets stored in the bed's controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScenePreset {
    /// Return to flat
    Flat,
    /// Anti-snore position
    Snore,
    /// User memory slot 1
    Memory1,
    /// User memory slot 2
    Memory2,
    /// User memory slot 3
    Memory3,
    /// Zero gravity position
    ZeroG,
}

impl ScenePreset {
    /// All presets in display order
    pub const ALL: [Self; 6] = [
        Self::Flat,
        Self::Snore,
        Self::Memory1,
        Self::Memory2,
        Self::Memory3,
        Self::ZeroG,
    ];

    /// Preset label as exposed on the attribute surface
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Snore => "snore",
            Self::Memory1 => "memory1",
            Self::Memory2 => "memory2",
            Self::Memory3 => "memory3",
            Self::ZeroG => "zerog",
        }
    }
}

impl fmt::Display for ScenePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenePreset {
    type Err = ErgoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_str() == s)
            .ok_or_else(|| ErgoError::invalid_target("scene", format!("no scene preset {s:?}")))
    }
}

/// Normalized device state decoded from the most recent accepted status frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Head section position (device units, `0xFFFF` normalized to 0)
    pub head_position: u16,
    /// Foot section position (device units, `0xFFFF` normalized to 0)
    pub foot_position: u16,
    /// Head motor running
    pub head_move: bool,
    /// Foot motor running
    pub foot_move: bool,
    /// Head massage intensity in percent
    pub head_massage_pct: u16,
    /// Foot massage intensity in percent
    pub foot_massage_pct: u16,
    /// Active massage timer preset
    pub timer_target: Option<TimerOption>,
    /// Raw remaining massage time counter. Scale unconfirmed, treat as opaque.
    pub timer_remain: u16,
    /// Under-bed light on
    pub led_on: bool,
    /// Bed raised or massaging
    pub scene_active: bool,
}

impl StatusSnapshot {
    /// Whether either motor is reported as running
    #[must_use]
    pub const fn is_moving(&self) -> bool {
        self.head_move || self.foot_move
    }
}

/// How the reconciliation engine drives an attribute toward its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributePolicy {
    /// Repeated directional commands until within [`MIN_STEP`] of the target
    Continuous {
        /// Command that raises the position
        up: Command,
        /// Command that lowers the position
        down: Command,
    },
    /// One push advances the massage cycle; a zero target is dropped silently
    Massage(Command),
    /// One push of the preset named by the target
    Preset,
    /// Toggle sent only when the observed state differs from the target
    Toggle(Command),
    /// One push advances a device-internal cycle
    Cycle(Command),
    /// Clears every pending target and stops all motion
    Stop,
    /// Not writable
    ReadOnly,
}

/// Attributes exposed by the bed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attribute {
    /// Link connectivity
    Connection,
    /// Head section position
    HeadPosition,
    /// Foot section position
    FootPosition,
    /// Head massage intensity
    HeadMassage,
    /// Foot massage intensity
    FootMassage,
    /// Scene preset
    Scene,
    /// Under-bed light
    Led,
    /// Massage timer preset
    TimerTarget,
    /// Global stop
    Stop,
}

impl Attribute {
    /// Every attribute, readable or writable
    pub const ALL: [Self; 9] = [
        Self::Connection,
        Self::HeadPosition,
        Self::FootPosition,
        Self::HeadMassage,
        Self::FootMassage,
        Self::Scene,
        Self::Led,
        Self::TimerTarget,
        Self::Stop,
    ];

    /// Attribute name on the host-facing surface
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::HeadPosition => "head_position",
            Self::FootPosition => "foot_position",
            Self::HeadMassage => "head_massage",
            Self::FootMassage => "foot_massage",
            Self::Scene => "scene",
            Self::Led => "led",
            Self::TimerTarget => "timer_target",
            Self::Stop => "stop",
        }
    }

    /// Reconciliation policy carried by this attribute
    #[must_use]
    pub const fn policy(self) -> AttributePolicy {
        match self {
            Self::HeadPosition => AttributePolicy::Continuous {
                up: Command::HeadUp,
                down: Command::HeadDown,
            },
            Self::FootPosition => AttributePolicy::Continuous {
                up: Command::FootUp,
                down: Command::FootDown,
            },
            Self::HeadMassage => AttributePolicy::Massage(Command::HeadMassage),
            Self::FootMassage => AttributePolicy::Massage(Command::FootMassage),
            Self::Scene => AttributePolicy::Preset,
            Self::Led => AttributePolicy::Toggle(Command::LedToggle),
            Self::TimerTarget => AttributePolicy::Cycle(Command::TimerCycle),
            Self::Stop => AttributePolicy::Stop,
            Self::Connection => AttributePolicy::ReadOnly,
        }
    }

    /// Check that `value` has the shape this attribute accepts
    ///
    /// # Errors
    ///
    /// Returns [`ErgoError::InvalidTarget`] when the value does not fit the
    /// attribute, or the attribute is read-only.
    pub fn validate(self, value: &TargetValue) -> Result<()> {
        let fits = match (self, value) {
            (Self::Stop, _)
            | (Self::HeadPosition | Self::FootPosition, TargetValue::Position(_))
            | (Self::Scene, TargetValue::Scene(_))
            | (Self::Led, TargetValue::Switch(_))
            | (Self::TimerTarget, TargetValue::Timer(_)) => true,
            (Self::HeadMassage | Self::FootMassage, TargetValue::Percentage(pct)) => *pct <= 100,
            _ => false,
        };

        if fits {
            Ok(())
        } else if self.policy() == AttributePolicy::ReadOnly {
            Err(ErgoError::invalid_target(self.as_str(), "attribute is read-only"))
        } else {
            Err(ErgoError::invalid_target(
                self.as_str(),
                format!("unsupported value {value:?}"),
            ))
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Attribute {
    type Err = ErgoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|attr| attr.as_str() == s)
            .ok_or_else(|| ErgoError::UnknownAttribute(s.to_string()))
    }
}

/// Desired value for a writable attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetValue {
    /// Absolute section position in device units
    Position(u16),
    /// Massage intensity in percent
    Percentage(u8),
    /// Scene preset
    Scene(ScenePreset),
    /// On/off
    Switch(bool),
    /// Massage timer preset
    Timer(Option<TimerOption>),
    /// Stop sentinel
    Stop,
}

impl TargetValue {
    /// Parse the textual form of a write to `attribute`
    ///
    /// Positions and percentages are plain integers, scenes and timer presets
    /// use their labels, the LED takes `on`/`off`, and `stop` ignores the text.
    ///
    /// # Errors
    ///
    /// Returns [`ErgoError::InvalidTarget`] if the text does not parse for
    /// this attribute.
    pub fn parse(attribute: Attribute, text: &str) -> Result<Self> {
        let name = attribute.as_str();
        let text = text.trim();

        match attribute {
            Attribute::HeadPosition | Attribute::FootPosition => text
                .parse()
                .map(Self::Position)
                .map_err(|_| ErgoError::invalid_target(name, format!("expected a position, got {text:?}"))),
            Attribute::HeadMassage | Attribute::FootMassage => text
                .parse()
                .map(Self::Percentage)
                .map_err(|_| ErgoError::invalid_target(name, format!("expected a percentage, got {text:?}"))),
            Attribute::Scene => text.parse().map(Self::Scene),
            Attribute::Led => match text {
                "on" | "true" => Ok(Self::Switch(true)),
                "off" | "false" => Ok(Self::Switch(false)),
                _ => Err(ErgoError::invalid_target(name, format!("expected on or off, got {text:?}"))),
            },
            Attribute::TimerTarget => match text {
                "off" | "none" => Ok(Self::Timer(None)),
                _ => text.parse().map(|option| Self::Timer(Some(option))),
            },
            Attribute::Stop => Ok(Self::Stop),
            Attribute::Connection => Err(ErgoError::invalid_target(name, "attribute is read-only")),
        }
    }
}

/// Extra data attached to an attribute view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeExtra {
    /// Bluetooth address of the bed
    Address(String),
    /// Raw remaining massage timer counter
    TimerRemain(u16),
}

/// Structured read view of a single attribute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeView {
    /// Binary state
    pub is_on: Option<bool>,
    /// Section position
    pub position: Option<u16>,
    /// Section moving
    pub moving: Option<bool>,
    /// Intensity in percent
    pub percentage: Option<u16>,
    /// Current option label
    pub current: Option<String>,
    /// Available option labels
    pub options: Option<Vec<String>>,
    /// Extra state attributes
    pub extra: Option<AttributeExtra>,
}

/// Everything the facade publishes after each engine step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BedView {
    /// Bed address
    pub address: String,
    /// Link connected
    pub connected: bool,
    /// Latest decoded state
    pub snapshot: StatusSnapshot,
}

impl BedView {
    /// Project the view onto a single attribute
    #[must_use]
    pub fn attribute(&self, attribute: Attribute) -> AttributeView {
        let state = &self.snapshot;
        let timer_options = || TimerOption::ALL.iter().map(ToString::to_string).collect();

        match attribute {
            Attribute::Connection => AttributeView {
                is_on: Some(self.connected),
                extra: Some(AttributeExtra::Address(self.address.clone())),
                ..AttributeView::default()
            },
            Attribute::HeadPosition => AttributeView {
                position: Some(state.head_position),
                moving: Some(state.head_move),
                ..AttributeView::default()
            },
            Attribute::FootPosition => AttributeView {
                position: Some(state.foot_position),
                moving: Some(state.foot_move),
                ..AttributeView::default()
            },
            Attribute::HeadMassage | Attribute::FootMassage => {
                let percentage = if attribute == Attribute::HeadMassage {
                    state.head_massage_pct
                } else {
                    state.foot_massage_pct
                };
                // the timer only means something while a massage is running
                let current = if percentage > 0 {
                    state.timer_target.map(|t| t.to_string())
                } else {
                    None
                };
                AttributeView {
                    percentage: Some(percentage),
                    current,
                    options: Some(timer_options()),
                    ..AttributeView::default()
                }
            }
            Attribute::Scene => AttributeView {
                is_on: Some(state.scene_active),
                options: Some(ScenePreset::ALL.iter().map(ToString::to_string).collect()),
                extra: (state.timer_remain != 0)
                    .then_some(AttributeExtra::TimerRemain(state.timer_remain)),
                ..AttributeView::default()
            },
            Attribute::Led => AttributeView {
                is_on: Some(state.led_on),
                ..AttributeView::default()
            },
            Attribute::TimerTarget => AttributeView {
                current: state.timer_target.map(|t| t.to_string()),
                options: Some(timer_options()),
                ..AttributeView::default()
            },
            Attribute::Stop => AttributeView::default(),
        }
    }
}

/// Observer categories on the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObserverKind {
    /// Fired on connect and disconnect
    Connectivity,
    /// Fired whenever a new status snapshot is accepted
    State,
}

/// Observable lifecycle of the connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and no connect attempt running
    Disconnected,
    /// Connect attempt in progress
    Connecting,
    /// Link up until the session deadline
    Active {
        /// Current session deadline
        expires_at: Instant,
    },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Active { .. } => write!(f, "Active"),
        }
    }
}

/// Connection session parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session lifetime granted by each `extend_session` call in milliseconds
    pub active_time_ms: u64,
    /// Pause between a teardown (or failed attempt) and the next connect
    pub cooldown_ms: u64,
    /// Connect attempts per session loop iteration
    pub connect_retries: u32,
    /// Timeout for a single connect attempt in milliseconds
    pub connect_timeout_ms: u64,
    /// Scan timeout when looking the bed up by address
    pub scan_timeout_ms: u64,
    /// Background status poll interval; `None` relies on push notifications only
    pub poll_interval_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            active_time_ms: ACTIVE_TIME_MS,
            cooldown_ms: 1_000,
            connect_retries: 3,
            connect_timeout_ms: 10_000,
            scan_timeout_ms: 10_000,
            poll_interval_ms: Some(10_000),
        }
    }
}

/// Reconciliation engine parameters
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Continuous-goal tolerance in device units
    ///
    /// Only decides when a position target counts as reached. Whether the
    /// bed reports a scene as active is fixed by the decoder at [`MIN_STEP`].
    pub min_step: u16,
    /// While idle, request a status refresh on every n-th frame
    pub idle_poll_every: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_step: MIN_STEP,
            idle_poll_every: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_option_from_raw() {
        assert_eq!(TimerOption::from_raw(1), Some(TimerOption::Ten));
        assert_eq!(TimerOption::from_raw(3), Some(TimerOption::Thirty));
        assert_eq!(TimerOption::from_raw(0), None);
        assert_eq!(TimerOption::from_raw(4), None);
        assert_eq!(TimerOption::from_raw(0xFF), None);
    }

    #[test]
    fn test_attribute_names() {
        for attr in Attribute::ALL {
            assert_eq!(attr.as_str().parse::<Attribute>().unwrap(), attr);
        }
        assert!(matches!(
            "lumbar_position".parse::<Attribute>(),
            Err(ErgoError::UnknownAttribute(_))
        ));
    }

    #[test]
    fn test_attribute_validation() {
        assert!(Attribute::HeadPosition.validate(&TargetValue::Position(400)).is_ok());
        assert!(Attribute::Led.validate(&TargetValue::Switch(true)).is_ok());
        assert!(Attribute::Stop.validate(&TargetValue::Switch(true)).is_ok());
        assert!(Attribute::HeadMassage.validate(&TargetValue::Percentage(100)).is_ok());

        assert!(Attribute::HeadMassage.validate(&TargetValue::Percentage(101)).is_err());
        assert!(Attribute::Led.validate(&TargetValue::Percentage(50)).is_err());
        assert!(Attribute::Connection.validate(&TargetValue::Switch(true)).is_err());
    }

    #[test]
    fn test_scene_preset_parsing() {
        assert_eq!("zerog".parse::<ScenePreset>().unwrap(), ScenePreset::ZeroG);
        assert!("party".parse::<ScenePreset>().is_err());
    }

    #[test]
    fn test_massage_view_shows_timer_only_while_running() {
        let mut view = BedView {
            snapshot: StatusSnapshot {
                timer_target: Some(TimerOption::Twenty),
                ..StatusSnapshot::default()
            },
            ..BedView::default()
        };

        let idle = view.attribute(Attribute::HeadMassage);
        assert_eq!(idle.percentage, Some(0));
        assert_eq!(idle.current, None);
        assert_eq!(idle.options.as_ref().map(Vec::len), Some(3));

        view.snapshot.head_massage_pct = 50;
        let running = view.attribute(Attribute::HeadMassage);
        assert_eq!(running.current.as_deref(), Some("20"));
    }

    #[test]
    fn test_scene_view_extra() {
        let mut view = BedView::default();
        assert_eq!(view.attribute(Attribute::Scene).extra, None);

        view.snapshot.timer_remain = 1800;
        assert_eq!(
            view.attribute(Attribute::Scene).extra,
            Some(AttributeExtra::TimerRemain(1800))
        );
    }

    #[test]
    fn test_config_defaults() {
        let session = SessionConfig::default();
        assert_eq!(session.active_time_ms, 120_000);
        assert_eq!(session.cooldown_ms, 1_000);
        assert_eq!(session.connect_retries, 3);
        assert_eq!(session.poll_interval_ms, Some(10_000));

        let engine = EngineConfig::default();
        assert_eq!(engine.min_step, 100);
        assert_eq!(engine.idle_poll_every, 5);
    }

    #[test]
    fn test_target_value_parse() {
        assert_eq!(
            TargetValue::parse(Attribute::HeadPosition, " 400 ").unwrap(),
            TargetValue::Position(400)
        );
        assert_eq!(
            TargetValue::parse(Attribute::FootMassage, "50").unwrap(),
            TargetValue::Percentage(50)
        );
        assert_eq!(
            TargetValue::parse(Attribute::Scene, "zerog").unwrap(),
            TargetValue::Scene(ScenePreset::ZeroG)
        );
        assert_eq!(
            TargetValue::parse(Attribute::Led, "off").unwrap(),
            TargetValue::Switch(false)
        );
        assert_eq!(
            TargetValue::parse(Attribute::TimerTarget, "20").unwrap(),
            TargetValue::Timer(Some(TimerOption::Twenty))
        );
        assert_eq!(
            TargetValue::parse(Attribute::TimerTarget, "off").unwrap(),
            TargetValue::Timer(None)
        );
        assert_eq!(
            TargetValue::parse(Attribute::Stop, "").unwrap(),
            TargetValue::Stop
        );

        for (attribute, text) in [
            (Attribute::HeadPosition, "high"),
            (Attribute::HeadMassage, "-1"),
            (Attribute::Scene, "recliner"),
            (Attribute::Led, "dim"),
            (Attribute::Connection, "on"),
        ] {
            let err = TargetValue::parse(attribute, text).unwrap_err();
            assert!(matches!(err, ErgoError::InvalidTarget { .. }), "{attribute}: {err}");
        }
    }
}
