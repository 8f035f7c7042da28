use crate::{
    error::{ErgoError, Result},
    types::{ScenePreset, StatusSnapshot, TimerOption, MIN_STEP},
};
use bytes::{Buf, Bytes};
use std::{fmt, str::FromStr};

/// Command size in bytes
pub const COMMAND_SIZE: usize = 6;

/// Minimum length of any accepted status frame
pub const MIN_FRAME_SIZE: usize = 16;

/// Raw position value the controller reports for "unknown"
const POSITION_UNKNOWN: u16 = 0xFFFF;

/// Movement nibble value the controller reports for "not reported"
const MOVE_UNKNOWN: u8 = 0xF;

/// Flags-byte bit carrying the under-bed light state
const LED_FLAG: u8 = 0x40;

/// Highest raw massage intensity level (levels are 0, 1, 3, 6)
const MASSAGE_MAX_LEVEL: u16 = 6;

/// Status frame layouts, selected by the first byte
///
/// Observed on the Nordic UART notify characteristic. Every layout shares the
/// same field offsets; they only differ in total length and in which optional
/// trailing fields are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameHeader {
    /// Short status frame, exactly 16 bytes
    Short = 0xED,
    /// Extended status frame, exactly 19 bytes
    Extended = 0xF0,
    /// Long status frame, exactly 20 bytes, movement nibble not reported
    Long = 0xF1,
    /// Full status frame (`A5 0B 0D ...`), 16 bytes or more
    Full = 0xA5,
}

impl FrameHeader {
    /// Convert from the first byte of a frame
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xED => Some(Self::Short),
            0xF0 => Some(Self::Extended),
            0xF1 => Some(Self::Long),
            0xA5 => Some(Self::Full),
            _ => None,
        }
    }

    /// Whether a frame of `len` bytes is a valid instance of this layout
    #[must_use]
    pub const fn accepts_len(self, len: usize) -> bool {
        match self {
            Self::Short => len == 16,
            Self::Extended => len == 19,
            Self::Long => len == 20,
            Self::Full => len >= MIN_FRAME_SIZE,
        }
    }
}

/// Decode a raw status notification into a [`StatusSnapshot`]
///
/// Returns `None` for anything that fails the header/length acceptance rule;
/// the link delivers partial and unrelated payloads, so a rejected frame is
/// not an error.
///
/// Frame layout (`A5 0B 0D` shown, other headers share the offsets):
///
/// ```text
/// offset:  0  1  2 | 3  4 | 5  6 | 7  | 8  9 | 10 11 | 12    | 13   | ...
/// field:   header  | rem. | -    | hm | head  | foot  | flags | timer|
/// ```
///
/// - `rem.`: remaining massage timer counter (u16 little-endian)
/// - `hm`: head massage level (0, 1, 3, 6); the foot level is read from
///   byte 8 on every layout except `A5`, whose massage block ends at byte 7
/// - `head`/`foot`: section positions (u16 little-endian)
/// - `flags`: low nibble movement bits (bit 0 head, bit 1 foot), bit 6 light
/// - `timer`: 1-based timer preset index, `0xFF` when off
#[must_use]
pub fn decode_frame(data: &[u8]) -> Option<StatusSnapshot> {
    if data.len() < MIN_FRAME_SIZE {
        return None;
    }

    let header = FrameHeader::from_u8(data[0])?;
    if !header.accepts_len(data.len()) {
        return None;
    }

    // the full layout bounds the timer/massage block; the others run to the end
    let data1 = if header == FrameHeader::Full {
        &data[3..8]
    } else {
        &data[3..]
    };
    let data2 = &data[8..];

    let mut positions = data2;
    let head_position = normalize_position(positions.get_u16_le());
    let foot_position = normalize_position(positions.get_u16_le());

    let remain = u16::from_le_bytes([data1[0], data1[1]]);

    let flags = data2.get(4).copied();
    let move_flags = match flags {
        Some(flags) if header != FrameHeader::Long => flags & MOVE_UNKNOWN,
        _ => MOVE_UNKNOWN,
    };
    let head_move = move_flags != MOVE_UNKNOWN && move_flags & 0x1 != 0;
    let foot_move = move_flags != MOVE_UNKNOWN && move_flags & 0x2 != 0;

    let head_massage_pct = data1.get(4).copied().map_or(0, massage_percentage);
    let foot_massage_pct = data1.get(5).copied().map_or(0, massage_percentage);

    let timer_target = data2.get(5).copied().and_then(TimerOption::from_raw);
    let led_on = flags.is_some_and(|flags| flags & LED_FLAG != 0);

    let scene_active = head_position > MIN_STEP
        || foot_position > MIN_STEP
        || head_massage_pct > 0
        || foot_massage_pct > 0;

    Some(StatusSnapshot {
        head_position,
        foot_position,
        head_move,
        foot_move,
        head_massage_pct,
        foot_massage_pct,
        timer_target,
        timer_remain: remain,
        led_on,
        scene_active,
    })
}

const fn normalize_position(raw: u16) -> u16 {
    if raw == POSITION_UNKNOWN {
        0
    } else {
        raw
    }
}

fn massage_percentage(level: u8) -> u16 {
    u16::from(level) * 100 / MASSAGE_MAX_LEVEL
}

/// Bed commands
///
/// Every command is a fixed 6-byte payload written to the Nordic UART RX
/// characteristic: a constant `04 02` prefix followed by a 4-byte button mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Raise head section while repeated
    HeadUp,
    /// Lower head section while repeated
    HeadDown,
    /// Raise foot section while repeated
    FootUp,
    /// Lower foot section while repeated
    FootDown,
    /// Raise lumbar support while repeated
    LumbarUp,
    /// Lower lumbar support while repeated
    LumbarDown,
    /// Raise neck support while repeated
    NeckUp,
    /// Lower neck support while repeated
    NeckDown,
    /// Flat preset
    Flat,
    /// Zero gravity preset
    ZeroG,
    /// Anti-snore preset
    Snore,
    /// Memory slot 1 preset
    Memory1,
    /// Memory slot 2 preset
    Memory2,
    /// Memory slot 3 preset
    Memory3,
    /// Interrupt any running movement
    Stop,
    /// Advance head massage cycle
    HeadMassage,
    /// Advance foot massage cycle
    FootMassage,
    /// Toggle under-bed light
    LedToggle,
    /// Advance massage timer cycle
    TimerCycle,
    /// Zero-motion frame that makes the controller report its status
    StatusRequest,
}

impl Command {
    /// The complete command table
    pub const ALL: [Self; 20] = [
        Self::HeadUp,
        Self::HeadDown,
        Self::FootUp,
        Self::FootDown,
        Self::LumbarUp,
        Self::LumbarDown,
        Self::NeckUp,
        Self::NeckDown,
        Self::Flat,
        Self::ZeroG,
        Self::Snore,
        Self::Memory1,
        Self::Memory2,
        Self::Memory3,
        Self::Stop,
        Self::HeadMassage,
        Self::FootMassage,
        Self::LedToggle,
        Self::TimerCycle,
        Self::StatusRequest,
    ];

    /// Symbolic command name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::HeadUp => "head_up",
            Self::HeadDown => "head_down",
            Self::FootUp => "foot_up",
            Self::FootDown => "foot_down",
            Self::LumbarUp => "lumbar_up",
            Self::LumbarDown => "lumbar_down",
            Self::NeckUp => "neck_up",
            Self::NeckDown => "neck_down",
            Self::Flat => "flat",
            Self::ZeroG => "zerog",
            Self::Snore => "snore",
            Self::Memory1 => "memory1",
            Self::Memory2 => "memory2",
            Self::Memory3 => "memory3",
            Self::Stop => "stop",
            Self::HeadMassage => "head_massage",
            Self::FootMassage => "foot_massage",
            Self::LedToggle => "led_toggle",
            Self::TimerCycle => "timer_cycle",
            Self::StatusRequest => "status_request",
        }
    }

    /// Wire payload for this command
    #[must_use]
    pub const fn to_bytes(self) -> [u8; COMMAND_SIZE] {
        let mask: [u8; 4] = match self {
            Self::HeadUp => [0x00, 0x00, 0x00, 0x10],
            Self::HeadDown => [0x00, 0x00, 0x00, 0x20],
            Self::FootUp => [0x00, 0x00, 0x00, 0x04],
            Self::FootDown => [0x00, 0x00, 0x00, 0x08],
            Self::LumbarUp | Self::Memory3 => [0x00, 0x00, 0x40, 0x00],
            Self::LumbarDown | Self::Snore => [0x00, 0x00, 0x80, 0x00],
            Self::NeckUp => [0x00, 0x00, 0x00, 0x01],
            Self::NeckDown => [0x00, 0x00, 0x00, 0x02],
            // the controller has no dedicated stop button; flat interrupts motion
            Self::Flat | Self::Stop => [0x08, 0x00, 0x00, 0x00],
            Self::ZeroG => [0x00, 0x00, 0x10, 0x00],
            Self::Memory1 => [0x00, 0x01, 0x00, 0x00],
            Self::Memory2 => [0x00, 0x00, 0x20, 0x00],
            Self::HeadMassage => [0x00, 0x00, 0x08, 0x00],
            Self::FootMassage => [0x00, 0x00, 0x04, 0x00],
            Self::LedToggle => [0x00, 0x02, 0x00, 0x00],
            Self::TimerCycle => [0x00, 0x00, 0x02, 0x00],
            Self::StatusRequest => [0x00, 0x00, 0x00, 0x00],
        };
        [0x04, 0x02, mask[0], mask[1], mask[2], mask[3]]
    }

    /// Wire payload as [`Bytes`]
    #[must_use]
    pub fn payload(self) -> Bytes {
        Bytes::copy_from_slice(&self.to_bytes())
    }

    /// Whether the command starts or continues motor movement
    #[must_use]
    pub const fn is_motion(self) -> bool {
        matches!(
            self,
            Self::HeadUp
                | Self::HeadDown
                | Self::FootUp
                | Self::FootDown
                | Self::LumbarUp
                | Self::LumbarDown
                | Self::NeckUp
                | Self::NeckDown
                | Self::Flat
                | Self::ZeroG
                | Self::Snore
                | Self::Memory1
                | Self::Memory2
                | Self::Memory3
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = ErgoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|command| command.name() == s)
            .ok_or_else(|| ErgoError::UnknownCommand(s.to_string()))
    }
}

impl ScenePreset {
    /// Command that recalls this preset
    #[must_use]
    pub const fn command(self) -> Command {
        match self {
            Self::Flat => Command::Flat,
            Self::Snore => Command::Snore,
            Self::Memory1 => Command::Memory1,
            Self::Memory2 => Command::Memory2,
            Self::Memory3 => Command::Memory3,
            Self::ZeroG => Command::ZeroG,
        }
    }
}

/// Look a command up by its symbolic name and return its wire payload
///
/// # Errors
///
/// Returns [`ErgoError::UnknownCommand`] if the name is not in the table.
pub fn encode(name: &str) -> Result<[u8; COMMAND_SIZE]> {
    name.parse::<Command>().map(Command::to_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn frame(header: u8, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        data[0] = header;
        data
    }

    #[test]
    fn test_header_length_acceptance() {
        assert!(decode_frame(&frame(0xED, 16)).is_some());
        assert!(decode_frame(&frame(0xF0, 19)).is_some());
        assert!(decode_frame(&frame(0xF1, 20)).is_some());
        assert!(decode_frame(&frame(0xA5, 16)).is_some());
        assert!(decode_frame(&frame(0xA5, 24)).is_some());

        assert!(decode_frame(&frame(0xED, 17)).is_none());
        assert!(decode_frame(&frame(0xF0, 16)).is_none());
        assert!(decode_frame(&frame(0xF1, 19)).is_none());
        assert!(decode_frame(&frame(0xA5, 15)).is_none());
        assert!(decode_frame(&frame(0x99, 16)).is_none());
        assert!(decode_frame(&[]).is_none());
    }

    #[test]
    fn test_all_zero_frame_decodes_to_defaults() {
        let snapshot = decode_frame(&frame(0xED, 16)).unwrap();
        assert_eq!(snapshot, StatusSnapshot::default());
    }

    #[test]
    fn test_full_frame_fields() {
        // A5 0B 0D | remain 1800 | - | - | head lvl 6 | head 600 | foot 0xFFFF | flags | timer 2
        let data = [
            0xA5, 0x0B, 0x0D, 0x08, 0x07, 0x00, 0x03, 0x06, 0x58, 0x02, 0xFF, 0xFF, 0x41, 0x02,
            0x00, 0x00,
        ];
        let snapshot = decode_frame(&data).unwrap();

        assert_eq!(snapshot.timer_remain, 1800);
        assert_eq!(snapshot.head_position, 600);
        assert_eq!(snapshot.foot_position, 0);
        assert!(snapshot.head_move);
        assert!(!snapshot.foot_move);
        assert!(snapshot.led_on);
        assert_eq!(snapshot.timer_target, Some(TimerOption::Twenty));
        assert_eq!(snapshot.head_massage_pct, 100);
        assert!(snapshot.scene_active);
    }

    #[test]
    fn test_full_frame_massage_bytes_outside_short_block() {
        // data1 is bytes 3..8, so the foot massage level (data1[5]) does not exist
        let mut data = frame(0xA5, 16);
        data[7] = 6;
        data[8] = 0x09;
        let snapshot = decode_frame(&data).unwrap();

        assert_eq!(snapshot.head_massage_pct, 100);
        assert_eq!(snapshot.foot_massage_pct, 0);
    }

    #[test]
    fn test_short_frame_massage_levels() {
        let mut data = frame(0xED, 16);
        data[7] = 1;
        data[8] = 3;
        let snapshot = decode_frame(&data).unwrap();

        assert_eq!(snapshot.head_massage_pct, 16);
        assert_eq!(snapshot.foot_massage_pct, 50);
        assert!(snapshot.scene_active);
    }

    #[test]
    fn test_unknown_movement_nibble() {
        let mut data = frame(0xED, 16);
        data[12] = 0x4F;
        let snapshot = decode_frame(&data).unwrap();
        assert!(!snapshot.head_move);
        assert!(!snapshot.foot_move);
        assert!(snapshot.led_on);

        // the long layout never reports movement
        let mut data = frame(0xF1, 20);
        data[12] = 0x03;
        let snapshot = decode_frame(&data).unwrap();
        assert!(!snapshot.head_move);
        assert!(!snapshot.foot_move);
    }

    #[test]
    fn test_timer_out_of_range() {
        let mut data = frame(0xF0, 19);
        data[13] = 0xFF;
        assert_eq!(decode_frame(&data).unwrap().timer_target, None);
        data[13] = 4;
        assert_eq!(decode_frame(&data).unwrap().timer_target, None);
        data[13] = 3;
        assert_eq!(decode_frame(&data).unwrap().timer_target, Some(TimerOption::Thirty));
    }

    #[test]
    fn test_scene_threshold() {
        // foot position lives outside the massage block on every layout
        let mut data = frame(0xED, 16);
        data[10] = 100;
        assert!(!decode_frame(&data).unwrap().scene_active);
        data[10] = 101;
        assert!(decode_frame(&data).unwrap().scene_active);

        // the full layout keeps byte 8 out of the massage block
        let mut data = frame(0xA5, 16);
        data[8] = 100;
        assert!(!decode_frame(&data).unwrap().scene_active);
        data[8] = 101;
        assert!(decode_frame(&data).unwrap().scene_active);
    }

    #[test]
    fn test_head_position_low_byte_doubles_as_foot_massage() {
        for (header, len) in [(0xED, 16), (0xF0, 19), (0xF1, 20)] {
            let mut data = frame(header, len);
            data[8] = 3;
            let snapshot = decode_frame(&data).unwrap();

            assert_eq!(snapshot.head_position, 3);
            assert_eq!(snapshot.foot_massage_pct, 50);
            assert!(snapshot.scene_active);
        }
    }

    #[test]
    fn test_decode_is_deterministic() {
        let mut data = frame(0xA5, 18);
        data[8] = 0x34;
        data[9] = 0x12;
        data[12] = 0x02;
        assert_eq!(decode_frame(&data), decode_frame(&data));
    }

    #[test]
    fn test_command_table() {
        let names: HashSet<_> = Command::ALL.iter().map(|c| c.name()).collect();
        assert_eq!(names.len(), Command::ALL.len());

        for command in Command::ALL {
            let bytes = encode(command.name()).unwrap();
            assert_eq!(bytes.len(), COMMAND_SIZE);
            assert_eq!(&bytes[..2], &[0x04, 0x02]);
            assert_eq!(command.payload().as_ref(), &bytes);
        }
    }

    #[test]
    fn test_command_payloads() {
        assert_eq!(Command::HeadUp.to_bytes(), [0x04, 0x02, 0x00, 0x00, 0x00, 0x10]);
        assert_eq!(Command::Memory1.to_bytes(), [0x04, 0x02, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(Command::Stop.to_bytes(), Command::Flat.to_bytes());
        assert_eq!(Command::StatusRequest.to_bytes(), [0x04, 0x02, 0, 0, 0, 0]);
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(encode("wiggle"), Err(ErgoError::UnknownCommand(name)) if name == "wiggle"));
    }

    #[test]
    fn test_scene_commands() {
        for preset in ScenePreset::ALL {
            assert_eq!(preset.command().name(), preset.as_str());
        }
    }
}
