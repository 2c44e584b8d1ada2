use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GpioError;

/// Logical line numbers accepted in logical mode are `0..LOGICAL_LINE_COUNT`.
pub const LOGICAL_LINE_COUNT: i64 = 54;

/// 40-pin header positions wired to a GPIO line, Model B+ onwards.
const BOARD_MAP: [(i64, u32); 26] = [
    (3, 2),
    (5, 3),
    (7, 4),
    (8, 14),
    (10, 15),
    (11, 17),
    (12, 18),
    (13, 27),
    (15, 22),
    (16, 23),
    (18, 24),
    (19, 10),
    (21, 9),
    (22, 25),
    (23, 11),
    (24, 8),
    (26, 7),
    (29, 5),
    (31, 6),
    (32, 12),
    (33, 13),
    (35, 19),
    (36, 16),
    (37, 26),
    (38, 20),
    (40, 21),
];

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NumberingMode {
    #[default]
    Unset,
    Board,
    #[serde(alias = "bcm")]
    Logical,
}

/// One channel or an ordered list of channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelList {
    One(i64),
    Many(Vec<i64>),
}

impl ChannelList {
    pub fn as_slice(&self) -> &[i64] {
        match self {
            ChannelList::One(c) => std::slice::from_ref(c),
            ChannelList::Many(cs) => cs,
        }
    }
}

impl From<i64> for ChannelList {
    fn from(channel: i64) -> Self {
        ChannelList::One(channel)
    }
}

impl From<Vec<i64>> for ChannelList {
    fn from(channels: Vec<i64>) -> Self {
        ChannelList::Many(channels)
    }
}

impl From<&[i64]> for ChannelList {
    fn from(channels: &[i64]) -> Self {
        ChannelList::Many(channels.to_vec())
    }
}

impl<const N: usize> From<[i64; N]> for ChannelList {
    fn from(channels: [i64; N]) -> Self {
        ChannelList::Many(channels.to_vec())
    }
}

impl TryFrom<&Value> for ChannelList {
    type Error = GpioError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let invalid =
            || GpioError::InvalidArgument("channel must be an integer or list of integers".into());
        match value {
            Value::Number(n) => n.as_i64().map(ChannelList::One).ok_or_else(invalid),
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_i64().ok_or_else(invalid))
                .collect::<Result<Vec<_>, _>>()
                .map(ChannelList::Many),
            _ => Err(invalid()),
        }
    }
}

/// One output level or an ordered list of levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Levels {
    One(bool),
    Many(Vec<bool>),
}

impl Levels {
    pub fn as_slice(&self) -> &[bool] {
        match self {
            Levels::One(v) => std::slice::from_ref(v),
            Levels::Many(vs) => vs,
        }
    }
}

impl From<bool> for Levels {
    fn from(level: bool) -> Self {
        Levels::One(level)
    }
}

impl From<Vec<bool>> for Levels {
    fn from(levels: Vec<bool>) -> Self {
        Levels::Many(levels)
    }
}

impl<const N: usize> From<[bool; N]> for Levels {
    fn from(levels: [bool; N]) -> Self {
        Levels::Many(levels.to_vec())
    }
}

impl TryFrom<&Value> for Levels {
    type Error = GpioError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let invalid = || {
            GpioError::InvalidArgument(
                "value must be an integer/boolean or list of integers/booleans".into(),
            )
        };
        let level = |v: &Value| match v {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|i| i != 0),
            _ => None,
        };
        match value {
            Value::Array(items) => items
                .iter()
                .map(|v| level(v).ok_or_else(invalid))
                .collect::<Result<Vec<_>, _>>()
                .map(Levels::Many),
            other => level(other).map(Levels::One).ok_or_else(invalid),
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelMapper {
    mode: RwLock<NumberingMode>,
}

impl ChannelMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> NumberingMode {
        *self.mode.read()
    }

    /// Checks that `mode` may be applied without changing anything.
    pub fn check_mode(&self, mode: NumberingMode) -> Result<(), GpioError> {
        let current = self.mode();
        if current != NumberingMode::Unset && current != mode {
            return Err(GpioError::ModeConflict(
                "a different mode has already been set".into(),
            ));
        }
        if mode == NumberingMode::Unset {
            return Err(GpioError::InvalidMode(
                "mode must be either board or logical".into(),
            ));
        }
        Ok(())
    }

    pub fn set_mode(&self, mode: NumberingMode) -> Result<(), GpioError> {
        self.check_mode(mode)?;
        *self.mode.write() = mode;
        Ok(())
    }

    pub(crate) fn reset(&self) {
        *self.mode.write() = NumberingMode::Unset;
    }

    pub fn to_line(&self, channel: i64) -> Result<u32, GpioError> {
        let invalid = || GpioError::InvalidChannel(format!("channel {channel} is not usable"));
        match self.mode() {
            NumberingMode::Unset => Err(GpioError::mode_not_set()),
            NumberingMode::Logical => {
                if (0..LOGICAL_LINE_COUNT).contains(&channel) {
                    u32::try_from(channel).map_err(|_| invalid())
                } else {
                    Err(invalid())
                }
            }
            NumberingMode::Board => BOARD_MAP
                .iter()
                .find(|(pin, _)| *pin == channel)
                .map(|(_, line)| *line)
                .ok_or_else(invalid),
        }
    }

    pub fn from_line(&self, line: u32) -> Result<i64, GpioError> {
        match self.mode() {
            NumberingMode::Unset => Err(GpioError::mode_not_set()),
            NumberingMode::Logical => Ok(i64::from(line)),
            NumberingMode::Board => BOARD_MAP
                .iter()
                .find(|(_, l)| *l == line)
                .map(|(pin, _)| *pin)
                .ok_or_else(|| {
                    GpioError::InvalidChannel(format!("line {line} is not on the header"))
                }),
        }
    }

    pub fn to_line_list(&self, channels: &ChannelList) -> Result<Vec<u32>, GpioError> {
        channels
            .as_slice()
            .iter()
            .map(|c| self.to_line(*c))
            .collect()
    }

    /// Board positions that map to a line, in header order.
    pub fn board_positions() -> impl Iterator<Item = i64> {
        BOARD_MAP.iter().map(|(pin, _)| *pin)
    }
}
