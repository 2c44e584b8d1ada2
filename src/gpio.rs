use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::GpioError;

/// Attempts made for an operation the kernel reports as busy.
pub const BUSY_RETRY_COUNT: usize = 3;
pub const BUSY_RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[serde(alias = "in")]
    Input,
    #[serde(alias = "out")]
    Output,
}

#[derive(Debug, Hash, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Pull {
    #[default]
    Off,
    Up,
    Down,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether an observed transition qualifies for a watch on `self`.
    pub fn matches(self, observed: Edge) -> bool {
        match self {
            Edge::Rising => observed == Edge::Rising,
            Edge::Falling => observed == Edge::Falling,
            Edge::Both => matches!(observed, Edge::Rising | Edge::Falling),
        }
    }
}

/// Kernel-side status of a single line as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineInfo {
    pub owned: bool,
    pub direction: Direction,
    pub pull: Pull,
    pub alert: bool,
    /// Edge detection currently configured in the kernel, if it reports one.
    pub edge: Option<Edge>,
}

impl LineInfo {
    pub fn unowned(direction: Direction) -> Self {
        Self {
            owned: false,
            direction,
            pull: Pull::Off,
            alert: false,
            edge: None,
        }
    }

    pub fn is_input(&self) -> bool {
        self.owned && (self.direction == Direction::Input || self.alert)
    }

    pub fn is_output(&self) -> bool {
        self.owned && self.direction == Direction::Output
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub line: u32,
    pub edge: Edge,
    pub timestamp_ns: u64,
}

pub type EventSender = mpsc::UnboundedSender<EdgeEvent>;

/// Opens GPIO chips. One implementation talks to the kernel, the other is an
/// in-memory simulation.
pub trait GpioBackend: Send + Sync + 'static {
    type Chip: GpioChip;

    fn open(&self, index: u32) -> Result<Self::Chip, GpioError>;
}

/// Line-level primitives on an open chip. Dropping the chip releases every
/// line it still holds.
pub trait GpioChip: Send + Sync + 'static {
    fn line_count(&self) -> Result<u32, GpioError>;
    fn line_info(&self, line: u32) -> Result<LineInfo, GpioError>;
    fn claim_input(&self, line: u32, pull: Pull) -> Result<(), GpioError>;
    fn claim_output(&self, line: u32, level: bool) -> Result<(), GpioError>;
    fn claim_alert(
        &self,
        line: u32,
        edge: Edge,
        pull: Pull,
        debounce: Option<Duration>,
        events: EventSender,
    ) -> Result<(), GpioError>;
    /// Disarms edge detection on `line` and discards edges still queued.
    /// The line stays claimed as an input.
    fn cancel_alert(&self, line: u32) -> Result<(), GpioError>;
    fn free(&self, line: u32) -> Result<(), GpioError>;
    fn read(&self, line: u32) -> Result<bool, GpioError>;
    fn write(&self, line: u32, level: bool) -> Result<(), GpioError>;
}

pub(crate) fn retry_busy<T>(mut op: impl FnMut() -> Result<T, GpioError>) -> Result<T, GpioError> {
    let mut last = String::new();
    for _ in 0..BUSY_RETRY_COUNT {
        match op() {
            Err(GpioError::DeviceBusy(msg)) => {
                last = msg;
                thread::sleep(BUSY_RETRY_DELAY);
            }
            other => return other,
        }
    }
    Err(GpioError::DeviceBusy(format!(
        "still busy after {BUSY_RETRY_COUNT} attempts: {last}"
    )))
}
