use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::GpioError;
use crate::gpio::{
    Direction, Edge, EdgeEvent, EventSender, GpioBackend, GpioChip, LineInfo, Pull,
};

pub const MOCK_LINE_COUNT: u32 = 54;

/// In-memory GPIO chip. Clones share the same simulated lines, so a test can
/// keep one clone to drive external signals while a session owns another.
#[derive(Clone)]
pub struct MockGpioBackend {
    bus: Arc<MockBus>,
}

struct MockBus {
    line_count: u32,
    epoch: Instant,
    lines: Mutex<HashMap<u32, MockLine>>, // keyed by line
    busy: Mutex<HashMap<u32, u32>>,
    open_chips: AtomicUsize,
    last_opened: Mutex<Option<u32>>,
}

#[derive(Default)]
struct MockLine {
    level: bool,
    claim: Option<MockClaim>,
}

struct MockClaim {
    direction: Direction,
    pull: Pull,
    edge: Option<Edge>,
    debounce: Option<Duration>,
    sink: Option<EventSender>,
    last_event: Option<Instant>,
}

impl MockClaim {
    fn new(direction: Direction, pull: Pull) -> Self {
        Self {
            direction,
            pull,
            edge: None,
            debounce: None,
            sink: None,
            last_event: None,
        }
    }
}

impl Default for MockGpioBackend {
    fn default() -> Self {
        Self::new(MOCK_LINE_COUNT)
    }
}

impl MockGpioBackend {
    pub fn new(line_count: u32) -> Self {
        Self {
            bus: Arc::new(MockBus {
                line_count,
                epoch: Instant::now(),
                lines: Mutex::new(HashMap::new()),
                busy: Mutex::new(HashMap::new()),
                open_chips: AtomicUsize::new(0),
                last_opened: Mutex::new(None),
            }),
        }
    }

    /// Drives `line` from outside, as a button or another device would.
    /// Ignored for lines claimed as outputs.
    pub fn drive(&self, line: u32, level: bool) -> Result<(), GpioError> {
        let mut lines = self.bus.lock_lines()?;
        let entry = lines.entry(line).or_default();

        if entry
            .claim
            .as_ref()
            .is_some_and(|c| c.direction == Direction::Output)
        {
            return Ok(());
        }

        let old = entry.level;
        entry.level = level;

        let observed = match (old, level) {
            (false, true) => Edge::Rising,
            (true, false) => Edge::Falling,
            _ => return Ok(()),
        };

        if let Some(claim) = entry.claim.as_mut()
            && let (Some(edge), Some(sink)) = (claim.edge, claim.sink.as_ref())
            && edge.matches(observed)
        {
            let now = Instant::now();
            let allow = match (claim.last_event, claim.debounce) {
                (Some(last), Some(debounce)) => now.duration_since(last) >= debounce,
                _ => true,
            };
            if allow {
                claim.last_event = Some(now);
                let _ = sink.send(EdgeEvent {
                    line,
                    edge: observed,
                    timestamp_ns: now.duration_since(self.bus.epoch).as_nanos() as u64,
                });
            }
        }
        Ok(())
    }

    /// Current simulated level of `line`.
    pub fn level(&self, line: u32) -> Result<bool, GpioError> {
        Ok(self
            .bus
            .lock_lines()?
            .get(&line)
            .map(|l| l.level)
            .unwrap_or(false))
    }

    /// Makes the next `times` claims of `line` report the device as busy.
    pub fn inject_busy(&self, line: u32, times: u32) -> Result<(), GpioError> {
        self.bus
            .busy
            .lock()
            .map_err(|e| GpioError::Gpio(format!("lock poisoned: {e}")))?
            .insert(line, times);
        Ok(())
    }

    pub fn open_chips(&self) -> usize {
        self.bus.open_chips.load(Ordering::SeqCst)
    }

    pub fn last_opened(&self) -> Option<u32> {
        self.bus.last_opened.lock().ok().and_then(|g| *g)
    }
}

impl MockBus {
    fn lock_lines(&self) -> Result<MutexGuard<'_, HashMap<u32, MockLine>>, GpioError> {
        self.lines
            .lock()
            .map_err(|e| GpioError::Gpio(format!("lock poisoned: {e}")))
    }

    fn check_line(&self, line: u32) -> Result<(), GpioError> {
        if line < self.line_count {
            Ok(())
        } else {
            Err(GpioError::Gpio(format!("line {line} out of range")))
        }
    }

    fn take_busy(&self, line: u32) -> Result<(), GpioError> {
        let mut busy = self
            .busy
            .lock()
            .map_err(|e| GpioError::Gpio(format!("lock poisoned: {e}")))?;
        match busy.get_mut(&line) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(GpioError::DeviceBusy(format!("line {line} busy")))
            }
            _ => Ok(()),
        }
    }

    fn claim(&self, line: u32, claim: MockClaim, level: Option<bool>) -> Result<(), GpioError> {
        self.check_line(line)?;
        self.take_busy(line)?;
        let mut lines = self.lock_lines()?;
        let entry = lines.entry(line).or_default();
        let level = level.or(match claim.pull {
            Pull::Up => Some(true),
            Pull::Down => Some(false),
            Pull::Off => None,
        });
        if let Some(level) = level {
            entry.level = level;
        }
        entry.claim = Some(claim);
        Ok(())
    }
}

pub struct MockChip {
    bus: Arc<MockBus>,
}

impl Drop for MockChip {
    fn drop(&mut self) {
        // closing the chip releases every line it held
        if let Ok(mut lines) = self.bus.lock_lines() {
            for line in lines.values_mut() {
                line.claim = None;
            }
        }
        self.bus.open_chips.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GpioBackend for MockGpioBackend {
    type Chip = MockChip;

    fn open(&self, index: u32) -> Result<MockChip, GpioError> {
        self.bus.open_chips.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.bus.last_opened.lock() {
            *last = Some(index);
        }
        Ok(MockChip {
            bus: self.bus.clone(),
        })
    }
}

impl GpioChip for MockChip {
    fn line_count(&self) -> Result<u32, GpioError> {
        Ok(self.bus.line_count)
    }

    fn line_info(&self, line: u32) -> Result<LineInfo, GpioError> {
        self.bus.check_line(line)?;
        let lines = self.bus.lock_lines()?;
        Ok(match lines.get(&line).and_then(|l| l.claim.as_ref()) {
            None => LineInfo::unowned(Direction::Input),
            Some(claim) => LineInfo {
                owned: true,
                direction: claim.direction,
                pull: claim.pull,
                alert: claim.edge.is_some(),
                edge: claim.edge,
            },
        })
    }

    fn claim_input(&self, line: u32, pull: Pull) -> Result<(), GpioError> {
        self.bus
            .claim(line, MockClaim::new(Direction::Input, pull), None)
    }

    fn claim_output(&self, line: u32, level: bool) -> Result<(), GpioError> {
        self.bus.claim(
            line,
            MockClaim::new(Direction::Output, Pull::Off),
            Some(level),
        )
    }

    fn claim_alert(
        &self,
        line: u32,
        edge: Edge,
        pull: Pull,
        debounce: Option<Duration>,
        events: EventSender,
    ) -> Result<(), GpioError> {
        let claim = MockClaim {
            edge: Some(edge),
            debounce,
            sink: Some(events),
            ..MockClaim::new(Direction::Input, pull)
        };
        self.bus.claim(line, claim, None)
    }

    fn cancel_alert(&self, line: u32) -> Result<(), GpioError> {
        let mut lines = self.bus.lock_lines()?;
        if let Some(claim) = lines.get_mut(&line).and_then(|l| l.claim.as_mut()) {
            claim.edge = None;
            claim.debounce = None;
            claim.sink = None;
            claim.last_event = None;
        }
        Ok(())
    }

    fn free(&self, line: u32) -> Result<(), GpioError> {
        self.bus.check_line(line)?;
        let mut lines = self.bus.lock_lines()?;
        match lines.get_mut(&line) {
            Some(entry) if entry.claim.is_some() => {
                entry.claim = None;
                Ok(())
            }
            _ => Err(GpioError::Gpio(format!("line {line} is not claimed"))),
        }
    }

    fn read(&self, line: u32) -> Result<bool, GpioError> {
        self.bus.check_line(line)?;
        Ok(self
            .bus
            .lock_lines()?
            .get(&line)
            .map(|l| l.level)
            .unwrap_or(false))
    }

    fn write(&self, line: u32, level: bool) -> Result<(), GpioError> {
        let mut lines = self.bus.lock_lines()?;
        let entry = lines
            .get_mut(&line)
            .filter(|l| {
                l.claim
                    .as_ref()
                    .is_some_and(|c| c.direction == Direction::Output)
            })
            .ok_or_else(|| {
                GpioError::NotOutput(format!("line {line} must be claimed as an output"))
            })?;
        entry.level = level;
        Ok(())
    }
}
