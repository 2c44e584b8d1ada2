use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::GpioError;
use crate::gpio::{Direction, GpioChip, LineInfo, Pull, retry_busy};

/// Logical lines with a physical pull-up fitted on the board.
const HARDWARE_PULLED_LINES: [u32; 2] = [2, 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineState {
    pub direction: Direction,
    pub pull: Pull,
}

/// Owns the open chip and every line claimed through it.
pub struct LineController<C: GpioChip> {
    chip: RwLock<Option<Arc<C>>>,
    states: RwLock<FxHashMap<u32, LineState>>,
    warnings: AtomicBool,
}

impl<C: GpioChip> Default for LineController<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: GpioChip> LineController<C> {
    pub fn new() -> Self {
        Self {
            chip: RwLock::new(None),
            states: RwLock::new(FxHashMap::default()),
            warnings: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.chip.read().is_some()
    }

    pub(crate) fn open(&self, chip: C) {
        *self.chip.write() = Some(Arc::new(chip));
    }

    pub(crate) fn close(&self) {
        self.states.write().clear();
        if self.chip.write().take().is_some() {
            debug!("closed gpio chip");
        }
    }

    pub fn chip(&self) -> Result<Arc<C>, GpioError> {
        self.chip.read().clone().ok_or_else(GpioError::mode_not_set)
    }

    pub fn set_warnings(&self, enabled: bool) {
        self.warnings.store(enabled, Ordering::Relaxed);
    }

    pub fn warnings(&self) -> bool {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn state(&self, line: u32) -> Option<LineState> {
        self.states.read().get(&line).copied()
    }

    pub fn info(&self, line: u32) -> Result<LineInfo, GpioError> {
        let chip = self.chip()?;
        retry_busy(|| chip.line_info(line))
    }

    /// Validates a claim request and resolves the pull to apply.
    pub fn validate_claim(
        direction: Direction,
        pull: Option<Pull>,
        initial: Option<bool>,
    ) -> Result<Pull, GpioError> {
        match direction {
            Direction::Input => {
                if initial.is_some() {
                    return Err(GpioError::InvalidArgument(
                        "initial level is not valid for inputs".into(),
                    ));
                }
                Ok(pull.unwrap_or_default())
            }
            Direction::Output => match pull {
                None | Some(Pull::Off) => Ok(Pull::Off),
                Some(_) => Err(GpioError::InvalidArgument(
                    "pull is not valid for outputs".into(),
                )),
            },
        }
    }

    pub fn claim(
        &self,
        line: u32,
        direction: Direction,
        pull: Option<Pull>,
        initial: Option<bool>,
    ) -> Result<(), GpioError> {
        let pull = Self::validate_claim(direction, pull, initial)?;
        let chip = self.chip()?;

        if self.warnings() && HARDWARE_PULLED_LINES.contains(&line) && pull != Pull::Off {
            warn!("A physical pull up resistor is fitted on line {line}");
        }

        match direction {
            Direction::Input => {
                // the kernel keeps line flags until the line is released
                if let Err(e) = chip.free(line) {
                    debug!("free before reclaim of line {line}: {e}");
                }
                retry_busy(|| chip.claim_input(line, pull))?;
            }
            Direction::Output => {
                let level = match initial {
                    Some(level) => level,
                    None => retry_busy(|| chip.read(line))?,
                };
                retry_busy(|| chip.claim_output(line, level))?;
            }
        }

        self.states
            .write()
            .insert(line, LineState { direction, pull });
        debug!("claimed line {line} as {direction:?} with pull {pull:?}");
        Ok(())
    }

    pub fn read(&self, line: u32) -> Result<bool, GpioError> {
        if !self.info(line)?.owned {
            return Err(GpioError::NotClaimed(format!(
                "line {line} must be set up first"
            )));
        }
        let chip = self.chip()?;
        retry_busy(|| chip.read(line))
    }

    /// Writes `values` to `lines`. A single value is broadcast to every line.
    /// Lines already written stay written if a later line fails.
    pub fn write(&self, lines: &[u32], values: &[bool]) -> Result<(), GpioError> {
        let values: Vec<bool> = if lines.len() == values.len() {
            values.to_vec()
        } else if lines.len() > 1 && values.len() == 1 {
            vec![values[0]; lines.len()]
        } else {
            return Err(GpioError::CountMismatch(format!(
                "{} channels but {} values",
                lines.len(),
                values.len()
            )));
        };

        let chip = self.chip()?;
        for (&line, &level) in lines.iter().zip(values.iter()) {
            if !retry_busy(|| chip.line_info(line))?.is_output() {
                return Err(GpioError::NotOutput(format!(
                    "line {line} has not been set up as an output"
                )));
            }
            retry_busy(|| chip.write(line, level))?;
        }
        Ok(())
    }

    /// Reports Input or Output; alternate functions are not visible here.
    pub fn function(&self, line: u32) -> Result<Direction, GpioError> {
        Ok(self.info(line)?.direction)
    }

    /// Resets `line` to an input without pull and releases it. Errors are
    /// ignored since the line may not belong to this process.
    pub fn free(&self, line: u32) {
        self.states.write().remove(&line);
        let Ok(chip) = self.chip() else {
            return;
        };
        if let Err(e) = chip.claim_input(line, Pull::Off) {
            debug!("reset line {line} to input: {e}");
        }
        if let Err(e) = chip.free(line) {
            debug!("free line {line}: {e}");
        }
    }

    /// Lines the kernel reports as owned by this process.
    pub fn owned_lines(&self) -> Result<Vec<u32>, GpioError> {
        let chip = self.chip()?;
        let count = retry_busy(|| chip.line_count())?;
        let mut owned = Vec::new();
        for line in 0..count {
            if retry_busy(|| chip.line_info(line))?.owned {
                owned.push(line);
            }
        }
        Ok(owned)
    }
}
