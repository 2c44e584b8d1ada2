use log::{debug, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;

use crate::error::GpioError;
use crate::gpio::GpioChip;
use crate::line::LineController;

/// Frequencies the pulse worker can time, in Hz.
pub const MIN_FREQUENCY: f64 = 0.1;
pub const MAX_FREQUENCY: f64 = 10_000.0;

fn validate_frequency(frequency: f64) -> Result<f64, GpioError> {
    if frequency <= 0.0 || frequency.is_nan() {
        Err(GpioError::InvalidArgument(
            "frequency must be greater than 0.0".into(),
        ))
    } else if (MIN_FREQUENCY..=MAX_FREQUENCY).contains(&frequency) {
        Ok(frequency)
    } else {
        Err(GpioError::InvalidArgument(format!(
            "frequency must be between {MIN_FREQUENCY} and {MAX_FREQUENCY} Hz"
        )))
    }
}

fn validate_duty_cycle(duty_cycle: f64) -> Result<f64, GpioError> {
    if (0.0..=100.0).contains(&duty_cycle) {
        Ok(duty_cycle)
    } else {
        Err(GpioError::InvalidArgument(
            "duty cycle must be between 0.0 and 100.0".into(),
        ))
    }
}

/// Hands out at most one [`PwmHandle`] per line.
pub struct SoftPwmController<C: GpioChip> {
    lines: Arc<LineController<C>>,
    active: Arc<Mutex<FxHashSet<u32>>>,
}

impl<C: GpioChip> SoftPwmController<C> {
    pub fn new(lines: Arc<LineController<C>>) -> Self {
        Self {
            lines,
            active: Arc::new(Mutex::new(FxHashSet::default())),
        }
    }

    pub fn is_active(&self, line: u32) -> bool {
        self.active.lock().contains(&line)
    }

    pub fn create(&self, line: u32, frequency: f64) -> Result<PwmHandle<C>, GpioError> {
        let mut active = self.active.lock();
        if active.contains(&line) {
            return Err(GpioError::AlreadyExists(format!(
                "a PWM object already exists for line {line}"
            )));
        }
        if !self.lines.info(line)?.is_output() {
            return Err(GpioError::NotOutput(format!(
                "line {line} must be set up as an output first"
            )));
        }
        let frequency = validate_frequency(frequency)?;
        active.insert(line);

        Ok(PwmHandle {
            line,
            frequency,
            duty_cycle: 0.0,
            lines: self.lines.clone(),
            active: self.active.clone(),
            worker: None,
        })
    }
}

/// Software PWM on one output line. Dropping the handle stops the output and
/// drives the line low.
pub struct PwmHandle<C: GpioChip> {
    line: u32,
    frequency: f64,
    duty_cycle: f64,
    lines: Arc<LineController<C>>,
    active: Arc<Mutex<FxHashSet<u32>>>,
    worker: Option<PwmWorker>,
}

impl<C: GpioChip> PwmHandle<C> {
    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn duty_cycle(&self) -> f64 {
        self.duty_cycle
    }

    /// True while the pulse worker is alive. A worker whose line stopped
    /// accepting writes counts as stopped.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(PwmWorker::is_alive)
    }

    fn require_output(&self) -> Result<(), GpioError> {
        if self.lines.info(self.line)?.is_output() {
            Ok(())
        } else {
            Err(GpioError::NotOutput(format!(
                "line {} is no longer set up as an output",
                self.line
            )))
        }
    }

    pub fn start(&mut self, duty_cycle: f64) -> Result<(), GpioError> {
        self.require_output()?;
        self.change_duty_cycle(duty_cycle)?;
        if !self.is_running() {
            // a dead worker is joined before its replacement starts
            self.worker = None;
            self.worker = Some(PwmWorker::spawn(
                self.line,
                self.lines.clone(),
                self.frequency,
                self.duty_cycle,
            )?);
            debug!(
                "pwm on line {} started at {} Hz, {}%",
                self.line, self.frequency, self.duty_cycle
            );
        }
        Ok(())
    }

    pub fn change_duty_cycle(&mut self, duty_cycle: f64) -> Result<(), GpioError> {
        let duty_cycle = validate_duty_cycle(duty_cycle)?;
        if self.worker.is_some() {
            self.require_output()?;
        }
        self.duty_cycle = duty_cycle;
        if let Some(worker) = &self.worker {
            worker.update(self.frequency, self.duty_cycle);
        }
        Ok(())
    }

    pub fn change_frequency(&mut self, frequency: f64) -> Result<(), GpioError> {
        let frequency = validate_frequency(frequency)?;
        if self.worker.is_some() {
            self.require_output()?;
        }
        self.frequency = frequency;
        if let Some(worker) = &self.worker {
            worker.update(self.frequency, self.duty_cycle);
        }
        Ok(())
    }

    /// Halts the output and drives the line low. Never fails.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            drop(worker);
            debug!("pwm on line {} stopped", self.line);
        }
        if let Ok(chip) = self.lines.chip()
            && let Err(e) = chip.write(self.line, false)
        {
            debug!("drive line {} low after pwm: {e}", self.line);
        }
    }
}

impl<C: GpioChip> Drop for PwmHandle<C> {
    fn drop(&mut self) {
        self.stop();
        self.active.lock().remove(&self.line);
    }
}

struct PwmParams {
    frequency: f64,
    duty_cycle: f64,
    generation: u64,
    cancel: bool,
}

type SharedParams = Arc<(Mutex<PwmParams>, Condvar)>;

struct PwmWorker {
    params: SharedParams,
    handle: Option<JoinHandle<()>>,
}

impl PwmWorker {
    fn spawn<C: GpioChip>(
        line: u32,
        lines: Arc<LineController<C>>,
        frequency: f64,
        duty_cycle: f64,
    ) -> Result<Self, GpioError> {
        let params: SharedParams = Arc::new((
            Mutex::new(PwmParams {
                frequency,
                duty_cycle,
                generation: 0,
                cancel: false,
            }),
            Condvar::new(),
        ));
        let shared = params.clone();

        let handle = thread::Builder::new()
            .name(format!("pwm-{line}"))
            .spawn(move || pulse_loop(line, &lines, &shared))
            .map_err(|e| GpioError::Gpio(format!("spawn pwm worker: {e}")))?;

        Ok(Self {
            params,
            handle: Some(handle),
        })
    }

    fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn update(&self, frequency: f64, duty_cycle: f64) {
        let (lock, cond) = &*self.params;
        let mut params = lock.lock();
        params.frequency = frequency;
        params.duty_cycle = duty_cycle;
        params.generation += 1;
        cond.notify_all();
    }
}

impl Drop for PwmWorker {
    fn drop(&mut self) {
        {
            let (lock, cond) = &*self.params;
            lock.lock().cancel = true;
            cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum Pause {
    Elapsed,
    Changed,
    Cancelled,
}

/// Sleeps for `duration` unless the parameters change or the worker is
/// cancelled first.
fn pause(params: &SharedParams, generation: u64, duration: Duration) -> Pause {
    let (lock, cond) = &**params;
    let mut p = lock.lock();
    cond.wait_while_for(
        &mut p,
        |p| !p.cancel && p.generation == generation,
        duration,
    );
    if p.cancel {
        Pause::Cancelled
    } else if p.generation != generation {
        Pause::Changed
    } else {
        Pause::Elapsed
    }
}

fn pulse_loop<C: GpioChip>(line: u32, lines: &LineController<C>, params: &SharedParams) {
    loop {
        let (frequency, duty_cycle, generation) = {
            let p = params.0.lock();
            if p.cancel {
                return;
            }
            (p.frequency, p.duty_cycle, p.generation)
        };

        let Ok(period) = Duration::try_from_secs_f64(1.0 / frequency) else {
            warn!("pwm on line {line} stopped: period of {frequency} Hz is out of range");
            return;
        };
        let high = period.mul_f64(duty_cycle / 100.0);
        let low = period.saturating_sub(high);

        for (level, duration) in [(true, high), (false, low)] {
            if duration.is_zero() {
                continue;
            }
            let written = lines.chip().and_then(|chip| chip.write(line, level));
            if let Err(e) = written {
                warn!("pwm on line {line} stopped: {e}");
                return;
            }
            match pause(params, generation, duration) {
                Pause::Elapsed => {}
                Pause::Changed => break,
                Pause::Cancelled => return,
            }
        }
    }
}
