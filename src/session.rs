use log::{debug, warn};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::alert::{AlertRegistry, EdgeCallback, normalize_debounce, validate_timeout};
use crate::config::AppConfig;
use crate::error::GpioError;
use crate::gpio::{Direction, Edge, EdgeEvent, GpioBackend, Pull};
use crate::line::LineController;
use crate::mapper::{ChannelList, ChannelMapper, Levels, NumberingMode};
use crate::pwm::{PwmHandle, SoftPwmController};

/// Everything one user of the GPIO header needs: numbering mode, the open
/// chip, claimed lines, edge watches and PWM outputs. Operations take
/// channels relative to the current numbering mode.
pub struct Session<B: GpioBackend> {
    config: Arc<AppConfig>,
    backend: Arc<B>,
    mapper: Arc<ChannelMapper>,
    lines: Arc<LineController<B::Chip>>,
    alerts: AlertRegistry<B::Chip>,
    pwm: SoftPwmController<B::Chip>,
}

impl<B: GpioBackend> Session<B> {
    pub fn new(config: Arc<AppConfig>, backend: Arc<B>) -> Result<Self, GpioError> {
        let mapper = Arc::new(ChannelMapper::new());
        let lines = Arc::new(LineController::new());
        lines.set_warnings(config.warnings);
        let alerts = AlertRegistry::new(lines.clone(), mapper.clone(), config.broadcast_capacity)?;
        let pwm = SoftPwmController::new(lines.clone());

        Ok(Self {
            config,
            backend,
            mapper,
            lines,
            alerts,
            pwm,
        })
    }

    pub fn mapper(&self) -> &ChannelMapper {
        &self.mapper
    }

    pub fn lines(&self) -> &LineController<B::Chip> {
        &self.lines
    }

    pub fn alerts(&self) -> &AlertRegistry<B::Chip> {
        &self.alerts
    }

    pub fn mode(&self) -> NumberingMode {
        self.mapper.mode()
    }

    /// Selects the numbering mode, opening the chip on first use. Setting the
    /// mode already in effect is a no-op.
    pub fn set_mode(&self, mode: NumberingMode) -> Result<(), GpioError> {
        self.mapper.check_mode(mode)?;
        if !self.lines.is_open() {
            let index = self.config.resolve_chip_index()?;
            let chip = self.backend.open(index)?;
            self.lines.open(chip);
            debug!("opened gpio chip {index}");
        }
        self.mapper.set_mode(mode)
    }

    pub fn set_warnings(&self, enabled: bool) {
        self.lines.set_warnings(enabled);
    }

    pub fn setup(
        &self,
        channels: impl Into<ChannelList>,
        direction: Direction,
        pull: Option<Pull>,
        initial: Option<bool>,
    ) -> Result<(), GpioError> {
        LineController::<B::Chip>::validate_claim(direction, pull, initial)?;
        for line in self.mapper.to_line_list(&channels.into())? {
            self.alerts.remove(line);
            self.lines.claim(line, direction, pull, initial)?;
        }
        Ok(())
    }

    pub fn input(&self, channel: i64) -> Result<bool, GpioError> {
        let line = self.mapper.to_line(channel)?;
        self.lines.read(line)
    }

    pub fn output(
        &self,
        channels: impl Into<ChannelList>,
        values: impl Into<Levels>,
    ) -> Result<(), GpioError> {
        let lines = self.mapper.to_line_list(&channels.into())?;
        self.lines.write(&lines, values.into().as_slice())
    }

    pub fn function(&self, channel: i64) -> Result<Direction, GpioError> {
        let line = self.mapper.to_line(channel)?;
        self.lines.function(line)
    }

    /// Blocks until `edge` occurs on `channel`. Returns the channel, or `None`
    /// once `timeout_ms` has elapsed.
    pub fn wait_for_edge(
        &self,
        channel: i64,
        edge: Edge,
        debounce_ms: Option<i64>,
        timeout_ms: Option<i64>,
    ) -> Result<Option<i64>, GpioError> {
        let line = self.mapper.to_line(channel)?;
        let debounce = normalize_debounce(debounce_ms)?;
        let timeout = validate_timeout(timeout_ms)?;
        self.alerts.wait(line, channel, edge, debounce, timeout)
    }

    pub fn add_event_detect(
        &self,
        channel: i64,
        edge: Edge,
        callback: Option<EdgeCallback>,
        debounce_ms: Option<i64>,
    ) -> Result<(), GpioError> {
        let line = self.mapper.to_line(channel)?;
        let debounce = normalize_debounce(debounce_ms)?;
        self.alerts.add_detect(line, edge, debounce, callback)
    }

    pub fn add_event_callback(&self, channel: i64, callback: EdgeCallback) -> Result<(), GpioError> {
        let line = self.mapper.to_line(channel)?;
        self.alerts.add_callback(line, callback)
    }

    pub fn remove_event_detect(&self, channel: i64) -> Result<(), GpioError> {
        let line = self.mapper.to_line(channel)?;
        self.alerts.remove(line);
        Ok(())
    }

    /// True once per edge seen since the previous call.
    pub fn event_detected(&self, channel: i64) -> Result<bool, GpioError> {
        let line = self.mapper.to_line(channel)?;
        Ok(self.alerts.poll_detected(line))
    }

    pub fn pwm(&self, channel: i64, frequency: f64) -> Result<PwmHandle<B::Chip>, GpioError> {
        let line = self.mapper.to_line(channel)?;
        self.pwm.create(line, frequency)
    }

    pub fn pwm_active(&self, channel: i64) -> Result<bool, GpioError> {
        let line = self.mapper.to_line(channel)?;
        Ok(self.pwm.is_active(line))
    }

    /// Resets channels to unpulled inputs and drops their edge watches. With
    /// no channels every line this process owns is reset, the chip is closed
    /// and the numbering mode is cleared.
    pub fn cleanup(&self, channels: Option<ChannelList>) -> Result<(), GpioError> {
        if !self.lines.is_open() {
            return Ok(());
        }

        let close = channels.is_none();
        let lines = match channels {
            Some(channels) => self.mapper.to_line_list(&channels)?,
            None => {
                self.alerts.remove_all();
                self.lines.owned_lines()?
            }
        };

        if lines.is_empty() {
            if self.lines.warnings() {
                warn!(
                    "No channels have been set up yet - nothing to clean up! \
                     Try cleaning up at the end of your program instead!"
                );
            }
        } else {
            for line in &lines {
                self.alerts.remove(*line);
                self.lines.free(*line);
            }
            debug!("cleaned up lines {lines:?}");
        }

        if close {
            self.lines.close();
            self.mapper.reset();
        }
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EdgeEvent> {
        self.alerts.subscribe()
    }
}
