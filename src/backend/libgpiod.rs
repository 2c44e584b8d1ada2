use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::GpioError;
use crate::gpio::{
    Direction, Edge, EdgeEvent, EventSender, GpioBackend, GpioChip, LineInfo, Pull,
};

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT: Duration = Duration::from_millis(10);
const EBUSY: i32 = 16;

fn gpiod_err(context: &str, e: libgpiod::Error) -> GpioError {
    match e {
        libgpiod::Error::OperationFailed(_, errno) if errno.0 == EBUSY => {
            GpioError::DeviceBusy(format!("{context}: {errno}"))
        }
        e => GpioError::Gpio(format!("{context}: {e}")),
    }
}

fn open_chip(path: &Path) -> Result<Chip, GpioError> {
    Chip::open(&path).map_err(|e| gpiod_err(&format!("open chip {}", path.display()), e))
}

fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, GpioError> {
    let mut req_cfg = request::Config::new().map_err(|e| gpiod_err("request config", e))?;
    req_cfg
        .set_consumer(env!("CARGO_PKG_NAME"))
        .map_err(|e| gpiod_err("request consumer", e))?;
    chip.request_lines(Some(&req_cfg), line_cfg)
        .map_err(|e| gpiod_err("request lines", e))
}

fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, GpioError> {
    let mut cfg = line::Config::new().map_err(|e| gpiod_err("line config", e))?;
    cfg.add_line_settings(&[offset], settings)
        .map_err(|e| gpiod_err("line config add settings", e))?;
    Ok(cfg)
}

fn to_gpiod_edge(edge: Edge) -> line::Edge {
    match edge {
        Edge::Rising => line::Edge::Rising,
        Edge::Falling => line::Edge::Falling,
        Edge::Both => line::Edge::Both,
    }
}

fn from_gpiod_edge(edge: line::Edge) -> Edge {
    match edge {
        line::Edge::Rising => Edge::Rising,
        line::Edge::Falling => Edge::Falling,
        line::Edge::Both => Edge::Both,
    }
}

/// What a claim asks the kernel for.
struct LineRequest {
    direction: Direction,
    pull: Pull,
    level: Option<bool>,
    edge: Option<Edge>,
    debounce: Option<Duration>,
}

impl LineRequest {
    fn settings(&self) -> Result<line::Settings, GpioError> {
        let mut ls = line::Settings::new().map_err(|e| gpiod_err("libgpiod settings", e))?;

        match self.direction {
            Direction::Output => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| gpiod_err("set direction", e))?;
                ls.set_output_value(match self.level {
                    Some(true) => line::Value::Active,
                    _ => line::Value::InActive,
                })
                .map_err(|e| gpiod_err("set output value", e))?;
            }
            Direction::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| gpiod_err("set direction", e))?;
                ls.set_bias(Some(match self.pull {
                    Pull::Off => line::Bias::Disabled,
                    Pull::Up => line::Bias::PullUp,
                    Pull::Down => line::Bias::PullDown,
                }))
                .map_err(|e| gpiod_err("set bias", e))?;
            }
        }

        if let Some(edge) = self.edge {
            ls.set_edge_detection(Some(to_gpiod_edge(edge)))
                .map_err(|e| gpiod_err("set edge detection", e))?;
            ls.set_event_clock(EventClock::Realtime)
                .map_err(|e| gpiod_err("set event clock", e))?;
            if let Some(debounce) = self.debounce {
                ls.set_debounce_period(debounce);
            }
        }

        Ok(ls)
    }
}

struct LineHandle {
    direction: Direction,
    pull: Pull,
    request: Arc<FairMutex<request::Request>>,
    listener: Option<EdgeListener>,
}

struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        line: u32,
        request: Arc<FairMutex<request::Request>>,
        events: EventSender,
    ) -> Result<Self, GpioError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| gpiod_err("event buffer", e))?;

        let handle = std::thread::spawn(move || {
            while !cancel_flag.load(Ordering::Relaxed) {
                let req = request.lock();

                let has_event =
                    match req.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT)) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("wait edge events error for line {line}: {e}");
                            yield_now();
                            continue;
                        }
                    };
                if !has_event {
                    continue;
                }

                let events_read = match req.read_edge_events(&mut buffer) {
                    Ok(evts) => evts,
                    Err(e) => {
                        warn!("read edge events error for line {line}: {e}");
                        yield_now();
                        continue;
                    }
                };
                for evt in events_read {
                    let evt = match evt {
                        Ok(e) => e,
                        Err(_) => continue,
                    };
                    let edge = match evt.event_type() {
                        Ok(line::EdgeKind::Rising) => Edge::Rising,
                        Ok(line::EdgeKind::Falling) => Edge::Falling,
                        Err(_) => continue,
                    };

                    let sent = events.send(EdgeEvent {
                        line,
                        edge,
                        timestamp_ns: evt.timestamp().as_nanos() as u64,
                    });
                    if sent.is_err() {
                        debug!("edge dispatcher gone, listener for line {line} exits");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Opens `/dev/gpiochipN` through libgpiod.
pub struct LibgpiodBackend;

impl LibgpiodBackend {
    pub fn new() -> Result<Self, GpioError> {
        Ok(Self)
    }
}

impl GpioBackend for LibgpiodBackend {
    type Chip = LibgpiodChip;

    fn open(&self, index: u32) -> Result<LibgpiodChip, GpioError> {
        let path = PathBuf::from(format!("/dev/gpiochip{index}"));
        let chip = open_chip(&path)?;
        let line_count = chip
            .info()
            .map_err(|e| gpiod_err("chip info", e))?
            .num_lines() as u32;

        Ok(LibgpiodChip {
            path,
            line_count,
            lines: RwLock::new(FxHashMap::default()),
        })
    }
}

/// Every claimed line holds its own kernel request, so lines can be freed
/// and reconfigured independently.
pub struct LibgpiodChip {
    path: PathBuf,
    line_count: u32,
    lines: RwLock<FxHashMap<u32, LineHandle>>, // keyed by line offset
}

impl LibgpiodChip {
    fn check_line(&self, line: u32) -> Result<(), GpioError> {
        if line < self.line_count {
            Ok(())
        } else {
            Err(GpioError::Gpio(format!(
                "line {line} out of range for {}",
                self.path.display()
            )))
        }
    }

    fn kernel_info(&self, line: u32) -> Result<line::Info, GpioError> {
        open_chip(&self.path)?
            .line_info(line)
            .map_err(|e| gpiod_err("line info", e))
    }

    fn claim(&self, line: u32, req: &LineRequest) -> Result<(), GpioError> {
        self.check_line(line)?;
        let line_cfg = make_line_config(line, req.settings()?)?;

        let mut lines = self.lines.write();
        match lines.get_mut(&line) {
            Some(handle) => {
                // stop the listener before the request changes under it
                handle.listener = None;
                handle
                    .request
                    .lock()
                    .reconfigure_lines(&line_cfg)
                    .map_err(|e| gpiod_err("reconfigure lines", e))?;
                handle.direction = req.direction;
                handle.pull = req.pull;
            }
            None => {
                let chip = open_chip(&self.path)?;
                let request = request_lines(&chip, &line_cfg)?;
                lines.insert(
                    line,
                    LineHandle {
                        direction: req.direction,
                        pull: req.pull,
                        request: Arc::new(FairMutex::new(request)),
                        listener: None,
                    },
                );
            }
        }
        Ok(())
    }
}

impl GpioChip for LibgpiodChip {
    fn line_count(&self) -> Result<u32, GpioError> {
        Ok(self.line_count)
    }

    fn line_info(&self, line: u32) -> Result<LineInfo, GpioError> {
        self.check_line(line)?;
        let info = self.kernel_info(line)?;
        let edge = info.edge_detection().ok().flatten().map(from_gpiod_edge);
        let kernel_direction = match info.direction() {
            Ok(line::Direction::Output) => Direction::Output,
            _ => Direction::Input,
        };

        let lines = self.lines.read();
        Ok(match lines.get(&line) {
            Some(handle) => LineInfo {
                owned: true,
                direction: handle.direction,
                pull: handle.pull,
                alert: edge.is_some(),
                edge,
            },
            None => LineInfo::unowned(kernel_direction),
        })
    }

    fn claim_input(&self, line: u32, pull: Pull) -> Result<(), GpioError> {
        self.claim(
            line,
            &LineRequest {
                direction: Direction::Input,
                pull,
                level: None,
                edge: None,
                debounce: None,
            },
        )
    }

    fn claim_output(&self, line: u32, level: bool) -> Result<(), GpioError> {
        self.claim(
            line,
            &LineRequest {
                direction: Direction::Output,
                pull: Pull::Off,
                level: Some(level),
                edge: None,
                debounce: None,
            },
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
        self.claim(
            line,
            &LineRequest {
                direction: Direction::Input,
                pull,
                level: None,
                edge: Some(edge),
                debounce,
            },
        )?;

        let mut lines = self.lines.write();
        let handle = lines
            .get_mut(&line)
            .ok_or_else(|| GpioError::NotClaimed(format!("line {line}")))?;
        handle.listener = Some(EdgeListener::new(line, handle.request.clone(), events)?);
        Ok(())
    }

    fn cancel_alert(&self, line: u32) -> Result<(), GpioError> {
        // take the listener out first so its join happens without the map lock
        let (listener, held, pull) = match self.lines.write().get_mut(&line) {
            Some(handle) => (
                handle.listener.take(),
                handle.request.clone(),
                handle.pull,
            ),
            None => return Ok(()),
        };
        drop(listener);

        let plain = LineRequest {
            direction: Direction::Input,
            pull,
            level: None,
            edge: None,
            debounce: None,
        };
        let line_cfg = make_line_config(line, plain.settings()?)?;
        let mut req = held.lock();
        req.reconfigure_lines(&line_cfg)
            .map_err(|e| gpiod_err("reconfigure lines", e))?;

        // edges queued while the watch was armed must not reach the next watch
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| gpiod_err("event buffer", e))?;
        while req
            .wait_edge_events(Some(Duration::ZERO))
            .map_err(|e| gpiod_err("wait edge events", e))?
        {
            req.read_edge_events(&mut buffer)
                .map_err(|e| gpiod_err("read edge events", e))?;
        }
        Ok(())
    }

    fn free(&self, line: u32) -> Result<(), GpioError> {
        let handle = self.lines.write().remove(&line);
        match handle {
            Some(handle) => {
                drop(handle);
                Ok(())
            }
            None => Err(GpioError::NotClaimed(format!("line {line} is not held"))),
        }
    }

    fn read(&self, line: u32) -> Result<bool, GpioError> {
        self.check_line(line)?;
        let value = match self.lines.read().get(&line) {
            Some(handle) => handle
                .request
                .lock()
                .value(line)
                .map_err(|e| gpiod_err("get value", e))?,
            None => {
                // sample an unheld line through a short-lived as-is request
                let settings =
                    line::Settings::new().map_err(|e| gpiod_err("libgpiod settings", e))?;
                let line_cfg = make_line_config(line, settings)?;
                let chip = open_chip(&self.path)?;
                request_lines(&chip, &line_cfg)?
                    .value(line)
                    .map_err(|e| gpiod_err("get value", e))?
            }
        };
        Ok(matches!(value, line::Value::Active))
    }

    fn write(&self, line: u32, level: bool) -> Result<(), GpioError> {
        let lines = self.lines.read();
        let handle = lines
            .get(&line)
            .filter(|h| h.direction == Direction::Output)
            .ok_or_else(|| {
                GpioError::NotOutput(format!("line {line} must be claimed as an output"))
            })?;

        handle
            .request
            .lock()
            .set_value(
                line,
                if level {
                    line::Value::Active
                } else {
                    line::Value::InActive
                },
            )
            .map_err(|e| gpiod_err("set value", e))?;
        Ok(())
    }
}
