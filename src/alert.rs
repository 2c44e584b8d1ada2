use log::{debug, error, warn};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc};

use crate::error::GpioError;
use crate::gpio::{Edge, EdgeEvent, EventSender, GpioChip, retry_busy};
use crate::line::LineController;
use crate::mapper::ChannelMapper;

/// Historical "no debounce" value still sent by older callers.
pub const DEBOUNCE_UNSET_SENTINEL: i64 = -666;

/// Invoked with the channel an edge was seen on.
pub type EdgeCallback = Arc<dyn Fn(i64) + Send + Sync>;

struct Alert {
    edge: Edge,
    debounce: Option<Duration>,
    callbacks: Vec<(u64, EdgeCallback)>,
    detected: bool,
}

type AlertMap = Arc<Mutex<FxHashMap<u32, Alert>>>;

pub fn normalize_debounce(debounce_ms: Option<i64>) -> Result<Option<Duration>, GpioError> {
    match debounce_ms {
        None | Some(DEBOUNCE_UNSET_SENTINEL) => Ok(None),
        Some(ms) if ms <= 0 => Err(GpioError::InvalidArgument(
            "debounce must be greater than 0".into(),
        )),
        Some(ms) => Ok(Some(Duration::from_millis(ms.unsigned_abs()))),
    }
}

pub fn validate_timeout(timeout_ms: Option<i64>) -> Result<Option<Duration>, GpioError> {
    match timeout_ms {
        None => Ok(None),
        Some(ms) if ms <= 0 => Err(GpioError::InvalidArgument(
            "timeout must be greater than 0".into(),
        )),
        Some(ms) => Ok(Some(Duration::from_millis(ms.unsigned_abs()))),
    }
}

/// At most one edge watch per line, shared by every waiter and callback on it.
pub struct AlertRegistry<C: GpioChip> {
    lines: Arc<LineController<C>>,
    alerts: AlertMap,
    events: EventSender,
    broadcast: broadcast::Sender<EdgeEvent>,
    next_id: AtomicU64,
}

impl<C: GpioChip> AlertRegistry<C> {
    pub fn new(
        lines: Arc<LineController<C>>,
        mapper: Arc<ChannelMapper>,
        broadcast_capacity: usize,
    ) -> Result<Self, GpioError> {
        let (events, rx) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(broadcast_capacity.max(1));
        let alerts: AlertMap = Arc::new(Mutex::new(FxHashMap::default()));

        let dispatcher = Dispatcher {
            alerts: alerts.clone(),
            mapper,
            broadcast: broadcast.clone(),
        };
        // exits once every sender (ours and the listeners') is gone
        thread::Builder::new()
            .name("edge-dispatch".into())
            .spawn(move || dispatcher.run(rx))
            .map_err(|e| GpioError::Gpio(format!("spawn edge dispatcher: {e}")))?;

        Ok(Self {
            lines,
            alerts,
            events,
            broadcast,
            next_id: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.broadcast.subscribe()
    }

    pub fn is_watched(&self, line: u32) -> bool {
        self.alerts.lock().contains_key(&line)
    }

    /// Edge of the active watch, preferring what the kernel reports.
    pub fn edge(&self, line: u32) -> Option<Edge> {
        let requested = self.alerts.lock().get(&line).map(|a| a.edge)?;
        Some(self.live_edge(line).unwrap_or(requested))
    }

    fn live_edge(&self, line: u32) -> Option<Edge> {
        self.lines.info(line).ok().and_then(|info| info.edge)
    }

    fn require_input(&self, line: u32) -> Result<(), GpioError> {
        if self.lines.info(line)?.is_input() {
            Ok(())
        } else {
            Err(GpioError::NotInput(format!(
                "line {line} must be set up as an input first"
            )))
        }
    }

    /// Watches `line` for `edge`, reusing a compatible existing watch.
    /// Returns true if this call created the watch.
    pub fn ensure_watch(
        &self,
        line: u32,
        edge: Edge,
        debounce: Option<Duration>,
    ) -> Result<bool, GpioError> {
        let mut alerts = self.alerts.lock();
        self.ensure_watch_locked(&mut alerts, line, edge, debounce)
    }

    fn ensure_watch_locked(
        &self,
        alerts: &mut FxHashMap<u32, Alert>,
        line: u32,
        edge: Edge,
        debounce: Option<Duration>,
    ) -> Result<bool, GpioError> {
        let info = self.lines.info(line)?;
        if !info.is_input() {
            return Err(GpioError::NotInput(format!(
                "line {line} must be set up as an input first"
            )));
        }

        if let Some(alert) = alerts.get(&line) {
            let active_edge = info.edge.unwrap_or(alert.edge);
            if active_edge != edge || alert.debounce != debounce {
                return Err(GpioError::ConflictingWatch(format!(
                    "edge detection with other settings is already enabled for line {line}"
                )));
            }
            return Ok(false);
        }

        let chip = self.lines.chip()?;
        retry_busy(|| chip.claim_alert(line, edge, info.pull, debounce, self.events.clone()))?;
        alerts.insert(
            line,
            Alert {
                edge,
                debounce,
                callbacks: Vec::new(),
                detected: false,
            },
        );
        debug!("watching line {line} for {edge:?} edges, debounce {debounce:?}");
        Ok(true)
    }

    /// Blocks until `edge` is seen on `line` or `timeout` elapses. Returns
    /// `channel` when the edge fired and `None` on timeout.
    pub fn wait(
        &self,
        line: u32,
        channel: i64,
        edge: Edge,
        debounce: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<Option<i64>, GpioError> {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));

        let (created, id) = {
            let mut alerts = self.alerts.lock();
            let created = self.ensure_watch_locked(&mut alerts, line, edge, debounce)?;
            let alert = alerts
                .get_mut(&line)
                .ok_or_else(|| GpioError::NoActiveWatch(format!("line {line}")))?;
            if !created && !alert.callbacks.is_empty() {
                return Err(GpioError::ConflictingWatch(format!(
                    "callbacks are already registered for line {line}"
                )));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let waker = signal.clone();
            let wake: EdgeCallback = Arc::new(move |_channel: i64| {
                let (fired, cond) = &*waker;
                *fired.lock() = true;
                cond.notify_all();
            });
            alert.callbacks.push((id, wake));
            (created, id)
        };

        let fired = {
            let (fired, cond) = &*signal;
            let mut fired = fired.lock();
            match timeout {
                Some(timeout) => {
                    cond.wait_while_for(&mut fired, |f| !*f, timeout);
                }
                None => cond.wait_while(&mut fired, |f| !*f),
            }
            *fired
        };

        if created {
            self.remove(line);
        } else if let Some(alert) = self.alerts.lock().get_mut(&line) {
            alert.callbacks.retain(|(cb_id, _)| *cb_id != id);
        }

        Ok(fired.then_some(channel))
    }

    pub fn add_detect(
        &self,
        line: u32,
        edge: Edge,
        debounce: Option<Duration>,
        callback: Option<EdgeCallback>,
    ) -> Result<(), GpioError> {
        let mut alerts = self.alerts.lock();
        self.ensure_watch_locked(&mut alerts, line, edge, debounce)?;
        if let Some(callback) = callback
            && let Some(alert) = alerts.get_mut(&line)
        {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            alert.callbacks.push((id, callback));
        }
        Ok(())
    }

    pub fn add_callback(&self, line: u32, callback: EdgeCallback) -> Result<(), GpioError> {
        self.require_input(line)?;
        let mut alerts = self.alerts.lock();
        let alert = alerts.get_mut(&line).ok_or_else(|| {
            GpioError::NoActiveWatch(format!(
                "add edge detection on line {line} before adding a callback"
            ))
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        alert.callbacks.push((id, callback));
        Ok(())
    }

    /// Cancels the watch on `line`. No-op when unwatched.
    pub fn remove(&self, line: u32) {
        if self.alerts.lock().remove(&line).is_none() {
            return;
        }
        if let Ok(chip) = self.lines.chip()
            && let Err(e) = chip.cancel_alert(line)
        {
            debug!("cancel alert on line {line}: {e}");
        }
        debug!("stopped watching line {line}");
    }

    pub fn remove_all(&self) {
        let lines: Vec<u32> = self.alerts.lock().keys().copied().collect();
        for line in lines {
            self.remove(line);
        }
    }

    /// Returns and clears the detected flag.
    pub fn poll_detected(&self, line: u32) -> bool {
        self.alerts
            .lock()
            .get_mut(&line)
            .map(|alert| std::mem::take(&mut alert.detected))
            .unwrap_or(false)
    }
}

struct Dispatcher {
    alerts: AlertMap,
    mapper: Arc<ChannelMapper>,
    broadcast: broadcast::Sender<EdgeEvent>,
}

impl Dispatcher {
    fn run(self, mut rx: mpsc::UnboundedReceiver<EdgeEvent>) {
        while let Some(event) = rx.blocking_recv() {
            self.dispatch(event);
        }
        debug!("edge dispatcher stopped");
    }

    fn dispatch(&self, event: EdgeEvent) {
        let callbacks: Vec<EdgeCallback> = {
            let mut alerts = self.alerts.lock();
            let Some(alert) = alerts.get_mut(&event.line) else {
                return;
            };
            alert.detected = true;
            alert.callbacks.iter().map(|(_, cb)| cb.clone()).collect()
        };

        match self.mapper.from_line(event.line) {
            Ok(channel) => {
                for callback in callbacks {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(channel))) {
                        error!(
                            "edge callback for channel {channel} panicked: {}",
                            panic_message(panic.as_ref())
                        );
                    }
                }
            }
            Err(e) => warn!("dropping edge on line {}: {e}", event.line),
        }

        let _ = self.broadcast.send(event);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
