//! Transfer lifecycle notifications.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

/// Minimum spacing between progress notifications.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 64;

/// A lifecycle notification emitted by a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// A downloader started pulling bytes.
    Start,
    /// Bytes delivered so far, and the total when known.
    Progress { downloaded: u64, total: Option<u64> },
    /// The peer dropped mid-transfer; the transfer can be resumed.
    Disconnect,
    /// The transfer was canceled or can no longer complete.
    Cancel,
    /// Every byte was delivered.
    Complete,
}

impl TransferEvent {
    /// Complete and Cancel end a transfer.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancel)
    }
}

type TerminalHook = Box<dyn FnOnce(TransferEvent) + Send>;

/// Fan-out channel for [`TransferEvent`]s.
///
/// Only the first terminal event is delivered; anything emitted after it
/// is dropped.
pub struct EventBus {
    tx: broadcast::Sender<TransferEvent>,
    finished: AtomicBool,
    state: Mutex<BusState>,
}

#[derive(Default)]
struct BusState {
    terminal: Option<TransferEvent>,
    hooks: Vec<TerminalHook>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tx,
            finished: AtomicBool::new(false),
            state: Mutex::new(BusState::default()),
        }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    /// Registers a hook that runs once, on the first terminal event.
    ///
    /// Runs immediately if the transfer already finished.
    pub fn on_terminal(&self, hook: impl FnOnce(TransferEvent) + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        match state.terminal {
            Some(event) => {
                drop(state);
                hook(event);
            }
            None => state.hooks.push(Box::new(hook)),
        }
    }

    /// Returns `true` once Complete or Cancel was emitted.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Emits an event to all subscribers.
    pub fn emit(&self, event: TransferEvent) {
        if event.is_terminal() {
            let hooks = {
                let mut state = self.state.lock().unwrap();
                if state.terminal.is_some() {
                    return;
                }
                state.terminal = Some(event);
                self.finished.store(true, Ordering::SeqCst);
                std::mem::take(&mut state.hooks)
            };
            tracing::debug!(?event, "transfer finished");
            // No subscribers is fine.
            let _ = self.tx.send(event);
            for hook in hooks {
                hook(event);
            }
        } else if !self.is_finished() {
            let _ = self.tx.send(event);
        }
    }
}

/// Rate limits progress notifications to one per [`PROGRESS_INTERVAL`].
#[derive(Debug)]
pub struct ProgressThrottle {
    last: Mutex<Instant>,
    interval: Duration,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(PROGRESS_INTERVAL)
    }
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            interval,
        }
    }

    /// Emits `Progress` on `bus` if the interval elapsed since the last one.
    pub fn tick(&self, bus: &EventBus, downloaded: u64, total: Option<u64>) {
        {
            let mut last = self.last.lock().unwrap();
            if last.elapsed() < self.interval {
                return;
            }
            *last = Instant::now();
        }
        bus.emit(TransferEvent::Progress { downloaded, total });
    }
}
