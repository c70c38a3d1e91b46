use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// What the watchdog does when it was not kicked in time.
#[derive(Clone)]
pub enum StallAction {
    /// Log the stall and abort the process.
    Abort,
    /// Log the stall and keep watching.
    Log,
    /// Invoke the callback with the time since the last kick and keep watching.
    Notify(Arc<dyn Fn(Duration) + Send + Sync>),
}

impl fmt::Debug for StallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StallAction::Abort => f.write_str("Abort"),
            StallAction::Log => f.write_str("Log"),
            StallAction::Notify(_) => f.write_str("Notify(..)"),
        }
    }
}

/// Liveness monitor running on its own thread.
///
/// The owner must call [`Watchdog::kick`] at least once per `timeout`; otherwise the owner's
/// thread is considered hung and the configured [`StallAction`] runs. Dropping the watchdog stops
/// it.
pub struct Watchdog {
    kicks: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(name: &str, timeout: Duration, action: StallAction) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let watched = name.to_owned();
        let thread = std::thread::Builder::new()
            .name(format!("{name}-watchdog"))
            .spawn(move || watch(&watched, timeout, action, rx))?;
        Ok(Self {
            kicks: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn kick(&self) {
        if let Some(kicks) = &self.kicks {
            let _ = kicks.send(());
        }
    }
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog").finish_non_exhaustive()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread up immediately.
        self.kicks.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn watch(name: &str, timeout: Duration, action: StallAction, kicks: mpsc::Receiver<()>) {
    let mut last_kick = Instant::now();
    loop {
        match kicks.recv_timeout(timeout) {
            Ok(()) => last_kick = Instant::now(),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let stalled_for = last_kick.elapsed();
                tracing::error!(
                    target: "botgate.watchdog",
                    watched = name,
                    stalled_ms = stalled_for.as_millis() as u64,
                    "watchdog timeout expired"
                );
                match &action {
                    StallAction::Abort => std::process::abort(),
                    StallAction::Log => {}
                    StallAction::Notify(callback) => callback(stalled_for),
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}
