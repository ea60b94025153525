//! Cancellable repeating task.
//!
//! Wraps the spawn-a-loop-with-an-interval pattern used by the monitors and
//! the scheduler behind explicit `start`/`stop`. `stop` is idempotent and
//! safe to call before `start`; a tick body already in flight runs to
//! completion, since stopping only prevents future ticks.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct RepeatingTask {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl RepeatingTask {
    pub fn new(name: &'static str) -> Self {
        RepeatingTask {
            name,
            running: Mutex::new(None),
        }
    }

    /// Begin ticking every `period`. The first tick fires immediately.
    ///
    /// Calling `start` while already running is logged and ignored.
    pub fn start<F, Fut>(&self, period: Duration, mut body: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut guard = match self.running.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        if guard.is_some() {
            tracing::warn!(task = self.name, "start called while already running");
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let name = self.name;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => body().await,
                    _ = stop_rx.changed() => {
                        tracing::debug!(task = name, "repeating task stopped");
                        break;
                    }
                }
            }
        });
        *guard = Some(Running { stop_tx, handle });
    }

    /// Stop ticking. Idempotent; a no-op when never started.
    pub fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut g) => g.take(),
            Err(_) => None,
        };
        if let Some(running) = running {
            // An in-flight tick body finishes; only the next select sees this.
            let _ = running.stop_tx.send(true);
            drop(running.handle);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().map(|g| g.is_some()).unwrap_or(false)
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.stop();
    }
}
