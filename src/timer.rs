use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::command::Command;

/// Runs `tick` every `period` until `cancel` fires. Ticks that would pile up
/// behind a slow one are skipped.
pub fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancelToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Ticker {} stopped", name);
                    break;
                }
                _ = interval.tick() => tick().await,
            }
        }
    })
}

/// Single-shot timer that posts `Command::InactivityExpired` after a quiet
/// period. Re-arming replaces the pending timer.
#[derive(Debug)]
pub struct InactivityTimer {
    commands: mpsc::Sender<Command>,
    timeout: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
}

impl InactivityTimer {
    pub fn new(commands: mpsc::Sender<Command>, timeout: Duration) -> Self {
        Self {
            commands,
            timeout,
            handle: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn start(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let commands = self.commands.clone();
        let timeout = self.timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = commands.send(Command::InactivityExpired(generation)).await;
        });

        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = handle.replace(task) {
            previous.abort();
        }
        debug!("[PATROL] Inactivity timer armed ({:?})", timeout);
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = handle.take() {
            previous.abort();
        }
    }

    /// True when an expiry carrying `generation` comes from the latest arm.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub fn is_active(&self) -> bool {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        handle.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.clear();
    }
}
