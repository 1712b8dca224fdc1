//! Timer registry
//!
//! Tracks timers announced by the server, runs one countdown task per
//! active timer, and emits timer lifecycle events to the fan-out. All
//! state is confined to the registry actor; countdown arithmetic uses
//! the monotonic clock only.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::events::{FanoutHandle, LifecycleEvent};
use crate::protocol::TimerInfo;

/// Commands accepted by the registry, idempotent by timer id
#[derive(Debug)]
pub enum TimerCommand {
    Started(TimerInfo),
    Updated(TimerInfo),
    Cancelled { id: String },
    /// Server-announced finish; the local countdown may have fired first
    Finished { id: String },
}

/// Sender half of the timer registry
#[derive(Debug, Clone)]
pub struct TimerHandle {
    tx: mpsc::Sender<TimerCommand>,
}

impl TimerHandle {
    /// Submit a server timer event
    pub async fn send(&self, command: TimerCommand) {
        if self.tx.send(command).await.is_err() {
            tracing::debug!("timer registry gone, command discarded");
        }
    }
}

/// Build a [`TimerHandle`] over a bare channel, for tests that observe
/// registry commands directly
#[cfg(test)]
pub(crate) fn test_timer_handle(tx: mpsc::Sender<TimerCommand>) -> TimerHandle {
    TimerHandle { tx }
}

/// Spawn the timer registry actor
pub fn spawn_timers(fanout: FanoutHandle, shutdown: watch::Receiver<bool>) -> TimerHandle {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(timer_loop(fanout, rx, shutdown));
    TimerHandle { tx }
}

struct ActiveTimer {
    info: TimerInfo,
    /// Monotonic reference for the remaining projection
    anchored: Instant,
    /// Remaining at `anchored`; stored verbatim while paused
    remaining: Duration,
    /// Invalidates countdown fires scheduled before the last change
    generation: u64,
}

impl ActiveTimer {
    fn projected_remaining(&self, now: Instant) -> Duration {
        if self.info.is_paused {
            self.remaining
        } else {
            self.remaining
                .saturating_sub(now.saturating_duration_since(self.anchored))
        }
    }
}

enum Input {
    Command(TimerCommand),
    Fire { id: String, generation: u64 },
}

async fn timer_loop(
    fanout: FanoutHandle,
    mut rx: mpsc::Receiver<TimerCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timers: HashMap<String, ActiveTimer> = HashMap::new();
    let (fire_tx, mut fire_rx) = mpsc::channel::<Input>(16);
    let mut generation: u64 = 0;

    loop {
        let input = tokio::select! {
            () = shutdown_flip(&mut shutdown) => break,
            command = rx.recv() => match command {
                Some(command) => Input::Command(command),
                None => break,
            },
            fire = fire_rx.recv() => match fire {
                Some(fire) => fire,
                None => break,
            },
        };

        match input {
            Input::Command(TimerCommand::Started(info)) => {
                generation += 1;
                let remaining = Duration::from_secs(info.remaining());
                if timers.insert(
                    info.id.clone(),
                    ActiveTimer {
                        info: info.clone(),
                        anchored: Instant::now(),
                        remaining,
                        generation,
                    },
                )
                .is_some()
                {
                    tracing::debug!(id = %info.id, "timer replaced");
                }

                if !info.is_paused {
                    schedule_fire(&fire_tx, info.id.clone(), generation, remaining);
                }
                tracing::info!(id = %info.id, seconds = info.remaining(), "timer started");
                fanout.emit(LifecycleEvent::TimerStarted(info)).await;
            }

            Input::Command(TimerCommand::Updated(info)) => {
                let Some(timer) = timers.get_mut(&info.id) else {
                    tracing::debug!(id = %info.id, "update for unknown timer");
                    continue;
                };

                generation += 1;
                timer.generation = generation;
                timer.remaining = Duration::from_secs(info.remaining());
                timer.anchored = Instant::now();

                let was_paused = timer.info.is_paused;
                timer.info = info.clone();

                if info.is_paused {
                    if !was_paused {
                        tracing::info!(
                            id = %info.id,
                            remaining = ?timer.projected_remaining(Instant::now()),
                            "timer paused"
                        );
                    }
                    // No countdown while paused; the bumped generation
                    // cancels the old one
                } else {
                    schedule_fire(&fire_tx, info.id.clone(), generation, timer.remaining);
                    tracing::info!(
                        id = %info.id,
                        seconds = info.remaining(),
                        "timer rescheduled"
                    );
                }
                fanout.emit(LifecycleEvent::TimerUpdated(info)).await;
            }

            Input::Command(TimerCommand::Cancelled { id }) => {
                if timers.remove(&id).is_some() {
                    tracing::info!(id = %id, "timer cancelled");
                    fanout.emit(LifecycleEvent::TimerCancelled { id }).await;
                } else {
                    tracing::debug!(id = %id, "cancel for unknown timer");
                }
            }

            Input::Command(TimerCommand::Finished { id }) => {
                if timers.remove(&id).is_some() {
                    tracing::info!(id = %id, "timer finished (server)");
                    fanout.emit(LifecycleEvent::TimerFinished { id }).await;
                } else {
                    // Local countdown already fired; nothing to do
                    tracing::debug!(id = %id, "finish for unknown timer");
                }
            }

            Input::Fire { id, generation } => {
                let current = timers.get(&id);
                let live = current.is_some_and(|t| t.generation == generation);
                if !live {
                    continue;
                }
                timers.remove(&id);
                tracing::info!(id = %id, "timer finished");
                fanout.emit(LifecycleEvent::TimerFinished { id }).await;
            }
        }
    }

    tracing::debug!(active = timers.len(), "timer registry stopped");
}

/// One countdown task per scheduled fire; the registry discards stale
/// generations on receipt
fn schedule_fire(
    fire_tx: &mpsc::Sender<Input>,
    id: String,
    generation: u64,
    remaining: Duration,
) {
    let fire_tx = fire_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(remaining).await;
        let _ = fire_tx.send(Input::Fire { id, generation }).await;
    });
}

async fn shutdown_flip(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
