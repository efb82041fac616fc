//! Resettable one-shot timer built from a spawned sleeper task, a
//! `tokio::sync::watch` deadline channel, and a `Notify`. A single instance
//! drives both timeout regimes of a peer: the randomized election timeout
//! and the fixed heartbeat interval.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::time::{self, Duration, Instant};

/// A one-shot timer that can be re-armed from any task.
///
/// `arm` schedules (or reschedules) the deadline; the pending deadline is
/// replaced whether the new one is earlier or later. Firing is observed by
/// awaiting `fired`, typically from a dedicated loop. After a fire the timer
/// stays quiet until armed again.
#[derive(Debug)]
pub struct ResettableTimer {
    deadline_tx: watch::Sender<Option<Instant>>,
    notify: Arc<Notify>,
}

impl ResettableTimer {
    /// Create the timer and spawn its sleeper task. Must be called within a
    /// tokio runtime.
    pub fn new() -> Self {
        let (deadline_tx, mut deadline_rx) = watch::channel(None);
        let notify = Arc::new(Notify::new());
        let fire = Arc::clone(&notify);

        tokio::spawn(async move {
            let sleep = time::sleep(Duration::ZERO);
            tokio::pin!(sleep);
            loop {
                let deadline = *deadline_rx.borrow_and_update();
                match deadline {
                    Some(at) => {
                        sleep.as_mut().reset(at);
                        tokio::select! {
                            () = sleep.as_mut() => {
                                fire.notify_one();
                                // Quiet until the next arm.
                                if deadline_rx.changed().await.is_err() {
                                    return;
                                }
                            }
                            changed = deadline_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    // Disarmed: wait for an arm.
                    None => {
                        if deadline_rx.changed().await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        ResettableTimer {
            deadline_tx,
            notify,
        }
    }

    /// Arm (or re-arm) the timer to fire `dur` from now.
    pub fn arm(&self, dur: Duration) {
        // Send fails only if the sleeper task is gone, i.e. runtime teardown.
        let _ = self.deadline_tx.send(Some(Instant::now() + dur));
    }

    /// Disarm the timer. A notification already emitted may still be
    /// observed by a pending `fired` call; callers re-check their own state
    /// after waking.
    pub fn cancel(&self) {
        let _ = self.deadline_tx.send(None);
    }

    /// Wait for the next firing.
    pub async fn fired(&self) {
        self.notify.notified().await;
    }
}

impl Default for ResettableTimer {
    fn default() -> Self {
        Self::new()
    }
}
