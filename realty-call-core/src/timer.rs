//! Connected-call duration timer

use crate::types::{CallEvent, CallId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

const TICK: Duration = Duration::from_secs(1);

/// Counts whole seconds while a call is connected
///
/// Created when the session enters `Connected` and stopped on the way out.
/// The count starts at 0 and each tick publishes
/// [`CallEvent::DurationChanged`]. Once stopped the count never changes again.
#[derive(Debug)]
pub struct CallTimer {
    seconds: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl CallTimer {
    /// Start counting for `call_id`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(call_id: CallId, events: broadcast::Sender<CallEvent>) -> Self {
        let seconds = Arc::new(AtomicU64::new(0));
        let stopped = Arc::new(AtomicBool::new(false));

        let task = {
            let seconds = seconds.clone();
            let stopped = stopped.clone();
            tokio::spawn(async move {
                let mut ticks = interval_at(Instant::now() + TICK, TICK);
                loop {
                    ticks.tick().await;
                    if stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    let elapsed = seconds.fetch_add(1, Ordering::SeqCst) + 1;
                    let _ = events.send(CallEvent::DurationChanged {
                        call_id,
                        seconds: elapsed,
                    });
                }
            })
        };

        tracing::debug!(call_id = %call_id, "Call timer started");
        Self {
            seconds,
            stopped,
            task: Some(task),
        }
    }

    /// Seconds counted so far
    pub fn elapsed(&self) -> u64 {
        self.seconds.load(Ordering::SeqCst)
    }

    /// Whether the timer is still counting
    pub fn is_running(&self) -> bool {
        self.task.is_some() && !self.stopped.load(Ordering::SeqCst)
    }

    /// Stop counting and return the final value; later calls are no-ops
    pub fn stop(&mut self) -> u64 {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.elapsed()
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_counts_from_zero() {
        let (tx, mut rx) = broadcast::channel(16);
        let call_id = CallId::new();
        let timer = CallTimer::start(call_id, tx);
        assert_eq!(timer.elapsed(), 0);
        assert!(timer.is_running());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(timer.elapsed(), 3);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            CallEvent::DurationChanged { call_id: id, seconds: 1 } if id == call_id
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frozen_after_stop() {
        let (tx, _rx) = broadcast::channel(16);
        let mut timer = CallTimer::start(CallId::new(), tx);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(timer.stop(), 2);
        assert!(!timer.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(timer.elapsed(), 2);
        assert_eq!(timer.stop(), 2);
    }
}
