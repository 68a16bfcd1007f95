//! One-shot per-flow timers.
//!
//! A [`DtpTimer`] wraps a spawned task that sleeps until a deadline and then
//! runs its handler body. Re-arming aborts the previous task and spawns a
//! fresh one; a handler that is already running disarms its own timer with
//! [`mark_fired`](DtpTimer::mark_fired) instead, which must never abort
//! because the handler executes on the armed task itself.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

pub(crate) struct DtpTimer {
    handle: Option<JoinHandle<()>>,
    deadline: Option<Instant>,
}

impl DtpTimer {
    pub fn new() -> DtpTimer {
        DtpTimer {
            handle: None,
            deadline: None,
        }
    }

    /// Schedules `body` to run at `deadline`, replacing any pending arming.
    pub fn rearm(&mut self, deadline: Instant, body: impl Future<Output = ()> + Send + 'static) {
        self.cancel();
        self.deadline = Some(deadline);
        self.handle = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            body.await;
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.deadline = None;
    }

    /// Disarms without aborting; called by the handler once it runs.
    pub fn mark_fired(&mut self) {
        self.handle = None;
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    #[cfg(test)]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Drop for DtpTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn counting_body(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_deadline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut timer = DtpTimer::new();
        timer.rearm(
            Instant::now() + Duration::from_millis(100),
            counting_body(&counter),
        );
        assert!(timer.is_armed());

        sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut timer = DtpTimer::new();
        timer.rearm(
            Instant::now() + Duration::from_millis(100),
            counting_body(&counter),
        );
        timer.cancel();
        assert!(!timer.is_armed());

        sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_arming() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut timer = DtpTimer::new();
        timer.rearm(
            Instant::now() + Duration::from_millis(100),
            counting_body(&counter),
        );
        let later = Instant::now() + Duration::from_millis(300);
        timer.rearm(later, counting_body(&counter));
        assert_eq!(timer.deadline(), Some(later));

        sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
