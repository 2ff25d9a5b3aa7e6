//! The local "new work" wake signal.

use tokio::sync::Notify;

/// One-shot wakeup between the enqueue path and the worker's idle sleep.
///
/// Enqueue pokes it after a successful insert so the worker polls
/// immediately instead of sleeping out its interval. One permit is buffered:
/// a signal sent while the worker is mid-poll is consumed by the next
/// `notified()` call, so no enqueue is lost to timing.
///
/// Together with the handler registry map this is the only shared
/// in-process mutable state in the crate; cross-worker coordination happens
/// exclusively through the store.
#[derive(Debug, Default)]
pub struct WorkSignal {
    notify: Notify,
}

impl WorkSignal {
    /// Create an unsignalled instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that new work exists.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Wait until new work is recorded (or return immediately if it already
    /// was).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notify_wakes_waiter() {
        let signal = Arc::new(WorkSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.notified().await })
        };

        signal.notify();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_permit_buffers_across_consumption_gap() {
        let signal = WorkSignal::new();
        // Signalled before anyone waits: the next wait returns immediately
        signal.notify();
        tokio::time::timeout(Duration::from_millis(100), signal.notified())
            .await
            .expect("buffered permit should satisfy the wait");
    }
}
