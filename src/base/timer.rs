//! One-shot timers delivered as messages.
//!
//! A [`Timer`] never runs user code directly. When it expires it posts a
//! message built from its generation number onto an unbounded channel, so the
//! receiving loop handles the expiry in order with every other message. Re-arming
//! or cancelling bumps the generation, which turns any firing already in flight
//! into a stale one that [`Timer::fire`] rejects.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Default)]
pub struct Timer {
    generation: u64,
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("generation", &self.generation)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any pending expiry.
    pub fn arm<M, F>(&mut self, tx: &UnboundedSender<M>, delay: Duration, make_msg: F)
    where
        M: Send + 'static,
        F: FnOnce(u64) -> M + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        let deadline = Instant::now() + delay;
        let tx = tx.clone();
        self.deadline = Some(deadline);
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // Receiver gone means the loop has shut down.
            let _ = tx.send(make_msg(generation));
        }));
    }

    /// Arm only if the timer is idle or would otherwise expire later than `delay`.
    pub fn arm_if_earlier<M, F>(&mut self, tx: &UnboundedSender<M>, delay: Duration, make_msg: F)
    where
        M: Send + 'static,
        F: FnOnce(u64) -> M + Send + 'static,
    {
        if let Some(deadline) = self.deadline {
            if deadline <= Instant::now() + delay {
                return;
            }
        }
        self.arm(tx, delay, make_msg);
    }

    pub fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.deadline = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Accept an expiry message. Returns false for stale generations.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.deadline.is_none() || generation != self.generation {
            return false;
        }
        self.deadline = None;
        self.task = None;
        true
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new();
        timer.arm(&tx, Duration::from_millis(250), |g| g);
        assert!(timer.is_armed());

        let generation = rx.recv().await.unwrap();
        assert!(timer.fire(generation));
        assert!(!timer.is_armed());
        // Second delivery of the same expiry is ignored.
        assert!(!timer.fire(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_makes_firing_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new();
        timer.arm(&tx, Duration::from_secs(1), |g| g);
        let stale = timer.generation;
        timer.cancel();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        assert!(!timer.fire(stale));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_if_earlier_keeps_sooner_deadline() {
        let (tx, _rx) = mpsc::unbounded_channel::<u64>();
        let mut timer = Timer::new();
        timer.arm(&tx, Duration::from_secs(5), |g| g);
        let first = timer.deadline().unwrap();

        timer.arm_if_earlier(&tx, Duration::from_secs(30), |g| g);
        assert_eq!(timer.deadline(), Some(first));

        timer.arm_if_earlier(&tx, Duration::from_secs(1), |g| g);
        assert!(timer.deadline().unwrap() < first);
    }
}
