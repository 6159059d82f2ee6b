use std::collections::VecDeque;
use std::future;
use tokio::time::{self, Duration, Instant};

/// What a [`TimedCaller`] step signifies: another retransmission slot, or
/// the terminal firing after the final delay.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Step {
    Call,
    Last,
}

/// Drives a retransmission ladder: given delays `d1, .., dn` at
/// construction, awaiting [`step`](TimedCaller::step) yields [`Step::Call`]
/// after `d1`, after `d1 + d2`, and so on, and [`Step::Last`] after the sum
/// of all delays. With a single delay only `Last` fires; with none, nothing
/// ever does.
///
/// Firing times are absolute deadlines anchored at construction, so
/// `step()` is cancel-safe: a future dropped by `select!` and re-created
/// resumes waiting for the same deadline. Once cancelled or exhausted,
/// `step` pends forever, which makes it safe to keep in a `select!` arm.
/// Cancellation is an ordinary terminal state, not an error, and
/// cancelling again is a no-op.
pub struct TimedCaller {
    delays: VecDeque<Duration>,
    deadline: Option<Instant>,
    done: bool,
}

impl TimedCaller {
    pub fn new<I>(delays: I) -> TimedCaller
    where
        I: IntoIterator<Item = Duration>,
    {
        let mut delays: VecDeque<Duration> = delays.into_iter().collect();
        let deadline = delays.pop_front().map(|d| Instant::now() + d);
        TimedCaller {
            delays,
            done: deadline.is_none(),
            deadline,
        }
    }

    /// A caller that never fires; a session placeholder before anything is
    /// in flight.
    pub fn idle() -> TimedCaller {
        TimedCaller::new(Vec::new())
    }

    pub async fn step(&mut self) -> Step {
        let deadline = match self.deadline {
            Some(deadline) if !self.done => deadline,
            _ => return future::pending().await,
        };

        time::sleep_until(deadline).await;

        match self.delays.pop_front() {
            Some(next) => {
                self.deadline = Some(deadline + next);
                Step::Call
            }
            _ => {
                self.deadline = None;
                self.done = true;
                Step::Last
            }
        }
    }

    pub fn cancel(&mut self) {
        self.done = true;
        self.deadline = None;
        self.delays.clear();
    }

    pub fn is_active(&self) -> bool {
        !self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|&v| Duration::from_secs(v)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn steps_through_schedule() {
        let start = Instant::now();
        let mut caller = TimedCaller::new(secs(&[3, 5, 10]));

        assert_eq!(Step::Call, caller.step().await);
        assert_eq!(Duration::from_secs(3), start.elapsed());

        assert_eq!(Step::Call, caller.step().await);
        assert_eq!(Duration::from_secs(8), start.elapsed());

        assert_eq!(Step::Last, caller.step().await);
        assert_eq!(Duration::from_secs(18), start.elapsed());
        assert!(!caller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn single_delay_fires_last_only() {
        let mut caller = TimedCaller::new(secs(&[4]));
        assert_eq!(Step::Last, caller.step().await);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_step_keeps_its_deadline() {
        let start = Instant::now();
        let mut caller = TimedCaller::new(secs(&[10]));

        // a racing select! arm may drop the step future partway through
        let ret = timeout(Duration::from_secs(4), caller.step()).await;
        assert!(ret.is_err());

        assert_eq!(Step::Last, caller.step().await);
        assert_eq!(Duration::from_secs(10), start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_caller_never_fires_again() {
        let mut caller = TimedCaller::new(secs(&[1]));
        caller.step().await;

        let ret = timeout(Duration::from_secs(3600), caller.step()).await;
        assert!(ret.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_schedule_never_fires() {
        let mut caller = TimedCaller::new(secs(&[]));
        let ret = timeout(Duration::from_secs(3600), caller.step()).await;
        assert!(ret.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_terminal_and_idempotent() {
        let mut caller = TimedCaller::new(secs(&[3, 5]));
        caller.cancel();
        caller.cancel();
        assert!(!caller.is_active());

        let ret = timeout(Duration::from_secs(3600), caller.step()).await;
        assert!(ret.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_last_is_noop() {
        let mut caller = TimedCaller::new(secs(&[2]));
        assert_eq!(Step::Last, caller.step().await);
        caller.cancel();
        assert!(!caller.is_active());
    }
}
