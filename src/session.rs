use std::time::Duration;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::debug;

use crate::types::SessionState;

/// Cancellable auto-stop timer
///
/// Each arm bumps a generation counter that is delivered on expiry, so a
/// firing that raced with a cancel can be told apart from the live one.
#[derive(Debug, Default)]
pub struct AutoStopTimer {
    task: Option<JoinHandle<()>>,
    deadline: Option<Instant>,
    generation: u64,
}

impl AutoStopTimer {
    /// Create a disarmed timer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any running countdown, then start a new one
    pub fn arm(&mut self, duration: Duration, fired: mpsc::UnboundedSender<u64>) {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        self.deadline = Some(Instant::now() + duration);
        self.task = Some(tokio::spawn(async move {
            sleep(duration).await;
            let _ = fired.send(generation);
        }));
        debug!("Auto-stop armed for {duration:?} (generation {generation})");
    }

    /// Stop the countdown, returning the time that was left
    pub fn cancel(&mut self) -> Option<Duration> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.deadline
            .take()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether a countdown is running
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left on the running countdown
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Accept a firing if it belongs to the live countdown
    pub fn take_fired(&mut self, generation: u64) -> bool {
        if self.is_armed() && generation == self.generation {
            self.task = None;
            self.deadline = None;
            true
        } else {
            debug!("Ignoring stale auto-stop firing (generation {generation})");
            false
        }
    }
}

impl Drop for AutoStopTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Session bookkeeping: state, target, elapsed time and auto-stop
///
/// Only commits transitions; protocol writes are issued by the caller
/// before committing.
#[derive(Debug, Default)]
pub struct Session {
    state: SessionState,
    target_watts: u16,
    elapsed: Duration,
    running_since: Option<Instant>,
    remaining: Option<Duration>,
    timer: AutoStopTimer,
}

impl Session {
    /// Create an idle session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Last accepted target
    #[must_use]
    pub const fn target_watts(&self) -> u16 {
        self.target_watts
    }

    /// Record an accepted target
    pub fn set_target(&mut self, watts: u16) {
        self.target_watts = watts;
    }

    /// Running time, excluding pauses
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed + self.running_since.map_or(Duration::ZERO, |since| since.elapsed())
    }

    /// Remaining auto-stop time, live while running, frozen while paused
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.timer.remaining().or(self.remaining)
    }

    /// Enter running from any state, arming auto-stop when `duration` is set
    pub fn begin(&mut self, duration: Option<Duration>, fired: &mpsc::UnboundedSender<u64>) {
        self.timer.cancel();
        self.elapsed = Duration::ZERO;
        self.running_since = Some(Instant::now());
        self.remaining = None;
        if let Some(duration) = duration {
            self.timer.arm(duration, fired.clone());
        }
        self.state = SessionState::Running;
    }

    /// Running → paused, freezing the auto-stop clock
    ///
    /// Returns `false` without changes unless running.
    pub fn pause(&mut self) -> bool {
        if self.state != SessionState::Running {
            return false;
        }
        self.remaining = self.timer.cancel();
        self.bank_elapsed();
        self.state = SessionState::Paused;
        true
    }

    /// Paused → running, rearming auto-stop with the frozen remainder
    ///
    /// Returns `false` without changes unless paused.
    pub fn resume(&mut self, fired: &mpsc::UnboundedSender<u64>) -> bool {
        if self.state != SessionState::Paused {
            return false;
        }
        if let Some(remaining) = self.remaining.take() {
            self.timer.arm(remaining, fired.clone());
        }
        self.running_since = Some(Instant::now());
        self.state = SessionState::Running;
        true
    }

    /// Running or paused → stopped
    ///
    /// Returns `false` without changes from idle or stopped.
    pub fn stop(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.timer.cancel();
        self.remaining = None;
        self.bank_elapsed();
        self.state = SessionState::Stopped;
        true
    }

    /// Drop to idle after the link is gone
    pub fn reset(&mut self) {
        self.timer.cancel();
        self.remaining = None;
        self.bank_elapsed();
        self.state = SessionState::Idle;
    }

    /// Accept an auto-stop firing for the live countdown
    pub fn take_fired(&mut self, generation: u64) -> bool {
        self.state == SessionState::Running && self.timer.take_fired(generation)
    }

    /// Running or paused
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Running | SessionState::Paused)
    }

    fn bank_elapsed(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.elapsed += since.elapsed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timer_fires_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = AutoStopTimer::new();
        timer.arm(Duration::from_millis(20), tx);

        let generation = rx.recv().await.unwrap();
        assert!(timer.take_fired(generation));
        assert!(!timer.is_armed());
    }

    #[tokio::test]
    async fn test_rearm_supersedes_previous_countdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = AutoStopTimer::new();
        timer.arm(Duration::from_millis(10), tx.clone());
        timer.arm(Duration::from_millis(30), tx);

        let generation = rx.recv().await.unwrap();
        assert_eq!(generation, 2);
        assert!(timer.take_fired(generation));
        assert!(!timer.take_fired(1));
    }

    #[tokio::test]
    async fn test_cancel_reports_remaining() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = AutoStopTimer::new();
        timer.arm(Duration::from_secs(60), tx);

        let remaining = timer.cancel().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
        assert!(timer.cancel().is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pause_freezes_and_resume_rearms() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new();
        session.begin(Some(Duration::from_secs(30)), &tx);
        assert_eq!(session.state(), SessionState::Running);

        assert!(session.pause());
        assert!(!session.pause());
        let frozen = session.remaining().unwrap();
        assert!(frozen > Duration::from_secs(29));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.remaining(), Some(frozen));

        assert!(session.resume(&tx));
        assert!(!session.resume(&tx));
        assert_eq!(session.state(), SessionState::Running);
        assert!(session.remaining().unwrap() <= frozen);
    }

    #[tokio::test]
    async fn test_stop_clears_remaining() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new();
        assert!(!session.stop());

        session.begin(Some(Duration::from_secs(5)), &tx);
        assert!(session.pause());
        assert!(session.stop());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.remaining().is_none());
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new();
        session.begin(Some(Duration::from_secs(5)), &tx);
        session.reset();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.remaining().is_none());
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_elapsed_excludes_pauses() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new();
        session.begin(None, &tx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        session.pause();
        let banked = session.elapsed();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(session.elapsed(), banked);
        assert!(banked >= Duration::from_millis(30));
    }
}
