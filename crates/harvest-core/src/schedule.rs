//! Per-collector task scheduler.
//!
//! Tasks (`counter`, `instance`, `data`) run cooperatively in one loop.
//! After a run the next due time becomes `max(now, previous_due + interval)`
//! so a long run triggers at most one immediate catch-up instead of a burst.
//!
//! Standby pins one task to a temporary interval and suspends all others
//! until [`Schedule::recover`] restores the original intervals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::errors::{HarvestError, Result};

/// Granularity of the interruptible sleep.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    interval: Duration,
    original: Duration,
    next_due: Instant,
    started: Option<Instant>,
    last_duration: Duration,
}

impl Task {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Interval from the template, restored by `recover()`.
    pub fn original_interval(&self) -> Duration {
        self.original
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn last_duration(&self) -> Duration {
        self.last_duration
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }
}

/// Outcome of a completed task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub duration: Duration,
    /// The run took longer than the task interval.
    pub overrun: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Schedule {
    tasks: Vec<Task>,
    standby: Option<usize>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task. With `run_now` it is due immediately, otherwise
    /// after one interval.
    pub fn new_task(&mut self, name: &str, interval: Duration, run_now: bool) -> Result<()> {
        self.new_task_at(name, interval, run_now, Instant::now())
    }

    pub fn new_task_at(
        &mut self,
        name: &str,
        interval: Duration,
        run_now: bool,
        now: Instant,
    ) -> Result<()> {
        if self.position(name).is_some() {
            return Err(HarvestError::Duplicate(format!("task [{}]", name)));
        }
        if interval.is_zero() {
            return Err(HarvestError::InvalidParam(format!(
                "task [{}] interval must be positive",
                name
            )));
        }
        self.tasks.push(Task {
            name: name.to_string(),
            interval,
            original: interval,
            next_due: if run_now { now } else { now + interval },
            started: None,
            last_duration: Duration::ZERO,
        });
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.name == name)
    }

    fn task_mut(&mut self, name: &str) -> Result<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| HarvestError::InvalidParam(format!("unknown task [{}]", name)))
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Active tasks in registration order; in standby only the pinned task.
    pub fn tasks(&self) -> Vec<&Task> {
        match self.standby {
            Some(i) => vec![&self.tasks[i]],
            None => self.tasks.iter().collect(),
        }
    }

    /// All registered tasks regardless of standby.
    pub fn all_tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Names of active tasks due at `now`, earliest first.
    pub fn due_tasks(&self, now: Instant) -> Vec<String> {
        let mut due: Vec<&Task> = self.tasks().into_iter().filter(|t| t.is_due(now)).collect();
        due.sort_by_key(|t| t.next_due);
        due.into_iter().map(|t| t.name.clone()).collect()
    }

    /// Marks the start of a run; returns how late the task started.
    pub fn start(&mut self, name: &str, now: Instant) -> Result<Duration> {
        let task = self.task_mut(name)?;
        task.started = Some(now);
        Ok(now.saturating_duration_since(task.next_due))
    }

    /// Records the end of a run and advances the due time.
    pub fn complete(&mut self, name: &str, now: Instant) -> Result<RunReport> {
        let task = self.task_mut(name)?;
        let duration = task
            .started
            .take()
            .map(|s| now.saturating_duration_since(s))
            .unwrap_or_default();
        task.last_duration = duration;
        task.next_due = (task.next_due + task.interval).max(now);
        Ok(RunReport {
            duration,
            overrun: duration > task.interval,
        })
    }

    /// Earliest due time across active tasks.
    pub fn next_due(&self) -> Option<Instant> {
        self.tasks().into_iter().map(|t| t.next_due).min()
    }

    pub fn in_standby(&self) -> bool {
        self.standby.is_some()
    }

    pub fn standby_task(&self) -> Option<&Task> {
        self.standby.map(|i| &self.tasks[i])
    }

    /// Pins `name` to `interval` and suspends the other tasks.
    pub fn set_standby(&mut self, name: &str, interval: Duration) -> Result<()> {
        self.set_standby_at(name, interval, Instant::now())
    }

    pub fn set_standby_at(&mut self, name: &str, interval: Duration, now: Instant) -> Result<()> {
        if interval.is_zero() {
            return Err(HarvestError::InvalidParam(format!(
                "standby interval of [{}] must be positive",
                name
            )));
        }
        let pos = self
            .position(name)
            .ok_or_else(|| HarvestError::InvalidParam(format!("unknown task [{}]", name)))?;
        let task = &mut self.tasks[pos];
        task.interval = interval;
        task.started = None;
        task.next_due = now + interval;
        self.standby = Some(pos);
        Ok(())
    }

    /// Leaves standby: original intervals come back, the pinned task is due
    /// one interval from now, every other task is due immediately.
    pub fn recover(&mut self) {
        self.recover_at(Instant::now());
    }

    pub fn recover_at(&mut self, now: Instant) {
        let pinned = self.standby.take();
        for (i, task) in self.tasks.iter_mut().enumerate() {
            task.interval = task.original;
            task.next_due = if Some(i) == pinned {
                now + task.interval
            } else {
                now
            };
        }
    }

    /// Time left until the next due task.
    pub fn until_next(&self, now: Instant) -> Duration {
        self.next_due()
            .map(|due| due.saturating_duration_since(now))
            .unwrap_or(SLEEP_SLICE)
    }

    /// Sleeps until the next task is due. Returns `false` if `running`
    /// was cleared meanwhile.
    pub fn sleep(&self, running: &AtomicBool) -> bool {
        let mut remaining = self.until_next(Instant::now());
        while remaining > Duration::ZERO {
            if !running.load(Ordering::SeqCst) {
                return false;
            }
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        running.load(Ordering::SeqCst)
    }

    /// Blocks until the next task is due or a message arrives on `wake`.
    /// Returns `false` when woken or when the sender is gone.
    pub fn wait(&self, wake: &Receiver<()>) -> bool {
        match wake.recv_timeout(self.until_next(Instant::now())) {
            Err(RecvTimeoutError::Timeout) => true,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    fn standard(now: Instant) -> Schedule {
        let mut s = Schedule::new();
        s.new_task_at("counter", 1200 * SEC, true, now).unwrap();
        s.new_task_at("instance", 600 * SEC, true, now).unwrap();
        s.new_task_at("data", 180 * SEC, true, now).unwrap();
        s
    }

    #[test]
    fn rejects_duplicates_and_zero_interval() {
        let now = Instant::now();
        let mut s = standard(now);
        assert!(s.new_task_at("data", SEC, true, now).is_err());
        assert!(s.new_task_at("extra", Duration::ZERO, true, now).is_err());
    }

    #[test]
    fn run_now_makes_task_due() {
        let now = Instant::now();
        let mut s = Schedule::new();
        s.new_task_at("data", 60 * SEC, true, now).unwrap();
        s.new_task_at("instance", 600 * SEC, false, now).unwrap();
        assert_eq!(s.due_tasks(now), vec!["data".to_string()]);
        assert_eq!(s.next_due(), Some(now));
    }

    #[test]
    fn complete_advances_without_drift_burst() {
        let t0 = Instant::now();
        let mut s = Schedule::new();
        s.new_task_at("data", 60 * SEC, true, t0).unwrap();

        s.start("data", t0).unwrap();
        let report = s.complete("data", t0 + 2 * SEC).unwrap();
        assert_eq!(report.duration, 2 * SEC);
        assert!(!report.overrun);
        assert_eq!(s.task("data").unwrap().next_due(), t0 + 60 * SEC);

        // a run far longer than the interval: due immediately, once
        let t1 = t0 + 60 * SEC;
        s.start("data", t1).unwrap();
        let report = s.complete("data", t1 + 200 * SEC).unwrap();
        assert!(report.overrun);
        assert_eq!(s.task("data").unwrap().next_due(), t1 + 200 * SEC);
    }

    #[test]
    fn start_reports_lag() {
        let t0 = Instant::now();
        let mut s = Schedule::new();
        s.new_task_at("data", 60 * SEC, true, t0).unwrap();
        let lag = s.start("data", t0 + Duration::from_millis(75)).unwrap();
        assert_eq!(lag, Duration::from_millis(75));
    }

    #[test]
    fn next_due_never_decreases() {
        let t0 = Instant::now();
        let mut s = standard(t0);
        let mut last = s.next_due().unwrap();
        let mut now = t0;
        for _ in 0..20 {
            for name in s.due_tasks(now) {
                s.start(&name, now).unwrap();
                s.complete(&name, now + SEC).unwrap();
            }
            let next = s.next_due().unwrap();
            assert!(next >= last);
            last = next;
            now = next;
        }
    }

    #[test]
    fn standby_only_exposes_pinned_task() {
        let now = Instant::now();
        let mut s = standard(now);
        s.set_standby_at("data", 1024 * SEC, now).unwrap();
        assert!(s.in_standby());
        let names: Vec<&str> = s.tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["data"]);
        assert_eq!(s.next_due(), Some(now + 1024 * SEC));
        assert!(s.due_tasks(now + 10 * SEC).is_empty());
    }

    #[test]
    fn recover_restores_intervals_exactly() {
        let now = Instant::now();
        let mut s = standard(now);
        s.set_standby_at("data", 1024 * SEC, now).unwrap();
        s.set_standby_at("counter", 1024 * SEC, now).unwrap();
        s.set_standby_at("instance", 1024 * SEC, now).unwrap();
        let later = now + 5 * SEC;
        s.recover_at(later);

        assert!(!s.in_standby());
        assert_eq!(s.task("counter").unwrap().interval(), 1200 * SEC);
        assert_eq!(s.task("instance").unwrap().interval(), 600 * SEC);
        assert_eq!(s.task("data").unwrap().interval(), 180 * SEC);
        // the pinned task waits a full interval, the others are due now
        assert_eq!(s.task("instance").unwrap().next_due(), later + 600 * SEC);
        assert!(s.task("data").unwrap().is_due(later));
        assert!(s.task("counter").unwrap().is_due(later));
    }

    #[test]
    fn sleep_returns_false_on_shutdown() {
        let now = Instant::now();
        let mut s = Schedule::new();
        s.new_task_at("data", 3600 * SEC, false, now).unwrap();
        let running = AtomicBool::new(false);
        assert!(!s.sleep(&running));
    }

    #[test]
    fn wait_wakes_on_message() {
        let now = Instant::now();
        let mut s = Schedule::new();
        s.new_task_at("data", 3600 * SEC, false, now).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        tx.send(()).unwrap();
        assert!(!s.wait(&rx));

        let mut due = Schedule::new();
        due.new_task_at("data", SEC, true, now).unwrap();
        let (_tx, rx) = std::sync::mpsc::channel::<()>();
        assert!(due.wait(&rx));
    }
}
