//! Deadlines owned by the session state machine.
//!
//! Every timer purpose holds at most one deadline: arming a timer replaces
//! whatever was armed for the same purpose. The coordinator sleeps until the
//! earliest deadline and then asks for the timers that are due.

use std::{collections::BTreeMap, fmt};

use tokio::time::Instant;

/// Timer purposes.
///
/// The declaration order breaks ties between timers due at the same instant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Timer {
    /// Shows the warning after `idle_timeout - countdown` of inactivity.
    IdleWarning,
    /// Shows the warning `warning_lead` before the access token expires.
    ExpiryWarning,
    /// Updates the visible countdown once per second.
    CountdownTick,
    /// Ends the session when the countdown deadline passes.
    CountdownLogout,
    /// Ends the session after `idle_timeout` of inactivity.
    IdleLogout,
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Timer::IdleWarning => "idle warning",
            Timer::ExpiryWarning => "expiry warning",
            Timer::CountdownTick => "countdown tick",
            Timer::CountdownLogout => "countdown logout",
            Timer::IdleLogout => "idle logout",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scheduler {
    deadlines: BTreeMap<Timer, Instant>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `timer` at `deadline`, replacing a previous deadline.
    pub fn arm(&mut self, timer: Timer, deadline: Instant) {
        trace!("arming {timer}");
        self.deadlines.insert(timer, deadline);
    }

    pub fn cancel(&mut self, timer: Timer) {
        self.deadlines.remove(&timer);
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    #[must_use]
    pub fn deadline(&self, timer: Timer) -> Option<Instant> {
        self.deadlines.get(&timer).copied()
    }

    /// The earliest deadline and its timer.
    #[must_use]
    pub fn next(&self) -> Option<(Timer, Instant)> {
        self.deadlines
            .iter()
            .map(|(&timer, &deadline)| (timer, deadline))
            .min_by_key(|&(timer, deadline)| (deadline, timer))
    }

    /// Disarms and returns the earliest timer whose deadline is not after
    /// `now`.
    pub fn take_due(&mut self, now: Instant) -> Option<Timer> {
        let (timer, deadline) = self.next()?;
        if deadline > now {
            return None;
        }

        self.deadlines.remove(&timer);
        Some(timer)
    }

    /// All armed timers, earliest first.
    #[must_use]
    pub fn armed(&self) -> Vec<(Timer, Instant)> {
        let mut armed: Vec<_> = self
            .deadlines
            .iter()
            .map(|(&timer, &deadline)| (timer, deadline))
            .collect();
        armed.sort_by_key(|&(timer, deadline)| (deadline, timer));
        armed
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn arming_replaces_same_purpose() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.arm(Timer::IdleWarning, now + Duration::from_secs(10));
        scheduler.arm(Timer::IdleWarning, now + Duration::from_secs(20));

        assert_eq!(
            scheduler.armed(),
            vec![(Timer::IdleWarning, now + Duration::from_secs(20))]
        );
    }

    #[test]
    fn takes_due_timers_in_order() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.arm(Timer::IdleLogout, now + Duration::from_secs(5));
        scheduler.arm(Timer::CountdownLogout, now + Duration::from_secs(5));
        scheduler.arm(Timer::ExpiryWarning, now + Duration::from_secs(1));
        scheduler.arm(Timer::IdleWarning, now + Duration::from_secs(60));

        let later = now + Duration::from_secs(5);
        assert_eq!(scheduler.take_due(later), Some(Timer::ExpiryWarning));
        assert_eq!(scheduler.take_due(later), Some(Timer::CountdownLogout));
        assert_eq!(scheduler.take_due(later), Some(Timer::IdleLogout));
        assert_eq!(scheduler.take_due(later), None);
        assert_eq!(scheduler.armed().len(), 1);
    }

    #[test]
    fn cancel_all_empties() {
        let now = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.arm(Timer::CountdownTick, now);
        scheduler.arm(Timer::IdleLogout, now);
        scheduler.cancel_all();

        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next(), None);
    }
}
