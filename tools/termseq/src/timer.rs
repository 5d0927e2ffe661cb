use std::time::{Duration, SystemTime};

/// Identifies one arming of a [`Watchdog`]. Firing with an id from an earlier
/// arming is a no-op, so a late wakeup never acts on a newer command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    pub generation: u64,
    pub deadline: SystemTime,
}

#[derive(Debug, Default)]
pub struct Watchdog {
    generation: u64,
    armed: Option<TimerId>,
}

impl Watchdog {
    pub fn arm(&mut self, now: SystemTime, after: Duration) -> TimerId {
        self.generation = self.generation.wrapping_add(1);
        let id = TimerId {
            generation: self.generation,
            deadline: now + after,
        };
        self.armed = Some(id);
        id
    }

    pub fn disarm(&mut self) {
        self.armed = None;
    }

    pub fn armed(&self) -> Option<TimerId> {
        self.armed
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Consume the armed timer if `id` is the current arming.
    pub fn take_if_current(&mut self, id: TimerId) -> bool {
        if self.armed == Some(id) {
            self.armed = None;
            return true;
        }
        false
    }

    /// The armed timer, if its deadline has passed at `now`.
    pub fn due(&self, now: SystemTime) -> Option<TimerId> {
        self.armed.filter(|id| now >= id.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_ids_do_not_fire_after_rearm() {
        let mut watchdog = Watchdog::default();
        let first = watchdog.arm(SystemTime::UNIX_EPOCH, Duration::from_secs(1));
        let second = watchdog.arm(SystemTime::UNIX_EPOCH, Duration::from_secs(1));
        assert!(!watchdog.take_if_current(first));
        assert!(watchdog.take_if_current(second));
        assert!(!watchdog.is_armed());
    }

    #[test]
    fn due_only_at_or_after_deadline() {
        let mut watchdog = Watchdog::default();
        let start = SystemTime::UNIX_EPOCH;
        watchdog.arm(start, Duration::from_millis(100));
        assert!(watchdog.due(start + Duration::from_millis(99)).is_none());
        assert!(watchdog.due(start + Duration::from_millis(100)).is_some());
        watchdog.disarm();
        assert!(watchdog.due(start + Duration::from_secs(5)).is_none());
    }
}
