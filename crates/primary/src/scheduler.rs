use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduledAction {
    PollVinStart,
    PollVinMiddle,
    PollVinEnd,
    PollPlugState,
    PollStats,
    PowerCheck,
}

/// Cadence of the periodic polls; the power check interval lives in the
/// operator settings.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub vin_poll: Duration,
    pub plug_state_poll: Duration,
    pub stats_poll: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            vin_poll: Duration::from_secs(5),
            plug_state_poll: Duration::from_secs(10),
            stats_poll: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct PeriodicTask {
    action: ScheduledAction,
    interval: Duration,
    last_run: Instant,
}

/// Interval gates checked once per loop iteration. Nothing here waits; an
/// action is simply reported as due.
#[derive(Debug, Clone)]
pub struct Scheduler {
    tasks: Vec<PeriodicTask>,
}

impl Scheduler {
    /// Every task's clock starts at `now`, so nothing fires on the first tick.
    pub fn new(config: &ScheduleConfig, power_check: Duration, now: Instant) -> Self {
        let task = |action, interval| PeriodicTask {
            action,
            interval,
            last_run: now,
        };
        Self {
            tasks: vec![
                task(ScheduledAction::PollVinStart, config.vin_poll),
                task(ScheduledAction::PollVinMiddle, config.vin_poll),
                task(ScheduledAction::PollVinEnd, config.vin_poll),
                task(ScheduledAction::PollPlugState, config.plug_state_poll),
                task(ScheduledAction::PollStats, config.stats_poll),
                task(ScheduledAction::PowerCheck, power_check),
            ],
        }
    }

    /// Actions whose interval has elapsed, in a stable order. Each returned
    /// action has its clock reset to `now`.
    pub fn due(&mut self, now: Instant) -> Vec<ScheduledAction> {
        let mut due = Vec::new();
        for task in &mut self.tasks {
            if now.saturating_duration_since(task.last_run) >= task.interval {
                task.last_run = now;
                due.push(task.action);
            }
        }
        due
    }

    pub fn set_interval(&mut self, action: ScheduledAction, interval: Duration) {
        for task in self.tasks.iter_mut().filter(|task| task.action == action) {
            task.interval = interval;
        }
    }

    pub fn interval(&self, action: ScheduledAction) -> Option<Duration> {
        self.tasks
            .iter()
            .find(|task| task.action == action)
            .map(|task| task.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_fire_independently() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new(&ScheduleConfig::default(), Duration::from_secs(60), start);

        assert!(scheduler.due(start + Duration::from_secs(4)).is_empty());

        let due = scheduler.due(start + Duration::from_secs(5));
        assert_eq!(
            due,
            vec![
                ScheduledAction::PollVinStart,
                ScheduledAction::PollVinMiddle,
                ScheduledAction::PollVinEnd
            ]
        );

        let due = scheduler.due(start + Duration::from_secs(10));
        assert!(due.contains(&ScheduledAction::PollPlugState));
        assert!(due.contains(&ScheduledAction::PollVinStart));
        assert!(!due.contains(&ScheduledAction::PollStats));

        let due = scheduler.due(start + Duration::from_secs(60));
        assert!(due.contains(&ScheduledAction::PowerCheck));
        assert!(due.contains(&ScheduledAction::PollStats));
    }

    #[test]
    fn interval_can_be_retuned() {
        let start = Instant::now();
        let mut scheduler = Scheduler::new(&ScheduleConfig::default(), Duration::from_secs(60), start);
        scheduler.set_interval(ScheduledAction::PowerCheck, Duration::from_secs(120));
        assert_eq!(
            scheduler.interval(ScheduledAction::PowerCheck),
            Some(Duration::from_secs(120))
        );
        assert!(!scheduler
            .due(start + Duration::from_secs(60))
            .contains(&ScheduledAction::PowerCheck));
    }
}
