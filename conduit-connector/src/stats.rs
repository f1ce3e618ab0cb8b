use crate::state::LifecycleState;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub type SharedStats = Arc<Mutex<Stats>>;

/// Fixed-window moving average of execute cycle durations
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<Duration>,
    total: Duration,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
            total: Duration::ZERO,
        }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.total -= oldest;
            }
        }
        self.samples.push_back(sample);
        self.total += sample;
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.total / self.samples.len() as u32)
    }
}

#[derive(Debug, Clone)]
pub struct Stats {
    entries: [u64; 6],
    pub transport_opens: u64,
    pub faults: u64,
    /// Consecutive faults since the last successful cycle
    pub fault_streak: u32,
    pub cycles: u64,
    cycle_time: MovingAverage,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            entries: [0; 6],
            transport_opens: 0,
            faults: 0,
            fault_streak: 0,
            cycles: 0,
            cycle_time: MovingAverage::new(60),
        }
    }
}

impl Stats {
    pub fn entries(&self, state: LifecycleState) -> u64 {
        self.entries[state.index()]
    }

    pub(crate) fn record_entry(&mut self, state: LifecycleState) {
        self.entries[state.index()] += 1;
    }

    /// Returns the new streak length
    pub(crate) fn record_fault(&mut self) -> u32 {
        self.faults += 1;
        self.fault_streak += 1;
        self.fault_streak
    }

    pub(crate) fn record_cycle(&mut self, elapsed: Duration) {
        self.cycles += 1;
        self.fault_streak = 0;
        self.cycle_time.push(elapsed);
    }

    pub fn average_cycle(&self) -> Option<Duration> {
        self.cycle_time.average()
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            configure: self.entries(LifecycleState::Configure),
            connect: self.entries(LifecycleState::Connect),
            recover: self.entries(LifecycleState::Recover),
            transport_opens: self.transport_opens,
            faults: self.faults,
            cycles: self.cycles,
            average_cycle_ms: self.average_cycle().map(|d| d.as_secs_f64() * 1000.0),
        }
    }
}

/// Compact form logged when the process exits
#[derive(Debug, Serialize)]
pub struct StatsSummary {
    pub configure: u64,
    pub connect: u64,
    pub recover: u64,
    pub transport_opens: u64,
    pub faults: u64,
    pub cycles: u64,
    pub average_cycle_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moving_average_window() {
        let mut avg = MovingAverage::new(2);
        assert_eq!(avg.average(), None);
        avg.push(Duration::from_millis(10));
        avg.push(Duration::from_millis(20));
        avg.push(Duration::from_millis(60));
        assert_eq!(avg.average(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_successful_cycle_clears_fault_streak() {
        let mut stats = Stats::default();
        assert_eq!(stats.record_fault(), 1);
        assert_eq!(stats.record_fault(), 2);
        stats.record_cycle(Duration::from_millis(5));
        assert_eq!(stats.fault_streak, 0);
        assert_eq!(stats.faults, 2);
        assert_eq!(stats.record_fault(), 1);
    }
}
