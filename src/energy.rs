//! Energy Regulator
//!
//! Leaky-bucket accounting for the agent's capacity to think. Inference
//! drains the bucket, timed sleep refills it. The regulator is the sole
//! owner of the energy level; every other component reads it through here.

use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::types::{EnergyStatus, ENERGY_MAX, ENERGY_MIN};

/// Map an energy level to its five-valued status tag.
pub fn energy_status(level: f64) -> EnergyStatus {
    if level > 50.0 {
        EnergyStatus::High
    } else if level > 20.0 {
        EnergyStatus::Medium
    } else if level > 0.0 {
        EnergyStatus::Low
    } else if level == 0.0 {
        EnergyStatus::Depleted
    } else {
        EnergyStatus::Urgent
    }
}

/// The process-wide energy bucket. All operations are total; none fail.
pub struct EnergyRegulator {
    level: Mutex<f64>,
    replenish_rate: f64,
}

impl EnergyRegulator {
    /// Create a full bucket replenishing at `replenish_rate` units/second.
    pub fn new(replenish_rate: f64) -> Self {
        let rate = if replenish_rate > 0.0 { replenish_rate } else { 1.0 };
        Self {
            level: Mutex::new(ENERGY_MAX),
            replenish_rate: rate,
        }
    }

    /// The current energy level E.
    pub fn current(&self) -> f64 {
        *self.level.lock().unwrap()
    }

    /// UI-facing percentage: max(0, E) rounded. Never negative.
    pub fn percentage(&self) -> i64 {
        self.current().max(0.0).round() as i64
    }

    /// Drain `amount` from the bucket, clamping at the floor. Negative
    /// amounts are a net credit (fast inference); the ceiling is not
    /// enforced on this path.
    pub fn consume(&self, amount: f64) {
        let mut level = self.level.lock().unwrap();
        *level = (*level - amount).max(ENERGY_MIN);
        debug!(energy = *level, consumed = amount, "energy consumed");
    }

    /// Suspend for `seconds`, then credit `seconds * rate` up to the ceiling.
    pub async fn sleep(&self, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        let mut level = self.level.lock().unwrap();
        *level = (*level + seconds * self.replenish_rate).min(ENERGY_MAX);
        debug!(energy = *level, slept_secs = seconds, "energy replenished");
    }

    /// Block until E reaches `target`. Returns immediately when already
    /// there. A bucket pinned to the floor recovers all the way to the
    /// ceiling regardless of the requested target.
    pub async fn await_level(&self, target: f64) {
        let level = self.current();
        if level >= target {
            return;
        }

        let deficit = if level <= ENERGY_MIN {
            ENERGY_MAX - level
        } else {
            target - level
        };

        let seconds = (deficit / self.replenish_rate).ceil();
        self.sleep(seconds).await;
    }

    /// The five-valued status tag for the current level.
    pub fn status(&self) -> EnergyStatus {
        energy_status(self.current())
    }

    /// Energy units regained per second of sleep; used by callers sizing
    /// their own waits.
    pub fn replenish_rate(&self) -> f64 {
        self.replenish_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_boundaries() {
        assert_eq!(energy_status(100.0), EnergyStatus::High);
        assert_eq!(energy_status(50.1), EnergyStatus::High);
        assert_eq!(energy_status(50.0), EnergyStatus::Medium);
        assert_eq!(energy_status(20.1), EnergyStatus::Medium);
        assert_eq!(energy_status(20.0), EnergyStatus::Low);
        assert_eq!(energy_status(0.5), EnergyStatus::Low);
        assert_eq!(energy_status(0.0), EnergyStatus::Depleted);
        assert_eq!(energy_status(-0.1), EnergyStatus::Urgent);
        assert_eq!(energy_status(-50.0), EnergyStatus::Urgent);
    }

    #[test]
    fn test_consume_clamps_at_floor() {
        let reg = EnergyRegulator::new(1.0);
        reg.consume(500.0);
        assert_eq!(reg.current(), ENERGY_MIN);
    }

    #[test]
    fn test_consume_negative_is_a_credit() {
        let reg = EnergyRegulator::new(1.0);
        reg.consume(60.0);
        assert_eq!(reg.current(), 40.0);
        reg.consume(-5.0);
        assert_eq!(reg.current(), 45.0);
    }

    #[test]
    fn test_percentage_never_negative() {
        let reg = EnergyRegulator::new(1.0);
        reg.consume(130.0);
        assert!(reg.current() < 0.0);
        assert_eq!(reg.percentage(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_replenishes_to_ceiling() {
        let reg = EnergyRegulator::new(10.0);
        reg.consume(30.0);
        reg.sleep(2.0).await;
        assert_eq!(reg.current(), 90.0);
        reg.sleep(100.0).await;
        assert_eq!(reg.current(), ENERGY_MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_level_returns_immediately_when_satisfied() {
        let reg = EnergyRegulator::new(10.0);
        let before = tokio::time::Instant::now();
        reg.await_level(50.0).await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_level_sleeps_to_target() {
        let reg = EnergyRegulator::new(10.0);
        reg.consume(80.0);
        assert_eq!(reg.current(), 20.0);
        reg.await_level(60.0).await;
        assert!(reg.current() >= 60.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deep_deficit_recovers_fully() {
        let reg = EnergyRegulator::new(10.0);
        reg.consume(1000.0);
        assert_eq!(reg.current(), ENERGY_MIN);
        reg.await_level(5.0).await;
        assert_eq!(reg.current(), ENERGY_MAX);
    }
}
