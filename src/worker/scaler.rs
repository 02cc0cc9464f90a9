/// Adaptive concurrency scaler: maps a system-health zone to a safe
/// concurrency ceiling, with cooldown-protected increases.
///
/// Decreases (health deteriorating) apply immediately; increases (health
/// improving) are throttled to at most once per cooldown window, so a
/// flapping health signal cannot whipsaw worker concurrency.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::services::HealthZone;

struct ScalerState {
    current: usize,
    last_increase: Option<Instant>,
}

pub struct Scaler {
    min: usize,
    max: usize,
    cooldown: Duration,
    enabled: Mutex<bool>,
    bounds: Mutex<(usize, usize)>,
    state: Mutex<ScalerState>,
}

impl Scaler {
    pub fn new(enabled: bool, min: usize, max: usize, cooldown: Duration) -> Self {
        let max = max.max(min);
        Scaler {
            min,
            max,
            cooldown,
            enabled: Mutex::new(enabled),
            bounds: Mutex::new((min, max)),
            state: Mutex::new(ScalerState {
                current: max,
                last_increase: None,
            }),
        }
    }

    /// Returns the concurrency ceiling for this tick, given the caller's
    /// desired concurrency and the current health zone.
    pub fn get(&self, desired: usize, zone: HealthZone) -> usize {
        let (min, max) = *self.bounds.lock().unwrap();
        let enabled = *self.enabled.lock().unwrap();

        if !enabled {
            return desired.clamp(min, max).max(1);
        }

        let target = match zone {
            HealthZone::Critical => min,
            HealthZone::Warning => min + (max.saturating_sub(min)) / 2,
            HealthZone::Safe => max,
        };

        let mut state = self.state.lock().unwrap();
        state.current = state.current.clamp(min, max);

        if target <= state.current {
            state.current = target;
        } else {
            let ready = state
                .last_increase
                .map(|t| t.elapsed() >= self.cooldown)
                .unwrap_or(true);
            if ready {
                state.current = target;
                state.last_increase = Some(Instant::now());
            }
        }

        state.current.max(1)
    }

    /// Re-clamp bounds and the currently held value immediately, bypassing
    /// the cooldown.
    pub fn update_config(&self, enabled: bool, min: usize, max: usize) {
        let max = max.max(min);
        *self.enabled.lock().unwrap() = enabled;
        *self.bounds.lock().unwrap() = (min, max);
        let mut state = self.state.lock().unwrap();
        state.current = state.current.clamp(min, max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_scaler_just_clamps_desired() {
        let scaler = Scaler::new(false, 1, 10, Duration::from_secs(30));
        assert_eq!(scaler.get(5, HealthZone::Critical), 5);
        assert_eq!(scaler.get(50, HealthZone::Safe), 10);
        assert_eq!(scaler.get(0, HealthZone::Warning), 1);
    }

    #[test]
    fn critical_zone_drops_to_min_immediately() {
        let scaler = Scaler::new(true, 2, 20, Duration::from_secs(30));
        assert_eq!(scaler.get(0, HealthZone::Safe), 20);
        assert_eq!(scaler.get(0, HealthZone::Critical), 2);
    }

    #[test]
    fn warning_zone_is_midrange() {
        let scaler = Scaler::new(true, 0, 20, Duration::from_secs(30));
        scaler.get(0, HealthZone::Critical);
        assert_eq!(scaler.get(0, HealthZone::Warning), 10);
    }

    #[test]
    fn increase_is_gated_by_cooldown() {
        let scaler = Scaler::new(true, 1, 100, Duration::from_secs(3600));
        scaler.get(0, HealthZone::Critical);
        assert_eq!(scaler.get(0, HealthZone::Critical), 1);
        // Safe zone wants 100, but cooldown has not elapsed since last increase.
        assert_eq!(scaler.get(0, HealthZone::Safe), 1);
    }

    #[test]
    fn update_config_reclamps_immediately_bypassing_cooldown() {
        let scaler = Scaler::new(true, 1, 100, Duration::from_secs(3600));
        scaler.get(0, HealthZone::Safe);
        assert_eq!(scaler.get(0, HealthZone::Safe), 100);
        scaler.update_config(true, 1, 10);
        assert_eq!(scaler.get(0, HealthZone::Safe), 10);
    }
}
