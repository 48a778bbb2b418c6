//! Backend entry options and store-time expiration planning
//!
//! The planner decides the absolute lifetime of a stored payload. When the
//! caller supplied [`EntryOptions`] they are used verbatim (cloned, never
//! mutated); when the engine constructs the options itself it applies
//! randomized jitter so that keys created together do not all expire in the
//! same instant.

use std::time::{Duration, SystemTime};

use rand::Rng;

/// Upper bound for the jitter fraction; values above are clamped.
const MAX_JITTER_FRACTION: f64 = 0.9;
/// Jittered relative expirations never drop below this.
const MIN_RELATIVE_EXPIRATION: Duration = Duration::from_millis(1);

/// Expiration options handed to the backend on every store.
///
/// At least one field drives the effective lifetime; an entirely empty value
/// means "backend default / no expiration".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryOptions {
    /// Expire at this wall-clock instant
    pub absolute_expiration: Option<SystemTime>,
    /// Expire this long after the store
    pub absolute_expiration_relative_to_now: Option<Duration>,
    /// Expire this long after the last access, where the backend supports it
    pub sliding_expiration: Option<Duration>,
}

impl EntryOptions {
    /// Expire the entry `ttl` after the store.
    pub fn expires_in(ttl: Duration) -> Self {
        Self {
            absolute_expiration_relative_to_now: Some(ttl),
            ..Default::default()
        }
    }

    /// The time-to-live these options imply for a store happening now, for
    /// backends that only support a per-write TTL.
    pub fn time_to_live(&self) -> Option<Duration> {
        if let Some(relative) = self.absolute_expiration_relative_to_now {
            return Some(relative);
        }
        if let Some(at) = self.absolute_expiration {
            // An absolute instant already in the past becomes a zero TTL.
            return Some(
                at.duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            );
        }
        self.sliding_expiration
    }
}

/// Build the options for a store.
///
/// Caller-supplied options are respected as-is; jitter applies only to
/// options the engine constructed itself.
pub(crate) fn plan_store_options(
    caller_options: Option<&EntryOptions>,
    hard_ttl: Duration,
    jitter_fraction: f64,
) -> EntryOptions {
    match caller_options {
        Some(options) => options.clone(),
        None => {
            let mut options = EntryOptions::expires_in(hard_ttl);
            apply_jitter(&mut options, jitter_fraction);
            options
        }
    }
}

/// Scale the relative expiration by a uniform factor in `[1−f, 1+f]`.
fn apply_jitter(options: &mut EntryOptions, jitter_fraction: f64) {
    let fraction = jitter_fraction.clamp(0.0, MAX_JITTER_FRACTION);
    if fraction <= 0.0 {
        return;
    }
    let Some(relative) = options.absolute_expiration_relative_to_now else {
        return;
    };
    if relative.is_zero() {
        return;
    }

    let delta = rand::rng().random_range(-fraction..=fraction);
    let scaled = Duration::from_secs_f64(relative.as_secs_f64() * (1.0 + delta));
    options.absolute_expiration_relative_to_now = Some(scaled.max(MIN_RELATIVE_EXPIRATION));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_options_used_verbatim() {
        let caller = EntryOptions {
            absolute_expiration_relative_to_now: Some(Duration::from_secs(10)),
            sliding_expiration: Some(Duration::from_secs(1)),
            ..Default::default()
        };

        let planned = plan_store_options(Some(&caller), Duration::from_secs(99), 0.9);

        // No jitter, no mutation: the plan is a verbatim clone and the
        // caller's copy is untouched.
        assert_eq!(planned, caller);
        assert_eq!(
            caller.absolute_expiration_relative_to_now,
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_engine_constructed_options_use_hard_ttl() {
        let planned = plan_store_options(None, Duration::from_secs(60), 0.0);
        assert_eq!(
            planned.absolute_expiration_relative_to_now,
            Some(Duration::from_secs(60))
        );
        assert!(planned.absolute_expiration.is_none());
        assert!(planned.sliding_expiration.is_none());
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let ttl = Duration::from_secs(100);
        let fraction = 0.25;
        for _ in 0..500 {
            let planned = plan_store_options(None, ttl, fraction);
            let relative = planned.absolute_expiration_relative_to_now.unwrap();
            let lower = ttl.as_secs_f64() * (1.0 - fraction);
            let upper = ttl.as_secs_f64() * (1.0 + fraction);
            assert!(relative.as_secs_f64() >= lower - 1e-6);
            assert!(relative.as_secs_f64() <= upper + 1e-6);
        }
    }

    #[test]
    fn test_jitter_fraction_clamped() {
        let ttl = Duration::from_secs(10);
        for _ in 0..500 {
            let planned = plan_store_options(None, ttl, 5.0);
            let relative = planned.absolute_expiration_relative_to_now.unwrap();
            // Clamped to 0.9, so never negative and never above 1.9x.
            assert!(relative >= MIN_RELATIVE_EXPIRATION);
            assert!(relative.as_secs_f64() <= ttl.as_secs_f64() * 1.9 + 1e-6);
        }
    }

    #[test]
    fn test_zero_fraction_and_zero_ttl_skip_jitter() {
        let planned = plan_store_options(None, Duration::from_secs(10), 0.0);
        assert_eq!(
            planned.absolute_expiration_relative_to_now,
            Some(Duration::from_secs(10))
        );

        let planned = plan_store_options(None, Duration::ZERO, 0.9);
        assert_eq!(
            planned.absolute_expiration_relative_to_now,
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_jitter_floors_at_one_millisecond() {
        for _ in 0..200 {
            let planned = plan_store_options(None, Duration::from_millis(1), 0.9);
            assert!(planned.absolute_expiration_relative_to_now.unwrap() >= MIN_RELATIVE_EXPIRATION);
        }
    }

    #[test]
    fn test_time_to_live_precedence() {
        let options = EntryOptions {
            absolute_expiration: Some(SystemTime::now() + Duration::from_secs(100)),
            absolute_expiration_relative_to_now: Some(Duration::from_secs(5)),
            sliding_expiration: Some(Duration::from_secs(1)),
        };
        assert_eq!(options.time_to_live(), Some(Duration::from_secs(5)));

        let options = EntryOptions {
            absolute_expiration: Some(SystemTime::now() - Duration::from_secs(1)),
            ..Default::default()
        };
        assert_eq!(options.time_to_live(), Some(Duration::ZERO));

        assert_eq!(EntryOptions::default().time_to_live(), None);
    }
}
