use chrono::Duration;

/// `base * 2^min(prior, exponent_cap)`, never longer than `max`.
#[must_use]
pub fn lockout_duration(
    base: Duration,
    prior_lockouts: u64,
    exponent_cap: u32,
    max: Duration,
) -> Duration {
    let exponent = u32::try_from(prior_lockouts)
        .unwrap_or(u32::MAX)
        .min(exponent_cap)
        .min(30);
    base.checked_mul(1_i32 << exponent).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_prior_lockout() {
        let base = Duration::minutes(30);
        let max = Duration::hours(24);
        assert_eq!(lockout_duration(base, 0, 6, max), Duration::minutes(30));
        assert_eq!(lockout_duration(base, 1, 6, max), Duration::hours(1));
        assert_eq!(lockout_duration(base, 3, 6, max), Duration::hours(4));
    }

    #[test]
    fn capped_at_max() {
        let base = Duration::hours(1);
        let max = Duration::hours(24);
        assert_eq!(lockout_duration(base, 5, 6, max), Duration::hours(24));
        assert_eq!(lockout_duration(base, 500, 6, max), Duration::hours(24));
    }

    #[test]
    fn never_shrinks() {
        let base = Duration::minutes(30);
        let max = Duration::hours(24);
        let mut previous = Duration::zero();
        for prior in 0..20 {
            let current = lockout_duration(base, prior, 6, max);
            assert!(current >= previous);
            previous = current;
        }
    }
}
