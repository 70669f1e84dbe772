//! Conversions between the seconds used at the API surface and the integer
//! microseconds used everywhere internally.

pub const US_PER_SEC: i64 = 1_000_000;

pub fn sec_to_us(secs: f64) -> i64 {
    (secs * US_PER_SEC as f64).round() as i64
}

pub fn us_to_sec(us: i64) -> f64 {
    us as f64 / US_PER_SEC as f64
}

/// Surface presentation timestamps are expressed in nanoseconds.
pub fn us_to_ns(us: i64) -> i64 {
    us.saturating_mul(1000)
}

pub fn ns_to_us(ns: i64) -> i64 {
    ns / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(sec_to_us(0.1), 100_000);
        assert_eq!(sec_to_us(2.5), 2_500_000);
        assert_eq!(sec_to_us(-0.5), -500_000);
        assert_eq!(us_to_sec(1_500_000), 1.5);
        assert_eq!(us_to_ns(33_333), 33_333_000);
        assert_eq!(ns_to_us(33_333_999), 33_333);
    }
}
