//! Time-of-day endpoint selection

use chrono::{NaiveDateTime, Timelike};
use kiosk_shared::config::ProbeConfig;

/// Chooses which liveness endpoint the probe hits at a given local time.
pub trait EndpointPolicy: Send + Sync {
    fn endpoint_for(&self, now: NaiveDateTime) -> String;
}

impl<F> EndpointPolicy for F
where
    F: Fn(NaiveDateTime) -> String + Send + Sync,
{
    fn endpoint_for(&self, now: NaiveDateTime) -> String {
        self(now)
    }
}

/// Uses the quiet endpoint inside `[start_hour, end_hour)` local time. The
/// window may wrap midnight; equal hours disable it.
#[derive(Debug, Clone)]
pub struct QuietHoursPolicy {
    normal: String,
    quiet: String,
    start_hour: u32,
    end_hour: u32,
}

impl QuietHoursPolicy {
    pub fn new(normal: impl Into<String>, quiet: impl Into<String>, start_hour: u32, end_hour: u32) -> Self {
        Self {
            normal: normal.into(),
            quiet: quiet.into(),
            start_hour,
            end_hour,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(
            config.normal_endpoint.clone(),
            config.quiet_endpoint.clone(),
            config.quiet_start_hour,
            config.quiet_end_hour,
        )
    }

    pub fn is_quiet_hour(&self, hour: u32) -> bool {
        if self.start_hour == self.end_hour {
            false
        } else if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

impl EndpointPolicy for QuietHoursPolicy {
    fn endpoint_for(&self, now: NaiveDateTime) -> String {
        if self.is_quiet_hour(now.hour()) {
            self.quiet.clone()
        } else {
            self.normal.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn policy(start: u32, end: u32) -> QuietHoursPolicy {
        QuietHoursPolicy::new("http://localhost/health", "http://localhost/ping", start, end)
    }

    #[test]
    fn test_window_wrapping_midnight() {
        let p = policy(22, 6);
        assert_eq!(p.endpoint_for(at(23, 30)), "http://localhost/ping");
        assert_eq!(p.endpoint_for(at(0, 0)), "http://localhost/ping");
        assert_eq!(p.endpoint_for(at(5, 59)), "http://localhost/ping");
        assert_eq!(p.endpoint_for(at(6, 0)), "http://localhost/health");
        assert_eq!(p.endpoint_for(at(12, 0)), "http://localhost/health");
        assert_eq!(p.endpoint_for(at(21, 59)), "http://localhost/health");
        assert_eq!(p.endpoint_for(at(22, 0)), "http://localhost/ping");
    }

    #[test]
    fn test_daytime_window() {
        let p = policy(1, 4);
        assert!(!p.is_quiet_hour(0));
        assert!(p.is_quiet_hour(1));
        assert!(p.is_quiet_hour(3));
        assert!(!p.is_quiet_hour(4));
    }

    #[test]
    fn test_equal_hours_disable_quiet_window() {
        let p = policy(3, 3);
        for hour in 0..24 {
            assert!(!p.is_quiet_hour(hour));
        }
    }

    #[test]
    fn test_closure_policy() {
        let fixed = |_: NaiveDateTime| "http://fixed".to_string();
        assert_eq!(fixed.endpoint_for(at(9, 0)), "http://fixed");
    }
}
