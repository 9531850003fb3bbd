//! Timestamps carried by every group and entry.
//!
//! `location_changed` advances whenever an entity's parent changes; the merge
//! engine uses it to decide which replica's parenting wins. All stamps are
//! truncated to whole seconds, the resolution of the container format, so a
//! saved and reopened database compares equal to its in-memory original.

use chrono::{DateTime, TimeZone, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInfo {
    pub creation_time: DateTime<Utc>,
    pub last_modification_time: DateTime<Utc>,
    pub last_access_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub expires: bool,
    pub usage_count: u32,
    pub location_changed: DateTime<Utc>,
}

impl TimeInfo {
    pub fn now() -> Self {
        let now = now_truncated();
        Self {
            creation_time: now,
            last_modification_time: now,
            last_access_time: now,
            expiry_time: now,
            expires: false,
            usage_count: 0,
            location_changed: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires && self.expiry_time <= now_truncated()
    }

    pub fn update_modification(&mut self) {
        let now = now_truncated();
        self.last_modification_time = now;
        self.last_access_time = now;
    }

    pub fn update_access(&mut self) {
        self.last_access_time = now_truncated();
    }

    pub fn update_location(&mut self) {
        self.location_changed = now_truncated();
    }

    pub fn bump_usage(&mut self) {
        self.usage_count = self.usage_count.saturating_add(1);
        self.update_access();
    }
}

impl Default for TimeInfo {
    fn default() -> Self {
        Self::now()
    }
}

/// Current time at whole-second resolution.
pub fn now_truncated() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Drop sub-second precision from a timestamp.
pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.timestamp(), 0)
        .single()
        .unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn fresh_times_are_consistent() {
        let t = TimeInfo::now();
        assert_eq!(t.creation_time, t.last_modification_time);
        assert_eq!(t.usage_count, 0);
        assert!(!t.expires);
        assert!(!t.is_expired());
    }

    #[test]
    fn expiry_requires_flag() {
        let mut t = TimeInfo::now();
        t.expiry_time = now_truncated() - Duration::hours(1);
        assert!(!t.is_expired(), "expiry time alone does not expire");
        t.expires = true;
        assert!(t.is_expired());
    }

    #[test]
    fn future_expiry_not_expired() {
        let mut t = TimeInfo::now();
        t.expires = true;
        t.expiry_time = now_truncated() + Duration::hours(1);
        assert!(!t.is_expired());
    }

    #[test]
    fn usage_bump_touches_access() {
        let mut t = TimeInfo::now();
        t.bump_usage();
        assert_eq!(t.usage_count, 1);
    }

    #[test]
    fn timestamps_carry_no_subsecond_precision() {
        let t = TimeInfo::now();
        assert_eq!(t.creation_time.timestamp_subsec_nanos(), 0);
    }
}
