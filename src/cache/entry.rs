//! Memory tier entry with TTL support

use crate::cache::config::MAX_TTL_SECONDS;
use std::time::Duration;
use tokio::time::Instant;

/// A value held by the memory tier together with its expiry
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached value
    pub value: V,

    /// When the entry stops being served
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    /// Create an entry expiring `ttl_seconds` from `now`, clamped to `1..=MAX_TTL_SECONDS`
    pub fn new(value: V, ttl_seconds: u64, now: Instant) -> Self {
        let ttl = Duration::from_secs(ttl_seconds.clamp(1, MAX_TTL_SECONDS));
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(Duration::from_secs(1)))
            .unwrap_or(now);

        Self { value, expires_at }
    }

    /// An entry is expired once `expires_at <= now`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_is_floored_to_one_second() {
        let now = Instant::now();
        let entry = CacheEntry::new("value", 0, now);

        assert_eq!(entry.expires_at, now + Duration::from_secs(1));
        assert!(!entry.is_expired_at(now));
        assert!(entry.is_expired_at(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Instant::now();
        let entry = CacheEntry::new(42u32, 10, now);

        assert!(!entry.is_expired_at(now + Duration::from_millis(9_999)));
        assert!(entry.is_expired_at(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_huge_ttl_is_clamped() {
        let now = Instant::now();
        let entry = CacheEntry::new("value", u64::MAX, now);

        assert_eq!(entry.expires_at, now + Duration::from_secs(MAX_TTL_SECONDS));
        assert!(!entry.is_expired_at(now + Duration::from_secs(MAX_TTL_SECONDS - 1)));
    }
}
