use std::collections::HashMap;

/// Skip storing the records of this write.
pub const DO_NOT_STORE: &str = "do-not-store";
/// Delete records right after the read that loaded them.
pub const EVICT_AFTER_READ: &str = "evict-after-read";
/// Only write to the in-memory cache, not to the caches chained after it.
pub const MEMORY_CACHE_ONLY: &str = "memory-cache-only";
/// Receive date of the data being written, in unix seconds.
pub const RECEIVED_DATE: &str = "received-date";

/// Per-call hints for the storage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheHeaders {
    headers: HashMap<String, String>,
}

impl CacheHeaders {
    pub fn none() -> Self {
        CacheHeaders::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_received_date(self, date: i64) -> Self {
        self.with(RECEIVED_DATE, date.to_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .get(name)
            .is_some_and(|value| !value.eq_ignore_ascii_case("false"))
    }

    pub fn do_not_store(&self) -> bool {
        self.has_header(DO_NOT_STORE)
    }

    pub fn evict_after_read(&self) -> bool {
        self.has_header(EVICT_AFTER_READ)
    }

    pub fn memory_cache_only(&self) -> bool {
        self.has_header(MEMORY_CACHE_ONLY)
    }

    pub fn received_date(&self) -> Option<i64> {
        self.header(RECEIVED_DATE).and_then(|value| value.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        let headers = CacheHeaders::none()
            .with(DO_NOT_STORE, "true")
            .with(EVICT_AFTER_READ, "false")
            .with_received_date(1_700_000_000);

        assert!(headers.do_not_store());
        assert!(!headers.evict_after_read());
        assert!(!headers.memory_cache_only());
        assert_eq!(headers.received_date(), Some(1_700_000_000));
    }
}
