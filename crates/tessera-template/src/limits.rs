//! Compile-rate limiting.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tessera_core::error::{TesseraError, TesseraResult};
use tessera_core::settings::RateLimitSettings;

/// Caps how often one template may be compiled within a sliding window.
///
/// Many concurrent cache misses on the same hot template would otherwise all
/// compile it at once.
#[derive(Debug)]
pub struct CompileRateLimiter {
    max_compiles: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl CompileRateLimiter {
    pub fn new(max_compiles: usize, window: Duration) -> Self {
        Self {
            max_compiles,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(
            settings.max_compiles,
            Duration::from_secs(settings.window_secs),
        )
    }

    /// Records a compilation of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TesseraError::RateLimitExceeded`] if `name` has already been
    /// compiled `max_compiles` times within the window. Rejected attempts are
    /// not recorded.
    pub fn check(&self, name: &str) -> TesseraResult<()> {
        self.check_at(name, Instant::now())
    }

    fn check_at(&self, name: &str, now: Instant) -> TesseraResult<()> {
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        let recent = hits.entry(name.to_string()).or_default();
        while recent
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= self.window)
        {
            recent.pop_front();
        }
        if recent.len() >= self.max_compiles {
            tracing::warn!(template = name, limit = self.max_compiles, "compile rate limit hit");
            return Err(TesseraError::RateLimitExceeded {
                name: name.to_string(),
                limit: self.max_compiles,
                window_secs: self.window.as_secs(),
            });
        }
        recent.push_back(now);
        Ok(())
    }

    /// Forgets the history of `name`.
    pub fn reset(&self, name: &str) {
        self.hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_per_name() {
        let limiter = CompileRateLimiter::new(2, Duration::from_secs(60));
        limiter.check("a").unwrap();
        limiter.check("a").unwrap();
        let err = limiter.check("a").unwrap_err();
        assert!(err.is_limit());
        assert!(matches!(
            err,
            TesseraError::RateLimitExceeded { limit: 2, window_secs: 60, .. }
        ));
        limiter.check("b").unwrap();
    }

    #[test]
    fn test_window_slides() {
        let limiter = CompileRateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();
        limiter.check_at("a", start).unwrap();
        assert!(limiter.check_at("a", start + Duration::from_secs(5)).is_err());
        limiter
            .check_at("a", start + Duration::from_secs(10))
            .unwrap();
    }

    #[test]
    fn test_reset() {
        let limiter = CompileRateLimiter::new(1, Duration::from_secs(60));
        limiter.check("a").unwrap();
        limiter.reset("a");
        limiter.check("a").unwrap();
    }
}
