//! Adaptive per-model rate limiter for hosted APIs.
//!
//! Epistemic foundation:
//! - K_i: OpenAI-compatible APIs report limits in `x-ratelimit-*` headers
//! - K_i: 429 responses require exponential backoff
//! - I^B: Exact limits unknowable until the first headers arrive

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest backoff after repeated 429s.
const MAX_BACKOFF_SECS: f64 = 60.0;

/// One quota window (requests or tokens) as last reported by the server.
#[derive(Debug, Default, Clone, Copy)]
struct QuotaWindow {
    remaining: Option<u64>,
    resets_at: Option<Instant>,
}

impl QuotaWindow {
    /// Time until this window allows another request.
    fn blocked_for(&self, now: Instant) -> Duration {
        match (self.remaining, self.resets_at) {
            (Some(0), Some(reset)) if reset > now => reset - now,
            _ => Duration::ZERO,
        }
    }

    fn update(&mut self, headers: &HeaderMap, remaining_key: &str, reset_key: &str, now: Instant) {
        if let Some(remaining) = header_number(headers, remaining_key) {
            self.remaining = Some(remaining as u64);
        }
        if let Some(secs) = header_number(headers, reset_key) {
            self.resets_at = Some(now + Duration::from_secs_f64(secs.max(0.0)));
        }
    }
}

fn header_number(headers: &HeaderMap, key: &str) -> Option<f64> {
    headers.get(key)?.to_str().ok()?.trim().trim_end_matches('s').parse().ok()
}

/// Rate limit state for a single model.
#[derive(Debug, Default)]
pub struct ModelLimitState {
    requests: QuotaWindow,
    tokens: QuotaWindow,
    /// Consecutive 429 responses
    pub consecutive_429s: u32,
    backoff_until: Option<Instant>,
}

impl ModelLimitState {
    /// Time to wait before the next request may be sent.
    pub fn wait_time(&self) -> Duration {
        let now = Instant::now();
        let backoff = match self.backoff_until {
            Some(until) if until > now => until - now,
            _ => Duration::ZERO,
        };
        backoff
            .max(self.requests.blocked_for(now))
            .max(self.tokens.blocked_for(now))
    }

    pub fn record_429(&mut self) {
        self.consecutive_429s += 1;
        let backoff_secs = 2f64.powi(self.consecutive_429s as i32).min(MAX_BACKOFF_SECS);
        self.backoff_until = Some(Instant::now() + Duration::from_secs_f64(backoff_secs));
        warn!(
            consecutive_429s = self.consecutive_429s,
            backoff_secs, "Rate limited (429), backing off"
        );
    }

    pub fn record_success(&mut self) {
        self.consecutive_429s = 0;
        self.backoff_until = None;
    }

    pub fn update_from_headers(&mut self, headers: &HeaderMap) {
        let now = Instant::now();
        self.requests.update(
            headers,
            "x-ratelimit-remaining-requests",
            "x-ratelimit-reset-requests",
            now,
        );
        self.tokens.update(
            headers,
            "x-ratelimit-remaining-tokens",
            "x-ratelimit-reset-tokens",
            now,
        );
    }
}

/// Tracks per-model limits and backs off on 429s.
#[derive(Debug, Default)]
pub struct RateLimiter {
    states: DashMap<String, ModelLimitState>,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep until the model's limits allow another request.
    ///
    /// Returns the duration waited.
    pub async fn wait_if_needed(&self, model: &str) -> Duration {
        let wait = self
            .states
            .get(model)
            .map(|state| state.wait_time())
            .unwrap_or(Duration::ZERO);

        if !wait.is_zero() {
            debug!(model, wait_ms = wait.as_millis() as u64, "Waiting for rate limit");
            self.total_wait_ms
                .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
        }
        wait
    }

    /// Record the outcome of one request.
    pub fn record_request(&self, model: &str, status: u16, headers: &HeaderMap) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut state = self.states.entry(model.to_string()).or_default();
        state.update_from_headers(headers);

        if status == 429 {
            self.total_429s.fetch_add(1, Ordering::Relaxed);
            state.record_429();
        } else if status < 400 {
            state.record_success();
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_429s: self.total_429s.load(Ordering::Relaxed),
            total_wait_secs: self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait_secs: f64,
}
