//! Online translation backend
//!
//! Stateless HTTP client against a public translation endpoint. The endpoint
//! rate-limits aggressively, so requests flow through an LRU cache, a sliding
//! 60-second request window, and an exponential backoff that opens after
//! HTTP or transport failures.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::translation::{combine_requests, split_sentences};

const BASE_URL: &str = "https://translate.googleapis.com/translate_a/single";

/// Browser user agent to avoid basic blocking
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";

const CACHE_CAPACITY: usize = 500;
const MAX_REQUESTS_PER_MINUTE: usize = 30;
const RATE_WINDOW: Duration = Duration::from_secs(60);
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Sentence split / request batching limits
const MAX_SENTENCE_CHARS: usize = 200;
const MAX_REQUEST_CHARS: usize = 300;

type CacheKey = (String, String, String);

/// Insertion-ordered LRU over a HashMap; 500 entries keeps this cheap
struct LruCache {
    map: HashMap<CacheKey, String>,
    order: VecDeque<CacheKey>,
    capacity: usize,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<String> {
        let value = self.map.get(key).cloned()?;
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
            self.order.push_back(key.clone());
        }
        Some(value)
    }

    fn insert(&mut self, key: CacheKey, value: String) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        } else if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
            self.order.push_back(key);
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Sliding 60-second request window
struct RateWindow {
    timestamps: VecDeque<Instant>,
    capacity: usize,
}

impl RateWindow {
    fn new(capacity: usize) -> Self {
        Self {
            timestamps: VecDeque::new(),
            capacity,
        }
    }

    /// Try to admit a request at `now`. Returns how long to wait when the
    /// window is at capacity.
    fn try_acquire(&mut self, now: Instant) -> Option<Duration> {
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) >= RATE_WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }

        if self.timestamps.len() < self.capacity {
            self.timestamps.push_back(now);
            return None;
        }

        let oldest = *self.timestamps.front().expect("window at capacity");
        Some(RATE_WINDOW.saturating_sub(now.duration_since(oldest)))
    }
}

/// How a single HTTP request failed
enum RequestFailure {
    /// Rate limiting, blocking, server trouble, or a transport error:
    /// opens the exponential-backoff window
    Backoff(String),
    /// Any other HTTP error: the request is lost but the endpoint is fine
    Other(String),
}

/// Statuses that indicate endpoint distress rather than a bad request
fn is_backoff_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::FORBIDDEN
        || status.is_server_error()
}

/// Failure counting and exponential backoff
struct BackoffState {
    consecutive_failures: u32,
    current_backoff: Duration,
    backoff_until: Option<Instant>,
}

impl BackoffState {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            current_backoff: INITIAL_BACKOFF,
            backoff_until: None,
        }
    }

    fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        self.backoff_until = Some(now + self.current_backoff);
        self.current_backoff = (self.current_backoff * 2).min(MAX_BACKOFF);
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_backoff = INITIAL_BACKOFF;
        self.backoff_until = None;
    }

    fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_until.map(|until| now < until).unwrap_or(false)
    }
}

pub struct OnlineBackend {
    client: reqwest::blocking::Client,
    cache: Mutex<LruCache>,
    rate: Mutex<RateWindow>,
    backoff: Mutex<BackoffState>,
}

impl OnlineBackend {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        tracing::info!("Online translation backend initialized");
        Ok(Self {
            client,
            cache: Mutex::new(LruCache::new(CACHE_CAPACITY)),
            rate: Mutex::new(RateWindow::new(MAX_REQUESTS_PER_MINUTE)),
            backoff: Mutex::new(BackoffState::new()),
        })
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.lock().consecutive_failures
    }

    pub fn reset_failures(&self) {
        self.backoff.lock().record_success();
    }

    /// Available = not in a backoff window
    pub fn is_available(&self) -> bool {
        !self.backoff.lock().in_backoff(Instant::now())
    }

    /// Translate `text`. Raises immediately inside a backoff window; every
    /// HTTP, transport, or empty-result failure records one failure and
    /// widens the backoff.
    pub fn translate(&self, text: &str, source_lang: &str, target_lang: &str) -> Result<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(String::new());
        }

        if self.backoff.lock().in_backoff(Instant::now()) {
            return Err(EngineError::Translation(
                "online backend is backing off".to_string(),
            ));
        }

        let key = (
            source_lang.to_string(),
            target_lang.to_string(),
            trimmed.to_string(),
        );
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(hit);
        }

        let requests = combine_requests(
            &split_sentences(trimmed, MAX_SENTENCE_CHARS),
            MAX_REQUEST_CHARS,
        );

        let mut translated_parts = Vec::with_capacity(requests.len());
        for request in &requests {
            self.wait_for_slot();
            match self.request_one(request, source_lang, target_lang) {
                Ok(part) => translated_parts.push(part),
                Err(RequestFailure::Backoff(message)) => {
                    self.backoff.lock().record_failure(Instant::now());
                    return Err(EngineError::Translation(message));
                }
                // Other 4xx (e.g. a malformed query) fail this request but
                // say nothing about endpoint health
                Err(RequestFailure::Other(message)) => {
                    return Err(EngineError::Translation(message));
                }
            }
        }

        let translated = translated_parts.join(" ").trim().to_string();
        if translated.is_empty() {
            self.backoff.lock().record_failure(Instant::now());
            return Err(EngineError::Translation(
                "empty translation result".to_string(),
            ));
        }

        self.backoff.lock().record_success();
        self.cache.lock().insert(key, translated.clone());
        Ok(translated)
    }

    /// Block until the sliding window admits another request
    fn wait_for_slot(&self) {
        loop {
            let wait = self.rate.lock().try_acquire(Instant::now());
            match wait {
                None => return,
                Some(delay) => {
                    tracing::debug!("Rate limit reached, waiting {:?}", delay);
                    std::thread::sleep(delay);
                }
            }
        }
    }

    fn request_one(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> std::result::Result<String, RequestFailure> {
        let source = if source_lang == "auto" { "" } else { source_lang };

        let response = self
            .client
            .get(BASE_URL)
            .query(&[
                ("client", "gtx"),
                ("sl", source),
                ("tl", target_lang),
                ("dt", "t"),
                ("q", text),
            ])
            .send()
            .map_err(|e| RequestFailure::Backoff(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("HTTP error {}", status);
            return Err(if is_backoff_status(status) {
                RequestFailure::Backoff(message)
            } else {
                RequestFailure::Other(message)
            });
        }

        let data: serde_json::Value = response
            .json()
            .map_err(|e| RequestFailure::Backoff(e.to_string()))?;

        // Response shape: [[[translated, source, ...], ...], ...]
        let mut out = String::new();
        if let Some(parts) = data.get(0).and_then(|v| v.as_array()) {
            for part in parts {
                if let Some(piece) = part.get(0).and_then(|v| v.as_str()) {
                    out.push_str(piece);
                }
            }
        }
        Ok(out)
    }

    #[cfg(test)]
    fn backoff_snapshot(&self) -> (u32, Duration, Option<Instant>) {
        let state = self.backoff.lock();
        (
            state.consecutive_failures,
            state.current_backoff,
            state.backoff_until,
        )
    }

    #[cfg(test)]
    pub(crate) fn force_failure(&self) {
        self.backoff.lock().record_failure(Instant::now());
    }

    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = BackoffState::new();
        let now = Instant::now();

        // After k failures: min(60s, 2s * 2^k)
        let expected = [4u64, 8, 16, 32, 64, 128]
            .iter()
            .map(|&s| Duration::from_secs(s).min(MAX_BACKOFF))
            .collect::<Vec<_>>();

        for (k, want) in expected.iter().enumerate() {
            backoff.record_failure(now);
            assert_eq!(
                backoff.current_backoff, *want,
                "after {} failures",
                k + 1
            );
        }

        assert!(backoff.in_backoff(now));
        backoff.record_success();
        assert_eq!(backoff.consecutive_failures, 0);
        assert_eq!(backoff.current_backoff, INITIAL_BACKOFF);
        assert!(!backoff.in_backoff(now));
    }

    #[test]
    fn backoff_statuses_are_the_spec_classes() {
        use reqwest::StatusCode;

        assert!(is_backoff_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_backoff_status(StatusCode::FORBIDDEN));
        assert!(is_backoff_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_backoff_status(StatusCode::SERVICE_UNAVAILABLE));

        assert!(!is_backoff_status(StatusCode::BAD_REQUEST));
        assert!(!is_backoff_status(StatusCode::NOT_FOUND));
        assert!(!is_backoff_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn backoff_window_expires() {
        let mut backoff = BackoffState::new();
        let now = Instant::now();
        backoff.record_failure(now);

        assert!(backoff.in_backoff(now));
        assert!(backoff.in_backoff(now + Duration::from_millis(1999)));
        assert!(!backoff.in_backoff(now + Duration::from_secs(2)));
    }

    #[test]
    fn rate_window_admits_up_to_capacity() {
        let mut window = RateWindow::new(30);
        let now = Instant::now();

        for _ in 0..30 {
            assert!(window.try_acquire(now).is_none());
        }

        // 31st request in the same second must wait out the window
        let wait = window.try_acquire(now).expect("window full");
        assert!(wait <= RATE_WINDOW);
        assert!(wait >= RATE_WINDOW - Duration::from_millis(1));
    }

    #[test]
    fn rate_window_rolls_off() {
        let mut window = RateWindow::new(2);
        let start = Instant::now();

        assert!(window.try_acquire(start).is_none());
        assert!(window
            .try_acquire(start + Duration::from_secs(30))
            .is_none());
        assert!(window
            .try_acquire(start + Duration::from_secs(45))
            .is_some());
        // The first timestamp rolls off after 60s
        assert!(window
            .try_acquire(start + Duration::from_secs(61))
            .is_none());
    }

    #[test]
    fn lru_evicts_oldest() {
        let mut cache = LruCache::new(2);
        let key = |s: &str| (("en".to_string()), ("vi".to_string()), s.to_string());

        cache.insert(key("a"), "A".to_string());
        cache.insert(key("b"), "B".to_string());
        // Touch "a" so "b" becomes the eviction candidate
        assert_eq!(cache.get(&key("a")), Some("A".to_string()));

        cache.insert(key("c"), "C".to_string());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("b")).is_none());
        assert_eq!(cache.get(&key("a")), Some("A".to_string()));
        assert_eq!(cache.get(&key("c")), Some("C".to_string()));
    }

    #[test]
    fn lru_reinsert_updates_value() {
        let mut cache = LruCache::new(2);
        let key = ("en".to_string(), "vi".to_string(), "a".to_string());
        cache.insert(key.clone(), "old".to_string());
        cache.insert(key.clone(), "new".to_string());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key), Some("new".to_string()));
    }

    #[test]
    fn translate_raises_inside_backoff() {
        let backend = OnlineBackend::new().unwrap();
        backend.force_failure();
        let err = backend.translate("hello", "en", "vi").unwrap_err();
        assert!(matches!(err, EngineError::Translation(_)));
        // No cache entry was created for the failed request
        assert_eq!(backend.cache_len(), 0);
        let (failures, _, until) = backend.backoff_snapshot();
        assert_eq!(failures, 1);
        assert!(until.is_some());
    }
}
