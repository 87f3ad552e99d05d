//! Primary/fallback translation routing
//!
//! The active backend serves requests; a failed request transparently falls
//! over to the other backend for that one request. Three consecutive online
//! failures switch the router to the local backend until a periodic probe
//! shows the online endpoint has recovered.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::{BackendPref, DevicePref, TranslationConfig};
use crate::error::{EngineError, Result};
use crate::post_processor::clean_repetitions;
use crate::translation::local::LocalBackend;
use crate::translation::online::OnlineBackend;
use crate::translation::{BackendKind, TranslationJob, TranslationOutcome};

/// Online failures before the router switches to the local backend
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// How often to probe the online backend after falling back
pub const ONLINE_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Probe length in characters
const PROBE_CHARS: usize = 50;

pub struct TranslationRouter {
    online: Option<OnlineBackend>,
    local: Option<LocalBackend>,
    active: Option<BackendKind>,
    fallen_back: bool,
    last_online_retry: Option<Instant>,
}

impl TranslationRouter {
    pub fn new() -> Self {
        Self {
            online: None,
            local: None,
            active: None,
            fallen_back: false,
            last_online_retry: None,
        }
    }

    /// Initialize both backends; the preferred one becomes active if it
    /// loaded, otherwise the other. Fails only when neither is usable.
    pub fn load_model(
        &mut self,
        config: &TranslationConfig,
        device: DevicePref,
        models_dir: &Path,
    ) -> Result<()> {
        self.online = match OnlineBackend::new() {
            Ok(backend) => Some(backend),
            Err(e) => {
                tracing::warn!("Failed to initialize online backend: {}", e);
                None
            }
        };

        let mut local = LocalBackend::new();
        match local.load_model(config, device, models_dir) {
            Ok(()) => self.local = Some(local),
            Err(e) => {
                tracing::warn!("Failed to initialize local backend: {}", e);
                self.local = None;
            }
        }

        let local_loaded = self.local.as_ref().map(|l| l.is_loaded()).unwrap_or(false);

        self.active = match config.backend {
            BackendPref::Local if local_loaded => Some(BackendKind::Local),
            _ if self.online.is_some() => Some(BackendKind::Online),
            _ if local_loaded => {
                self.fallen_back = true;
                tracing::warn!("Online backend unavailable, starting with local");
                Some(BackendKind::Local)
            }
            _ => None,
        };

        match self.active {
            Some(active) => {
                tracing::info!("Active translation backend: {}", active);
                Ok(())
            }
            None => Err(EngineError::ModelLoad(
                "no translation backend could be loaded".to_string(),
            )),
        }
    }

    pub fn unload_model(&mut self) {
        self.online = None;
        if let Some(local) = self.local.as_mut() {
            local.unload_model();
        }
        self.local = None;
        self.active = None;
        self.fallen_back = false;
        tracing::info!("Translation router unloaded");
    }

    pub fn is_loaded(&self) -> bool {
        self.online.is_some() || self.local.is_some()
    }

    pub fn active_backend(&self) -> Option<BackendKind> {
        self.active
    }

    pub fn is_fallen_back(&self) -> bool {
        self.fallen_back
    }

    /// Translate one job. Never fails: on total failure the outcome carries
    /// an empty `translated_text` and the pipeline drops the message.
    pub fn translate(&mut self, job: &TranslationJob) -> TranslationOutcome {
        if job.text.trim().is_empty() {
            return self.empty_outcome(job);
        }

        if self.fallen_back && self.online.is_some() {
            self.maybe_retry_online(job);
        }

        match self.active {
            Some(BackendKind::Online) => match self.online_attempt(job) {
                Ok(outcome) => outcome,
                // Fall over to local for this one request
                Err(_) => self.try_local(job),
            },
            Some(BackendKind::Local) => {
                let outcome = self.try_local(job);
                if !outcome.translated_text.is_empty() {
                    return outcome;
                }
                // Fall over to online for this one request; backoff keeps
                // this from hammering a dead endpoint.
                self.online_attempt(job)
                    .unwrap_or_else(|_| self.empty_outcome(job))
            }
            None => self.empty_outcome(job),
        }
    }

    fn online_attempt(&mut self, job: &TranslationJob) -> Result<TranslationOutcome> {
        let result = match self.online.as_ref() {
            Some(online) if online.is_available() => {
                online.translate(&job.text, &job.source_lang, &job.target_lang)
            }
            _ => Err(EngineError::Translation(
                "online backend not available".to_string(),
            )),
        };

        let outcome = match result {
            Ok(translated) if !translated.trim().is_empty() => Ok(TranslationOutcome {
                source_text: job.text.clone(),
                translated_text: clean_repetitions(&translated),
                backend: Some(BackendKind::Online),
                entry_id: job.entry_id,
            }),
            Ok(_) => Err(EngineError::Translation(
                "empty translation result".to_string(),
            )),
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            tracing::warn!("Online translation failed: {}", e);
            let failures = self
                .online
                .as_ref()
                .map(|o| o.consecutive_failures())
                .unwrap_or(0);
            if failures >= MAX_CONSECUTIVE_FAILURES {
                self.switch_to_local();
            }
        }
        outcome
    }

    fn try_local(&mut self, job: &TranslationJob) -> TranslationOutcome {
        let Some(local) = self.local.as_ref().filter(|l| l.is_loaded()) else {
            return self.empty_outcome(job);
        };

        match local.translate(&job.text, &job.source_lang, &job.target_lang) {
            Ok(translated) if !translated.trim().is_empty() => TranslationOutcome {
                source_text: job.text.clone(),
                translated_text: clean_repetitions(&translated),
                backend: Some(BackendKind::Local),
                entry_id: job.entry_id,
            },
            Ok(_) => self.empty_outcome(job),
            Err(e) => {
                tracing::error!("Local translation failed: {}", e);
                self.empty_outcome(job)
            }
        }
    }

    fn switch_to_local(&mut self) {
        let local_loaded = self.local.as_ref().map(|l| l.is_loaded()).unwrap_or(false);
        if !local_loaded {
            tracing::error!("Cannot fall back to local backend (not loaded)");
            return;
        }
        if self.active == Some(BackendKind::Local) {
            return;
        }

        self.active = Some(BackendKind::Local);
        self.fallen_back = true;
        self.last_online_retry = Some(Instant::now());
        tracing::warn!(
            "Switched to local translation after {} online failures; retrying online every {:?}",
            self.online
                .as_ref()
                .map(|o| o.consecutive_failures())
                .unwrap_or(0),
            ONLINE_RETRY_INTERVAL
        );
    }

    fn switch_to_online(&mut self) {
        self.active = Some(BackendKind::Online);
        self.fallen_back = false;
        if let Some(online) = self.online.as_ref() {
            online.reset_failures();
        }
        tracing::info!("Switched back to online translation backend");
    }

    /// After falling back, probe the online backend at most once per
    /// `ONLINE_RETRY_INTERVAL`; a non-empty probe result switches back.
    fn maybe_retry_online(&mut self, job: &TranslationJob) {
        let now = Instant::now();
        if !self.should_probe(now) {
            return;
        }
        self.last_online_retry = Some(now);

        let Some(online) = self.online.as_ref() else {
            return;
        };
        online.reset_failures();

        let probe: String = job.text.chars().take(PROBE_CHARS).collect();
        tracing::info!("Probing online translation backend");

        match online.translate(&probe, &job.source_lang, &job.target_lang) {
            Ok(result) if !result.trim().is_empty() => self.switch_to_online(),
            Ok(_) => tracing::info!("Online probe returned empty result, staying on local"),
            Err(e) => tracing::info!("Online probe failed: {}. Staying on local.", e),
        }
    }

    fn should_probe(&self, now: Instant) -> bool {
        match self.last_online_retry {
            Some(last) => now.duration_since(last) >= ONLINE_RETRY_INTERVAL,
            None => true,
        }
    }

    fn empty_outcome(&self, job: &TranslationJob) -> TranslationOutcome {
        TranslationOutcome {
            source_text: job.text.clone(),
            translated_text: String::new(),
            backend: None,
            entry_id: job.entry_id,
        }
    }

    #[cfg(test)]
    fn for_tests(online: Option<OnlineBackend>, local: Option<LocalBackend>) -> Self {
        let active = if online.is_some() {
            Some(BackendKind::Online)
        } else if local.is_some() {
            Some(BackendKind::Local)
        } else {
            None
        };
        Self {
            online,
            local,
            active,
            fallen_back: false,
            last_online_retry: None,
        }
    }
}

impl Default for TranslationRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(text: &str) -> TranslationJob {
        TranslationJob {
            text: text.to_string(),
            source_lang: "en".to_string(),
            target_lang: "vi".to_string(),
            entry_id: Some(7),
        }
    }

    #[test]
    fn empty_text_short_circuits() {
        let mut router = TranslationRouter::new();
        let outcome = router.translate(&job("   "));
        assert!(outcome.translated_text.is_empty());
        assert!(outcome.backend.is_none());
        assert_eq!(outcome.entry_id, Some(7));
    }

    #[test]
    fn no_backends_yields_empty_outcome() {
        let mut router = TranslationRouter::for_tests(None, None);
        let outcome = router.translate(&job("hello"));
        assert!(outcome.translated_text.is_empty());
        assert!(outcome.backend.is_none());
    }

    #[test]
    fn online_backoff_falls_over_without_switching() {
        // Online is in a backoff window but has fewer than three failures:
        // the request falls over for this call only, the router stays online.
        let online = OnlineBackend::new().unwrap();
        online.force_failure();
        let mut router = TranslationRouter::for_tests(Some(online), None);

        let outcome = router.translate(&job("hello there"));
        assert!(outcome.translated_text.is_empty());
        assert_eq!(router.active_backend(), Some(BackendKind::Online));
        assert!(!router.is_fallen_back());
    }

    #[test]
    fn three_failures_attempt_permanent_switch() {
        let online = OnlineBackend::new().unwrap();
        online.force_failure();
        online.force_failure();
        online.force_failure();
        let mut router = TranslationRouter::for_tests(Some(online), None);

        let _ = router.translate(&job("hello there"));
        // Local never loaded, so the switch is refused and online stays
        // nominally active (every request keeps falling over to nothing).
        assert_eq!(router.active_backend(), Some(BackendKind::Online));

        // With an (unloaded) local backend present the switch is still
        // refused; only a loaded local model accepts the fallback role.
        let online = OnlineBackend::new().unwrap();
        online.force_failure();
        online.force_failure();
        online.force_failure();
        let mut router =
            TranslationRouter::for_tests(Some(online), Some(LocalBackend::new()));
        let _ = router.translate(&job("hello there"));
        assert_eq!(router.active_backend(), Some(BackendKind::Online));
        assert!(!router.is_fallen_back());
    }

    #[test]
    fn probe_interval_gating() {
        let mut router = TranslationRouter::new();
        let now = Instant::now();

        // Never probed: allowed
        assert!(router.should_probe(now));

        router.last_online_retry = Some(now);
        assert!(!router.should_probe(now + Duration::from_secs(59)));
        assert!(router.should_probe(now + ONLINE_RETRY_INTERVAL));
    }

    #[test]
    fn switch_to_online_resets_state() {
        let online = OnlineBackend::new().unwrap();
        online.force_failure();
        let mut router = TranslationRouter::for_tests(Some(online), None);
        router.fallen_back = true;
        router.active = Some(BackendKind::Local);

        router.switch_to_online();
        assert_eq!(router.active_backend(), Some(BackendKind::Online));
        assert!(!router.is_fallen_back());
        assert_eq!(
            router.online.as_ref().unwrap().consecutive_failures(),
            0
        );
    }
}
