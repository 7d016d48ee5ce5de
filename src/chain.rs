//! Role-based provider chain with health-tracked failover.
//!
//! The chain owns an ordered list of entries, each pairing a provider with
//! a health tracker and an optional key profile. A request for a role walks
//! the eligible candidates in declaration order, failing over on retryable
//! errors, rotating keys on rate limits, and feeding the health trackers.
//! A background prober revives entries that have gone dead.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthProfile;
use crate::llm::{
    ChunkStream, CompletionRequest, CompletionResponse, LlmError, Provider, STREAM_CHANNEL_CAPACITY,
};
use crate::provider_health::{HealthConfig, HealthTracker};

/// Prober cadence when a chain has no entries to derive one from.
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────────────────
// Entries
// ─────────────────────────────────────────────────────────────────────────────

/// Purpose tag on a chain entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    /// Serves user-facing completions.
    Primary,
    /// Serves internal calls (summarization, classification).
    Internal,
    /// Tried after direct matches for the roles it covers.
    Fallback,
}

impl std::fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Internal => write!(f, "internal"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// One provider in the chain, with its routing role, health state, and
/// optional rotating credentials.
pub struct ChainEntry {
    name: String,
    provider: Arc<dyn Provider>,
    role: ProviderRole,
    /// Roles this fallback covers. Empty = all roles.
    fallback_for: Vec<ProviderRole>,
    auth: Option<Arc<AuthProfile>>,
    health: HealthTracker,
}

impl ChainEntry {
    /// Create an entry with default health configuration.
    pub fn new(name: impl Into<String>, provider: Arc<dyn Provider>, role: ProviderRole) -> Self {
        let name = name.into();
        let health = HealthTracker::new(name.clone(), HealthConfig::default());
        Self {
            name,
            provider,
            role,
            fallback_for: Vec::new(),
            auth: None,
            health,
        }
    }

    /// Attach a rotating key profile.
    pub fn with_auth(mut self, auth: Arc<AuthProfile>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Replace the health configuration.
    pub fn with_health(mut self, config: HealthConfig) -> Self {
        self.health = HealthTracker::new(self.name.clone(), config);
        self
    }

    /// Replace the whole health tracker (injected clocks, observers).
    pub fn with_health_tracker(mut self, health: HealthTracker) -> Self {
        self.health = health;
        self
    }

    /// Restrict which roles this fallback entry covers.
    pub fn fallback_for(mut self, roles: Vec<ProviderRole>) -> Self {
        self.fallback_for = roles;
        self
    }

    /// Entry name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entry's health tracker.
    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// The entry's key profile, if any.
    pub fn auth(&self) -> Option<&Arc<AuthProfile>> {
        self.auth.as_ref()
    }

    fn covers(&self, role: ProviderRole) -> bool {
        self.fallback_for.is_empty() || self.fallback_for.contains(&role)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chain
// ─────────────────────────────────────────────────────────────────────────────

struct Prober {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// The single logical endpoint over a pool of providers.
///
/// Entries are fixed after construction, so request paths iterate them
/// without any chain-level lock; only the per-entry trackers and the
/// prober handle are mutable.
pub struct ProviderChain {
    entries: Vec<Arc<ChainEntry>>,
    prober: Mutex<Option<Prober>>,
}

impl ProviderChain {
    /// Build a chain from entries in declaration order.
    pub fn new(entries: Vec<ChainEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(Arc::new).collect(),
            prober: Mutex::new(None),
        }
    }

    /// Candidates for a role: direct matches in declaration order, then
    /// fallback entries covering the role, also in declaration order.
    fn candidates(&self, role: ProviderRole) -> Vec<Arc<ChainEntry>> {
        let mut selected: Vec<Arc<ChainEntry>> = self
            .entries
            .iter()
            .filter(|e| e.role == role)
            .cloned()
            .collect();
        if role != ProviderRole::Fallback {
            selected.extend(
                self.entries
                    .iter()
                    .filter(|e| e.role == ProviderRole::Fallback && e.covers(role))
                    .cloned(),
            );
        }
        selected
    }

    /// Full-response completion with failover.
    pub async fn complete(
        &self,
        role: ProviderRole,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        let candidates = self.candidates(role);
        if candidates.is_empty() {
            return Err(LlmError::NoProvider { role });
        }

        let mut last: Option<LlmError> = None;
        let mut attempted = false;
        for entry in &candidates {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            if !entry.health.is_available() {
                tracing::debug!(entry = %entry.name, "Skipping unavailable provider");
                continue;
            }
            attempted = true;
            tracing::debug!(
                entry = %entry.name,
                model = entry.provider.model_name(),
                "Trying provider"
            );
            match entry.provider.complete(request, cancel).await {
                Ok(response) => {
                    entry.health.record_success();
                    return Ok(response);
                }
                Err(err) => match Self::on_attempt_error(entry, err) {
                    AttemptOutcome::Terminal(err) => return Err(err),
                    AttemptOutcome::TryNext(err) => last = Some(err),
                },
            }
        }

        Err(Self::exhausted(role, attempted, last))
    }

    /// Streaming completion with failover on the initial handshake.
    ///
    /// The first provider that accepts the connection wins; its success is
    /// recorded eagerly. Mid-stream error chunks are forwarded to the
    /// caller and degrade that provider's health, but the chain never
    /// fails over mid-stream, which would break chunk ordering.
    pub async fn stream(
        &self,
        role: ProviderRole,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        let candidates = self.candidates(role);
        if candidates.is_empty() {
            return Err(LlmError::NoProvider { role });
        }

        let mut last: Option<LlmError> = None;
        let mut attempted = false;
        for entry in &candidates {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            if !entry.health.is_available() {
                tracing::debug!(entry = %entry.name, "Skipping unavailable provider");
                continue;
            }
            attempted = true;
            match entry.provider.stream(request, cancel).await {
                Ok(upstream) => {
                    entry.health.record_success();
                    return Ok(Self::watch_stream(entry.clone(), upstream, cancel.clone()));
                }
                Err(err) => match Self::on_attempt_error(entry, err) {
                    AttemptOutcome::Terminal(err) => return Err(err),
                    AttemptOutcome::TryNext(err) => last = Some(err),
                },
            }
        }

        Err(Self::exhausted(role, attempted, last))
    }

    /// Direct access to the first available provider for a role.
    pub fn get_provider(&self, role: ProviderRole) -> Result<Arc<dyn Provider>, LlmError> {
        let candidates = self.candidates(role);
        if candidates.is_empty() {
            return Err(LlmError::NoProvider { role });
        }
        candidates
            .iter()
            .find(|e| e.health.is_available())
            .map(|e| e.provider.clone())
            .ok_or_else(|| LlmError::all_providers("all candidates unavailable", None))
    }

    /// Classify one failed attempt. Cancellation and non-retryable errors
    /// terminate failover without touching health; rate limits rotate the
    /// entry's key before the failure is recorded so the next attempt sees
    /// the fresh key.
    fn on_attempt_error(entry: &ChainEntry, err: LlmError) -> AttemptOutcome {
        if err.is_cancelled() {
            return AttemptOutcome::Terminal(LlmError::Cancelled);
        }
        if !err.is_retryable() {
            return AttemptOutcome::Terminal(err);
        }
        if err.is_rate_limit() {
            if let Some(auth) = &entry.auth {
                if auth.rotate() {
                    tracing::info!(entry = %entry.name, "Rotated API key after rate limit");
                }
            }
        }
        entry.health.record_failure();
        tracing::warn!(entry = %entry.name, error = %err, "Provider attempt failed, trying next");
        AttemptOutcome::TryNext(err)
    }

    fn exhausted(role: ProviderRole, attempted: bool, last: Option<LlmError>) -> LlmError {
        if attempted {
            LlmError::all_providers(format!("every candidate for role '{role}' failed"), last)
        } else {
            LlmError::all_providers("all candidates unavailable", None)
        }
    }

    /// Forward chunks from the chosen provider, recording a failure when a
    /// mid-stream error chunk passes through. Closes promptly on
    /// cancellation or consumer abandonment; the producing adapter selects
    /// on its own cancellation, so abandonment is safe.
    fn watch_stream(
        entry: Arc<ChainEntry>,
        mut upstream: ChunkStream,
        cancel: CancellationToken,
    ) -> ChunkStream {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = upstream.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                if let Some(err) = &chunk.error {
                    if !err.is_cancelled() {
                        tracing::warn!(
                            entry = %entry.name,
                            error = %err,
                            "Mid-stream failure"
                        );
                        entry.health.record_failure();
                    }
                }
                let terminal = chunk.is_terminal();
                if tx.send(chunk).await.is_err() || terminal {
                    break;
                }
            }
        });
        rx
    }

    /// Start the background prober. Idempotent: a second call while the
    /// prober is running does nothing.
    pub fn start(&self, deadline: &CancellationToken) {
        let mut guard = self.prober.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let cancel = deadline.child_token();
        let entries = self.entries.clone();
        let interval = entries
            .iter()
            .map(|e| e.health.check_interval())
            .min()
            .unwrap_or(DEFAULT_PROBE_INTERVAL);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            probe_loop(entries, interval, task_cancel).await;
        });
        *guard = Some(Prober { cancel, handle });
        tracing::debug!(interval_secs = interval.as_secs_f64(), "Health prober started");
    }

    /// Stop the background prober. Idempotent.
    pub fn stop(&self) {
        let mut guard = self.prober.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prober) = guard.take() {
            prober.cancel.cancel();
            drop(prober.handle);
            tracing::debug!("Health prober stopped");
        }
    }
}

impl Drop for ProviderChain {
    fn drop(&mut self) {
        self.stop();
    }
}

enum AttemptOutcome {
    /// Surface this error now; no further candidates.
    Terminal(LlmError),
    /// Health recorded; continue down the chain carrying this as the last
    /// cause.
    TryNext(LlmError),
}

/// Single cooperative prober task: every `interval`, exercise the probe of
/// each entry that needs one, reviving it on success.
async fn probe_loop(
    entries: Vec<Arc<ChainEntry>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for entry in &entries {
            if cancel.is_cancelled() {
                return;
            }
            if !entry.health.needs_probe() {
                continue;
            }
            let Some(probe) = entry.provider.health_probe() else {
                continue;
            };
            match probe.check(&cancel).await {
                Ok(()) => {
                    tracing::info!(entry = %entry.name, "Probe succeeded, reviving provider");
                    entry.health.record_success();
                }
                Err(err) if err.is_cancelled() => return,
                Err(err) if err.is_retryable() => {
                    tracing::debug!(entry = %entry.name, error = %err, "Probe failed");
                    entry.health.record_failure();
                }
                Err(err) => {
                    // Terminal probe outcomes carry no liveness signal.
                    tracing::debug!(entry = %entry.name, error = %err, "Probe error ignored");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::llm::{FinishReason, HealthProbe, StreamChunk};
    use crate::provider_health::HealthState;

    /// Provider scripted with a queue of results; repeats the last
    /// behavior ("ok") once the script runs out.
    struct StubProvider {
        model: String,
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        calls: AtomicUsize,
        probe_ok: bool,
    }

    impl StubProvider {
        fn new(model: &str, script: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                model: model.to_string(),
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicUsize::new(0),
                probe_ok: false,
            })
        }

        fn with_probe(model: &str, script: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                model: model.to_string(),
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicUsize::new(0),
                probe_ok: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok("ok".to_string()))
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn complete(
            &self,
            _request: &CompletionRequest,
            _cancel: &CancellationToken,
        ) -> Result<CompletionResponse, LlmError> {
            self.next().map(|content| CompletionResponse {
                content: Some(content),
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Stop,
                usage: None,
            })
        }

        async fn stream(
            &self,
            _request: &CompletionRequest,
            _cancel: &CancellationToken,
        ) -> Result<ChunkStream, LlmError> {
            let content = self.next()?;
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = tx.send(StreamChunk::content(content)).await;
                let _ = tx.send(StreamChunk::finished(FinishReason::Stop, None)).await;
            });
            Ok(rx)
        }

        fn context_window(&self) -> u32 {
            8192
        }

        fn model_name(&self) -> &str {
            &self.model
        }

        fn health_probe(&self) -> Option<&dyn HealthProbe> {
            self.probe_ok.then_some(self as &dyn HealthProbe)
        }
    }

    #[async_trait]
    impl HealthProbe for StubProvider {
        async fn check(&self, _cancel: &CancellationToken) -> Result<(), LlmError> {
            Ok(())
        }
    }

    fn down() -> LlmError {
        LlmError::provider_down(503, "unavailable")
    }

    fn chain_of(entries: Vec<ChainEntry>) -> ProviderChain {
        ProviderChain::new(entries)
    }

    fn content(response: &CompletionResponse) -> &str {
        response.content.as_deref().unwrap_or_default()
    }

    #[tokio::test]
    async fn simple_failover() {
        let p1 = StubProvider::new("m1", vec![Err(down())]);
        let p2 = StubProvider::new("m2", vec![Ok("ok".into())]);
        let chain = chain_of(vec![
            ChainEntry::new("p1", p1.clone(), ProviderRole::Primary),
            ChainEntry::new("p2", p2.clone(), ProviderRole::Primary),
        ]);

        let response = chain
            .complete(
                ProviderRole::Primary,
                &CompletionRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(content(&response), "ok");
        assert_eq!(chain.entries[0].health.state(), HealthState::Cooldown);
        assert_eq!(chain.entries[0].health.consecutive_failures(), 1);
        assert_eq!(chain.entries[1].health.state(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn non_retryable_stops_failover() {
        let p1 = StubProvider::new("m1", vec![Err(LlmError::context_length("too long"))]);
        let p2 = StubProvider::new("m2", vec![Ok("ok".into())]);
        let chain = chain_of(vec![
            ChainEntry::new("p1", p1.clone(), ProviderRole::Primary),
            ChainEntry::new("p2", p2.clone(), ProviderRole::Primary),
        ]);

        let err = chain
            .complete(
                ProviderRole::Primary,
                &CompletionRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::ContextLength { .. }));
        assert_eq!(p2.calls(), 0);
        // A context overflow says nothing about provider health.
        assert_eq!(chain.entries[0].health.state(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn all_candidates_exhausted() {
        let p1 = StubProvider::new("m1", vec![Err(LlmError::rate_limit("slow", None))]);
        let p2 = StubProvider::new("m2", vec![Err(down())]);
        let chain = chain_of(vec![
            ChainEntry::new("p1", p1, ProviderRole::Primary),
            ChainEntry::new("p2", p2, ProviderRole::Primary),
        ]);

        let err = chain
            .complete(
                ProviderRole::Primary,
                &CompletionRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        let LlmError::AllProviders { source, .. } = err else {
            panic!("expected AllProviders, got {err}");
        };
        assert!(matches!(
            source.as_deref(),
            Some(LlmError::ProviderDown { .. })
        ));
        assert_eq!(chain.entries[0].health.state(), HealthState::Cooldown);
        assert_eq!(chain.entries[1].health.state(), HealthState::Cooldown);
    }

    #[tokio::test]
    async fn rate_limit_rotates_key_before_failure_accounting() {
        let provider = StubProvider::new(
            "m1",
            vec![Err(LlmError::rate_limit("slow", None)), Ok("ok".into())],
        );
        let auth = Arc::new(AuthProfile::new(vec!["k1".into(), "k2".into()]).unwrap());
        let chain = chain_of(vec![ChainEntry::new(
            "p1",
            provider,
            ProviderRole::Primary,
        )
        .with_auth(auth.clone())]);

        // First call eats the rate limit and rotates.
        let err = chain
            .complete(
                ProviderRole::Primary,
                &CompletionRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::AllProviders { .. }));
        assert_eq!(auth.current(), "k2");
    }

    #[tokio::test]
    async fn selection_order_is_direct_then_fallbacks() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        struct Recording {
            tag: &'static str,
            order: Arc<Mutex<Vec<&'static str>>>,
        }

        #[async_trait]
        impl Provider for Recording {
            async fn complete(
                &self,
                _request: &CompletionRequest,
                _cancel: &CancellationToken,
            ) -> Result<CompletionResponse, LlmError> {
                self.order.lock().unwrap().push(self.tag);
                Err(LlmError::provider_down(503, "down"))
            }

            async fn stream(
                &self,
                _request: &CompletionRequest,
                _cancel: &CancellationToken,
            ) -> Result<ChunkStream, LlmError> {
                Err(LlmError::provider_down(503, "down"))
            }

            fn context_window(&self) -> u32 {
                8192
            }

            fn model_name(&self) -> &str {
                self.tag
            }
        }

        let build_chain = || {
            let entry = |tag, role| {
                ChainEntry::new(
                    tag,
                    Arc::new(Recording {
                        tag,
                        order: order.clone(),
                    }),
                    role,
                )
            };
            chain_of(vec![
                entry("fb-all", ProviderRole::Fallback),
                entry("primary-1", ProviderRole::Primary),
                entry("internal-1", ProviderRole::Internal),
                entry("fb-internal", ProviderRole::Fallback)
                    .fallback_for(vec![ProviderRole::Internal]),
                entry("primary-2", ProviderRole::Primary),
            ])
        };

        let _ = build_chain()
            .complete(
                ProviderRole::Primary,
                &CompletionRequest::default(),
                &CancellationToken::new(),
            )
            .await;

        // Direct primaries in declaration order, then the unrestricted
        // fallback; the internal-only fallback is never tried.
        assert_eq!(*order.lock().unwrap(), vec!["primary-1", "primary-2", "fb-all"]);

        order.lock().unwrap().clear();
        let _ = build_chain()
            .complete(
                ProviderRole::Internal,
                &CompletionRequest::default(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(
            *order.lock().unwrap(),
            vec!["internal-1", "fb-all", "fb-internal"]
        );
    }

    #[tokio::test]
    async fn unknown_role_reports_no_provider() {
        let chain = chain_of(vec![ChainEntry::new(
            "p1",
            StubProvider::new("m1", vec![]),
            ProviderRole::Primary,
        )]);
        let err = chain
            .complete(
                ProviderRole::Internal,
                &CompletionRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LlmError::NoProvider {
                role: ProviderRole::Internal
            }
        ));
    }

    #[tokio::test]
    async fn unavailable_candidates_are_skipped_without_attempts() {
        let p1 = StubProvider::new("m1", vec![]);
        let entry = ChainEntry::new("p1", p1.clone(), ProviderRole::Primary).with_health(
            HealthConfig {
                max_failures: 1,
                ..HealthConfig::default()
            },
        );
        entry.health.record_failure(); // straight to dead
        let chain = chain_of(vec![entry]);

        let err = chain
            .complete(
                ProviderRole::Primary,
                &CompletionRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::AllProviders { source: None, .. }));
        assert_eq!(p1.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_surfaces_before_any_attempt() {
        let p1 = StubProvider::new("m1", vec![]);
        let chain = chain_of(vec![ChainEntry::new(
            "p1",
            p1.clone(),
            ProviderRole::Primary,
        )]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = chain
            .complete(ProviderRole::Primary, &CompletionRequest::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
        assert_eq!(p1.calls(), 0);
        assert_eq!(chain.entries[0].health.state(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn cancellation_during_a_call_never_degrades_health() {
        let p1 = StubProvider::new("m1", vec![Err(LlmError::Cancelled)]);
        let p2 = StubProvider::new("m2", vec![]);
        let chain = chain_of(vec![
            ChainEntry::new("p1", p1, ProviderRole::Primary),
            ChainEntry::new("p2", p2.clone(), ProviderRole::Primary),
        ]);

        let err = chain
            .complete(
                ProviderRole::Primary,
                &CompletionRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::Cancelled));
        assert_eq!(p2.calls(), 0);
        assert_eq!(chain.entries[0].health.state(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn get_provider_returns_first_available_candidate() {
        let p1 = StubProvider::new("m1", vec![]);
        let p2 = StubProvider::new("m2", vec![]);
        let dead = ChainEntry::new("p1", p1, ProviderRole::Primary).with_health(HealthConfig {
            max_failures: 1,
            ..HealthConfig::default()
        });
        dead.health.record_failure();
        let chain = chain_of(vec![dead, ChainEntry::new("p2", p2, ProviderRole::Primary)]);

        let provider = chain.get_provider(ProviderRole::Primary).unwrap();
        assert_eq!(provider.model_name(), "m2");
        assert!(matches!(
            chain.get_provider(ProviderRole::Internal),
            Err(LlmError::NoProvider { .. })
        ));
    }

    #[tokio::test]
    async fn stream_failover_and_eager_success() {
        let p1 = StubProvider::new("m1", vec![Err(down())]);
        let p2 = StubProvider::new("m2", vec![Ok("hello".into())]);
        let chain = chain_of(vec![
            ChainEntry::new("p1", p1, ProviderRole::Primary),
            ChainEntry::new("p2", p2, ProviderRole::Primary),
        ]);

        let mut stream = chain
            .stream(
                ProviderRole::Primary,
                &CompletionRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Success recorded on handshake, before the stream is drained.
        assert_eq!(chain.entries[1].health.state(), HealthState::Healthy);
        assert_eq!(chain.entries[0].health.state(), HealthState::Cooldown);

        let first = stream.recv().await.unwrap();
        assert_eq!(first.content_delta.as_deref(), Some("hello"));
        let second = stream.recv().await.unwrap();
        assert_eq!(second.finish_reason, Some(FinishReason::Stop));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn mid_stream_error_degrades_health_without_failover() {
        struct MidStreamError;

        #[async_trait]
        impl Provider for MidStreamError {
            async fn complete(
                &self,
                _request: &CompletionRequest,
                _cancel: &CancellationToken,
            ) -> Result<CompletionResponse, LlmError> {
                unreachable!("streaming test")
            }

            async fn stream(
                &self,
                _request: &CompletionRequest,
                _cancel: &CancellationToken,
            ) -> Result<ChunkStream, LlmError> {
                let (tx, rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    let _ = tx.send(StreamChunk::content("partial")).await;
                    let _ = tx
                        .send(StreamChunk::error(LlmError::network("connection reset")))
                        .await;
                });
                Ok(rx)
            }

            fn context_window(&self) -> u32 {
                8192
            }

            fn model_name(&self) -> &str {
                "mid-stream"
            }
        }

        let chain = chain_of(vec![
            ChainEntry::new("p1", Arc::new(MidStreamError), ProviderRole::Primary),
            ChainEntry::new(
                "p2",
                StubProvider::new("m2", vec![]),
                ProviderRole::Primary,
            ),
        ]);

        let mut stream = chain
            .stream(
                ProviderRole::Primary,
                &CompletionRequest::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let first = stream.recv().await.unwrap();
        assert_eq!(first.content_delta.as_deref(), Some("partial"));
        let second = stream.recv().await.unwrap();
        assert!(second.error.is_some());
        // Error chunk forwarded, stream closed, no failover to p2.
        assert!(stream.recv().await.is_none());
        assert_eq!(chain.entries[0].health.state(), HealthState::Cooldown);
    }

    #[tokio::test(start_paused = true)]
    async fn prober_revives_dead_provider() {
        let provider = StubProvider::with_probe("m1", vec![Err(down()), Err(down())]);
        let entry = ChainEntry::new("p1", provider, ProviderRole::Primary).with_health(
            HealthConfig {
                // Nanosecond cooldowns keep the entry available for the
                // second failure; the paused tokio clock does not drive the
                // tracker's system clock.
                initial_backoff: Duration::from_nanos(1),
                max_failures: 2,
                check_interval: Duration::from_millis(50),
                ..HealthConfig::default()
            },
        );
        let chain = chain_of(vec![entry]);
        let request = CompletionRequest::default();
        let cancel = CancellationToken::new();

        // Two failures drive the entry dead.
        for _ in 0..2 {
            let _ = chain
                .complete(ProviderRole::Primary, &request, &cancel)
                .await;
        }
        assert_eq!(chain.entries[0].health.state(), HealthState::Dead);

        chain.start(&cancel);
        chain.start(&cancel); // idempotent

        tokio::time::sleep(Duration::from_millis(200)).await;

        let response = chain
            .complete(ProviderRole::Primary, &request, &cancel)
            .await
            .unwrap();
        assert_eq!(content(&response), "ok");

        chain.stop();
        chain.stop(); // idempotent
    }
}
