//! OpenRouter adapter.
//!
//! OpenRouter speaks the OpenAI-compatible dialect, so this delegates the
//! wire work to [`OpenAiProvider`] and adds the attribution headers the
//! service uses for rankings.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::openai::OpenAiProvider;
use super::{
    ChunkStream, CompletionRequest, CompletionResponse, HealthProbe, LlmError, Provider,
};
use crate::auth::AuthProfile;

const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// OpenRouter provider for a fixed model.
pub struct OpenRouterProvider {
    inner: OpenAiProvider,
}

impl OpenRouterProvider {
    pub fn new(model: impl Into<String>, auth: Arc<AuthProfile>, context_window: u32) -> Self {
        Self::with_attribution(
            model,
            auth,
            context_window,
            "https://github.com/switchboard",
            "Switchboard",
        )
    }

    /// Override the attribution headers OpenRouter shows on its dashboard.
    pub fn with_attribution(
        model: impl Into<String>,
        auth: Arc<AuthProfile>,
        context_window: u32,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let inner =
            OpenAiProvider::with_base_url(OPENROUTER_BASE_URL, model, auth, context_window)
                .with_extra_headers(vec![
                    ("HTTP-Referer", referer.into()),
                    ("X-Title", title.into()),
                ]);
        Self { inner }
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, LlmError> {
        self.inner.complete(request, cancel).await
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, LlmError> {
        self.inner.stream(request, cancel).await
    }

    fn context_window(&self) -> u32 {
        self.inner.context_window()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn health_probe(&self) -> Option<&dyn HealthProbe> {
        self.inner.health_probe()
    }
}
