use std::sync::Arc;

use ai_agent::{
    LanguageModelClient, LanguageModelResponse, ModelNotConfigured, ModelOptions,
    OpenAiChatClient, OpenAiConfig,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    /// Placeholder used when no provider is configured; every call fails.
    #[serde(rename = "offline")]
    Offline,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Never route to a provider outside this machine.
    #[serde(default)]
    pub no_egress: bool,
    #[serde(default)]
    pub force_provider: Option<Provider>,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("requested provider is unavailable: {0:?}")]
    ProviderUnavailable(Provider),
}

/// Stands in for the model when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineModel;

#[async_trait]
impl LanguageModelClient for OfflineModel {
    async fn complete(
        &self,
        _prompt: &str,
        _options: &ModelOptions,
    ) -> Result<LanguageModelResponse> {
        Err(ModelNotConfigured.into())
    }
}

#[derive(Clone)]
pub struct LlmRouter {
    openai_client: Option<Arc<OpenAiChatClient>>,
    offline: Arc<OfflineModel>,
}

impl LlmRouter {
    /// Builds the router. A missing or empty API key is not an error; the
    /// OpenAI provider is simply reported unavailable.
    pub fn new(openai: Option<OpenAiConfig>) -> Result<Self> {
        let openai_client = match openai {
            Some(config) if !config.api_key.trim().is_empty() => {
                Some(Arc::new(OpenAiChatClient::new(config)?))
            }
            _ => None,
        };
        Ok(Self {
            openai_client,
            offline: Arc::new(OfflineModel),
        })
    }

    pub fn route(&self, policy: RoutingPolicy) -> Result<Arc<dyn LanguageModelClient>> {
        let provider = match policy.force_provider {
            Some(provider) => provider,
            None if policy.no_egress => Provider::Offline,
            None if self.openai_client.is_some() => Provider::OpenAi,
            None => {
                warn!(
                    target: "llm_router",
                    "no language model configured; queries will fail until OPENAI_API_KEY is set"
                );
                Provider::Offline
            }
        };

        match provider {
            Provider::OpenAi => {
                if policy.no_egress {
                    return Err(anyhow!(RouterError::ProviderUnavailable(Provider::OpenAi)));
                }
                let client = self
                    .openai_client
                    .clone()
                    .ok_or_else(|| anyhow!(RouterError::ProviderUnavailable(Provider::OpenAi)))?;
                Ok(client)
            }
            Provider::Offline => Ok(self.offline.clone()),
        }
    }

    pub fn is_provider_available(&self, provider: Provider) -> bool {
        match provider {
            Provider::OpenAi => self.openai_client.is_some(),
            Provider::Offline => true,
        }
    }

    /// Whether any provider that can actually answer is configured.
    pub fn is_configured(&self) -> bool {
        self.is_provider_available(Provider::OpenAi)
    }

    pub fn model_name(&self) -> Option<&str> {
        self.openai_client.as_deref().map(OpenAiChatClient::model)
    }
}
