use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    /// Ask the provider to constrain its output to a single JSON object.
    #[serde(default)]
    pub json_output: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: Some(1024),
            system_prompt: None,
            json_output: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguageModelUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageModelResponse {
    pub text: String,
    pub usage: LanguageModelUsage,
}

impl LanguageModelResponse {
    pub fn new(text: String) -> Self {
        Self {
            text,
            usage: LanguageModelUsage::default(),
        }
    }
}

/// Returned by clients that exist only as placeholders for a missing
/// provider configuration.
#[derive(Debug, Clone, Copy, Error)]
#[error("the language model is not configured")]
pub struct ModelNotConfigured;

#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    async fn complete(&self, prompt: &str, options: &ModelOptions)
        -> Result<LanguageModelResponse>;
}
