pub mod openai;

use nieuws_core::config::AiConfig;

use crate::client::{LlmError, LlmProvider};

/// Create the configured LLM provider.
pub fn create_provider(config: &AiConfig) -> Result<Box<dyn LlmProvider>, LlmError> {
    let api_key = config
        .api_key
        .as_ref()
        .ok_or_else(|| LlmError::NotConfigured("AI_API_KEY not set".into()))?;
    Ok(Box::new(openai::OpenAiProvider::new(
        api_key.clone(),
        config.model.clone(),
        config.base_url.clone(),
    )))
}
