//! Chat-completions client over the provider configured on an agent's model
//! row. All supported providers speak the OpenAI-compatible wire shape.

use nofx_utilities::SecretUrl;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use crate::{errors::AiError, store::AiModelConfig};

#[derive(Clone)]
pub struct AiClient {
	client: reqwest::Client,
	endpoint: String,
	api_key: String,
	model: String,
}

/// Default endpoint and model per provider tag. Custom endpoints on the model
/// row override these.
fn provider_defaults(provider: &str) -> (&'static str, &'static str) {
	match provider {
		"deepseek" => ("https://api.deepseek.com/v1/chat/completions", "deepseek-chat"),
		"openai" => ("https://api.openai.com/v1/chat/completions", "gpt-4o"),
		"qwen" => (
			"https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions",
			"qwen-max",
		),
		"kimi" => ("https://api.moonshot.cn/v1/chat/completions", "moonshot-v1-8k"),
		_ => ("https://api.deepseek.com/v1/chat/completions", "deepseek-chat"),
	}
}

#[derive(Serialize)]
struct ChatMessage<'a> {
	role: &'a str,
	content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
	choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
	message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
	content: String,
}

impl AiClient {
	pub fn from_model_config(config: &AiModelConfig) -> Self {
		let (default_endpoint, default_model) = provider_defaults(&config.provider);
		let endpoint = if config.custom_api_url.is_empty() {
			default_endpoint.to_string()
		} else {
			let base = config.custom_api_url.trim_end_matches('/');
			if base.ends_with("/chat/completions") {
				base.to_string()
			} else {
				format!("{base}/chat/completions")
			}
		};
		let model = if config.custom_model_name.is_empty() {
			default_model.to_string()
		} else {
			config.custom_model_name.clone()
		};

		Self {
			client: reqwest::Client::new(),
			endpoint,
			api_key: config.api_key.clone(),
			model,
		}
	}

	pub fn model(&self) -> &str {
		&self.model
	}

	/// One provider call with the cycle's deadline. A transient failure is
	/// retried once inside the same cycle window; anything else surfaces.
	pub async fn chat(
		&self,
		system_prompt: &str,
		user_prompt: &str,
		timeout: Duration,
	) -> Result<String, AiError> {
		match self.chat_once(system_prompt, user_prompt, timeout).await {
			Ok(content) => Ok(content),
			Err(AiError::Provider(first_error)) => {
				warn!(
					endpoint = %SecretUrl::from(self.endpoint.as_str()),
					error = %first_error,
					"Provider call failed, retrying once"
				);
				self.chat_once(system_prompt, user_prompt, timeout).await
			},
			Err(error) => Err(error),
		}
	}

	async fn chat_once(
		&self,
		system_prompt: &str,
		user_prompt: &str,
		timeout: Duration,
	) -> Result<String, AiError> {
		let body = json!({
			"model": self.model,
			"messages": [
				ChatMessage { role: "system", content: system_prompt },
				ChatMessage { role: "user", content: user_prompt },
			],
			"temperature": 0.2,
			"stream": false,
		});

		let request = self
			.client
			.post(&self.endpoint)
			.bearer_auth(&self.api_key)
			.json(&body)
			.timeout(timeout);

		let response = match request.send().await {
			Ok(response) => response,
			Err(error) if error.is_timeout() =>
				return Err(AiError::Timeout(timeout.as_secs())),
			Err(error) => return Err(AiError::Provider(error.to_string())),
		};

		let status = response.status();
		let text = response
			.text()
			.await
			.map_err(|e| AiError::Provider(e.to_string()))?;
		if !status.is_success() {
			return Err(AiError::Provider(format!("{status}: {text}")));
		}

		let parsed: ChatResponse =
			serde_json::from_str(&text).map_err(|e| AiError::Provider(e.to_string()))?;
		parsed
			.choices
			.into_iter()
			.next()
			.map(|c| c.message.content)
			.ok_or_else(|| AiError::Provider("response has no choices".to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(provider: &str, url: &str, model: &str) -> AiModelConfig {
		AiModelConfig {
			id: 1,
			model_id: provider.to_string(),
			user_id: "u".to_string(),
			name: provider.to_string(),
			provider: provider.to_string(),
			enabled: true,
			api_key: "sk-test".to_string(),
			custom_api_url: url.to_string(),
			custom_model_name: model.to_string(),
		}
	}

	#[test]
	fn default_endpoints_per_provider() {
		let client = AiClient::from_model_config(&config("deepseek", "", ""));
		assert_eq!(client.endpoint, "https://api.deepseek.com/v1/chat/completions");
		assert_eq!(client.model(), "deepseek-chat");
	}

	#[test]
	fn custom_endpoint_and_model() {
		let client =
			AiClient::from_model_config(&config("openai", "http://localhost:11434/v1", "llama3"));
		assert_eq!(client.endpoint, "http://localhost:11434/v1/chat/completions");
		assert_eq!(client.model(), "llama3");

		// Full endpoint is not doubled
		let full = AiClient::from_model_config(&config(
			"openai",
			"http://localhost:11434/v1/chat/completions",
			"llama3",
		));
		assert_eq!(full.endpoint, "http://localhost:11434/v1/chat/completions");
	}
}
