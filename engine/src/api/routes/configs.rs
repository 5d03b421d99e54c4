//! Model and exchange configuration. Sensitive fields arrive either inline
//! (trusted channels) or as an RSA-wrapped payload bound to the caller, which
//! is unwrapped here before the store encrypts it at rest.

use axum::{
	extract::{Path, State},
	Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
	api::{ApiError, AppState, AuthUser},
	errors::CryptoError,
	store::{AiModelConfig, ExchangeConfig},
	vault::SensitivePayload,
};

fn crypto_error(error: CryptoError) -> ApiError {
	match error {
		CryptoError::AadMismatch => ApiError::forbidden("decryption failed"),
		CryptoError::StaleTimestamp =>
			ApiError::bad_request("decryption failed (check the client clock)"),
		CryptoError::DecryptionFailed => ApiError::bad_request("decryption failed"),
	}
}

pub async fn list_models(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
	let mut models = state.store.get_ai_models(&user_id)?;
	// Secrets never leave the process; report presence only
	for model in &mut models {
		model.api_key = if model.api_key.is_empty() { String::new() } else { "***".to_string() };
	}
	Ok(Json(json!(models)))
}

#[derive(Deserialize)]
pub struct ModelUpdateRequest {
	#[serde(flatten)]
	pub model: AiModelConfig,
	/// Client-side-encrypted sensitive fields, when the browser sealed them.
	#[serde(default)]
	pub encrypted_payload: Option<SensitivePayload>,
}

pub async fn update_model(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Json(mut request): Json<ModelUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	if let Some(payload) = &request.encrypted_payload {
		let plaintext = state
			.vault
			.decrypt_sensitive_data(payload, &user_id)
			.map_err(crypto_error)?;
		let sensitive: serde_json::Value = serde_json::from_str(&plaintext)
			.map_err(|_| ApiError::bad_request("sensitive payload is not JSON"))?;
		if let Some(api_key) = sensitive["api_key"].as_str() {
			request.model.api_key = api_key.to_string();
		}
	}
	let saved = state
		.store
		.update_ai_model(&user_id, &request.model)
		.map_err(|e| ApiError::bad_request(e.to_string()))?;
	Ok(Json(json!({ "id": saved.id, "model_id": saved.model_id, "enabled": saved.enabled })))
}

pub async fn list_exchanges(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
	let mut exchanges = state.store.get_exchanges(&user_id)?;
	for exchange in &mut exchanges {
		let mask = |value: &mut String| {
			if !value.is_empty() {
				*value = "***".to_string();
			}
		};
		mask(&mut exchange.api_key);
		mask(&mut exchange.secret_key);
		mask(&mut exchange.aster_private_key);
		mask(&mut exchange.lighter_api_private_key);
	}
	Ok(Json(json!(exchanges)))
}

#[derive(Deserialize)]
pub struct ExchangeUpdateRequest {
	#[serde(flatten)]
	pub exchange: ExchangeConfig,
	#[serde(default)]
	pub encrypted_payload: Option<SensitivePayload>,
}

pub async fn update_exchange(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Json(mut request): Json<ExchangeUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	if let Some(payload) = &request.encrypted_payload {
		let plaintext = state
			.vault
			.decrypt_sensitive_data(payload, &user_id)
			.map_err(crypto_error)?;
		let sensitive: serde_json::Value = serde_json::from_str(&plaintext)
			.map_err(|_| ApiError::bad_request("sensitive payload is not JSON"))?;
		let mut take = |key: &str, target: &mut String| {
			if let Some(value) = sensitive[key].as_str() {
				*target = value.to_string();
			}
		};
		take("api_key", &mut request.exchange.api_key);
		take("secret_key", &mut request.exchange.secret_key);
		take("aster_private_key", &mut request.exchange.aster_private_key);
		take("lighter_api_private_key", &mut request.exchange.lighter_api_private_key);
	}
	let saved = state
		.store
		.update_exchange(&user_id, &request.exchange)
		.map_err(|e| ApiError::bad_request(e.to_string()))?;
	Ok(Json(json!({
		"id": saved.id,
		"exchange_id": saved.exchange_id,
		"enabled": saved.enabled,
		"testnet": saved.testnet,
	})))
}

#[derive(Deserialize, serde::Serialize, Default)]
pub struct SignalSources {
	#[serde(default)]
	pub coin_pool: bool,
	#[serde(default)]
	pub oi_top: bool,
}

fn signal_sources_key(user_id: &str) -> String {
	format!("signal_sources:{user_id}")
}

pub async fn signal_sources(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
) -> Result<Json<SignalSources>, ApiError> {
	let sources = state
		.store
		.get_system_config(&signal_sources_key(&user_id))?
		.and_then(|raw| serde_json::from_str(&raw).ok())
		.unwrap_or_default();
	Ok(Json(sources))
}

pub async fn update_signal_sources(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Json(sources): Json<SignalSources>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let raw = serde_json::to_string(&sources).map_err(anyhow::Error::from)?;
	state.store.set_system_config(&signal_sources_key(&user_id), &raw)?;
	Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
pub struct TemplateSaveRequest {
	pub name: String,
	pub body: String,
}

pub async fn save_template(
	State(state): State<AppState>,
	AuthUser(_user_id): AuthUser,
	Json(request): Json<TemplateSaveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	state
		.templates
		.save(&request.name, &request.body)
		.map_err(|e| ApiError::bad_request(e.to_string()))?;
	Ok(Json(json!({ "status": "ok", "name": request.name })))
}

#[derive(Deserialize)]
pub struct NamedTemplateSaveRequest {
	pub body: String,
}

pub async fn save_named_template(
	State(state): State<AppState>,
	AuthUser(_user_id): AuthUser,
	Path(name): Path<String>,
	Json(request): Json<NamedTemplateSaveRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	state
		.templates
		.save(&name, &request.body)
		.map_err(|e| ApiError::bad_request(e.to_string()))?;
	Ok(Json(json!({ "status": "ok", "name": name })))
}

/// Debug surface, only routed when `ENABLE_CLIENT_DECRYPT_API` is set.
pub async fn crypto_decrypt(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Json(payload): Json<SensitivePayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let plaintext = state
		.vault
		.decrypt_sensitive_data(&payload, &user_id)
		.map_err(crypto_error)?;
	Ok(Json(json!({ "plaintext": plaintext })))
}
