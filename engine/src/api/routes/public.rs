//! Unauthenticated routes: health, capability discovery, fleet views and the
//! CSRF/crypto bootstrap.

use axum::{
	extract::{Path, Query, State},
	http::header,
	response::IntoResponse,
	Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
	api::{csrf, ApiError, AppState},
	store::SUPPORTED_EXCHANGES,
};

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
	Json(json!({
		"status": "ok",
		"version": env!("CARGO_PKG_VERSION"),
		"running_traders": state.manager.running_count().await,
	}))
}

pub async fn supported_models() -> Json<serde_json::Value> {
	Json(json!([
		{"id": "deepseek", "name": "DeepSeek", "provider": "deepseek"},
		{"id": "openai", "name": "OpenAI", "provider": "openai"},
		{"id": "qwen", "name": "Qwen", "provider": "qwen"},
		{"id": "kimi", "name": "Kimi", "provider": "kimi"},
		{"id": "custom", "name": "Custom (OpenAI-compatible)", "provider": "openai"},
	]))
}

pub async fn supported_exchanges() -> Json<serde_json::Value> {
	Json(json!(SUPPORTED_EXCHANGES))
}

/// Non-sensitive runtime configuration for the frontend.
pub async fn config(State(state): State<AppState>) -> Json<serde_json::Value> {
	Json(json!({
		"environment": state.settings.node.environment,
		"csrf_enabled": state.settings.node.enable_csrf,
		"client_decrypt_api": state.settings.node.enable_client_decrypt_api,
	}))
}

pub async fn crypto_public_key(State(state): State<AppState>) -> Json<serde_json::Value> {
	Json(json!({ "public_key": state.vault.public_key_pem() }))
}

/// Issue the double-submit token: returned in the body and set as a cookie.
pub async fn csrf_token() -> impl IntoResponse {
	let token = csrf::generate_token();
	(
		[(
			header::SET_COOKIE,
			format!("{}={token}; Path=/; SameSite=Strict", csrf::CSRF_COOKIE),
		)],
		Json(json!({ "csrf_token": token })),
	)
}

pub async fn list_traders(
	State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
	// The public listing is the competition view without account detail
	let competition = state.manager.get_competition_data().await?;
	Ok(Json(competition))
}

pub async fn competition(
	State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
	Ok(Json(state.manager.get_competition_data().await?))
}

pub async fn top_traders(
	State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
	Ok(Json(state.manager.get_top_traders_data(10).await?))
}

#[derive(Deserialize)]
pub struct EquityHistoryQuery {
	pub trader_id: String,
	#[serde(default = "default_history_limit")]
	pub limit: i64,
}

fn default_history_limit() -> i64 {
	500
}

pub async fn equity_history(
	State(state): State<AppState>,
	Query(query): Query<EquityHistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let points = state.store.get_equity_history(&query.trader_id, query.limit)?;
	Ok(Json(json!({ "trader_id": query.trader_id, "history": points })))
}

#[derive(Deserialize)]
pub struct EquityHistoryBatchRequest {
	pub trader_ids: Vec<String>,
	#[serde(default = "default_history_limit")]
	pub limit: i64,
}

/// Compacted equity curves for several agents in one round trip.
pub async fn equity_history_batch(
	State(state): State<AppState>,
	Json(request): Json<EquityHistoryBatchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let mut batch = serde_json::Map::new();
	for trader_id in request.trader_ids {
		let points = state.store.get_equity_history(&trader_id, request.limit)?;
		batch.insert(trader_id, json!(points));
	}
	Ok(Json(serde_json::Value::Object(batch)))
}

pub async fn list_templates(State(state): State<AppState>) -> Json<serde_json::Value> {
	Json(json!(state.templates.list()))
}

pub async fn get_template(
	State(state): State<AppState>,
	Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let info = state
		.templates
		.get(&name)
		.ok_or_else(|| ApiError::not_found(format!("template {name:?}")))?;
	Ok(Json(json!({
		"name": info.name,
		"metadata": info.metadata,
		"body": state.templates.body(&name),
	})))
}
