//! Authenticated agent management and per-agent views.

use axum::{
	extract::{Path, Query, State},
	Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
	api::{ApiError, AppState, AuthUser},
	store::{TradeAction, TraderRecord, TraderUpdate},
};

pub async fn create_trader(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Json(record): Json<TraderRecord>,
) -> Result<Json<TraderRecord>, ApiError> {
	if record.name.trim().is_empty() {
		return Err(ApiError::bad_request("trader name is required"));
	}
	let created = state
		.store
		.create_trader(&user_id, record)
		.map_err(|e| ApiError::bad_request(e.to_string()))?;
	Ok(Json(created))
}

pub async fn get_trader(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let record = state
		.store
		.get_trader_config(&user_id, &id)?
		.ok_or_else(|| ApiError::not_found("trader"))?;
	let live = state.manager.live_status(&id).await;
	Ok(Json(json!({
		"trader": record,
		"is_running": state.manager.is_running(&id).await,
		"live": live,
	})))
}

pub async fn update_trader(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Path(id): Path<String>,
	Json(update): Json<TraderUpdate>,
) -> Result<Json<TraderRecord>, ApiError> {
	if state.manager.is_running(&id).await {
		return Err(ApiError::bad_request("stop the trader before editing it"));
	}
	let updated = state
		.store
		.update_trader(&user_id, &id, &update)
		.map_err(|e| ApiError::bad_request(e.to_string()))?;
	Ok(Json(updated))
}

/// Delete the row only after the agent is out of the in-memory manager.
pub async fn delete_trader(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
	state
		.manager
		.remove_trader(&user_id, &id)
		.await
		.map_err(|e| ApiError::bad_request(e.to_string()))?;
	state.store.delete_trader(&user_id, &id)?;
	Ok(Json(json!({ "status": "deleted" })))
}

pub async fn start_trader(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
	state
		.manager
		.start(&user_id, &id)
		.await
		.map_err(|e| ApiError::bad_request(e.to_string()))?;
	Ok(Json(json!({ "status": "running" })))
}

pub async fn stop_trader(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
	state
		.manager
		.stop(&user_id, &id)
		.await
		.map_err(|e| ApiError::bad_request(e.to_string()))?;
	Ok(Json(json!({ "status": "stopped" })))
}

#[derive(Deserialize)]
pub struct PromptUpdate {
	pub custom_prompt: String,
	#[serde(default)]
	pub override_base_prompt: bool,
}

pub async fn update_prompt(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Path(id): Path<String>,
	Json(update): Json<PromptUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
	state
		.store
		.update_trader_prompt(&user_id, &id, &update.custom_prompt, update.override_base_prompt)
		.map_err(|e| ApiError::bad_request(e.to_string()))?;
	Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
pub struct TraderQuery {
	pub trader_id: String,
	#[serde(default = "default_limit")]
	pub limit: i64,
}

fn default_limit() -> i64 {
	50
}

fn owned_trader(
	state: &AppState,
	user_id: &str,
	trader_id: &str,
) -> Result<TraderRecord, ApiError> {
	state
		.store
		.get_trader_config(user_id, trader_id)?
		.ok_or_else(|| ApiError::not_found("trader"))
}

pub async fn status(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Query(query): Query<TraderQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let record = owned_trader(&state, &user_id, &query.trader_id)?;
	Ok(Json(json!({
		"trader_id": record.id,
		"name": record.name,
		"is_running": state.manager.is_running(&record.id).await,
		"scan_interval_minutes": record.scan_interval_minutes,
		"live": state.manager.live_status(&record.id).await,
	})))
}

pub async fn account(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Query(query): Query<TraderQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let record = owned_trader(&state, &user_id, &query.trader_id)?;
	let latest = state.store.get_latest_decision(&record.id)?;
	let live = state.manager.live_status(&record.id).await;
	Ok(Json(json!({
		"initial_balance": record.initial_balance,
		"live": live,
		"last_recorded": latest.map(|l| l.account),
	})))
}

/// Position view reconstructed from trade history, which stays correct
/// across restarts.
pub async fn positions(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Query(query): Query<TraderQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let record = owned_trader(&state, &user_id, &query.trader_id)?;
	let positions = state.store.get_open_positions(&record.id)?;
	Ok(Json(json!(positions)))
}

pub async fn decisions(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Query(query): Query<TraderQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let record = owned_trader(&state, &user_id, &query.trader_id)?;
	Ok(Json(json!(state.store.get_decisions(&record.id, query.limit)?)))
}

pub async fn latest_decision(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Query(query): Query<TraderQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let record = owned_trader(&state, &user_id, &query.trader_id)?;
	Ok(Json(json!(state.store.get_latest_decision(&record.id)?)))
}

pub async fn statistics(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Query(query): Query<TraderQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let record = owned_trader(&state, &user_id, &query.trader_id)?;
	let trades = state.store.get_trade_history(&record.id, 1000)?;

	let closes: Vec<_> = trades
		.iter()
		.filter(|t| t.action.is_close_variant() && t.realized_pnl.is_some())
		.collect();
	let wins = closes
		.iter()
		.filter(|t| t.realized_pnl.unwrap_or(0.0) > 0.0)
		.count();
	let total_pnl: f64 = closes.iter().filter_map(|t| t.realized_pnl).sum();
	let opens = trades.iter().filter(|t| t.action == TradeAction::Open).count();

	Ok(Json(json!({
		"total_trades": trades.len(),
		"opens": opens,
		"closes": closes.len(),
		"wins": wins,
		"win_rate": if closes.is_empty() { 0.0 } else { wins as f64 / closes.len() as f64 },
		"realized_pnl": total_pnl,
	})))
}

pub async fn performance(
	State(state): State<AppState>,
	AuthUser(user_id): AuthUser,
	Query(query): Query<TraderQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let record = owned_trader(&state, &user_id, &query.trader_id)?;
	let history = state.store.get_equity_history(&record.id, query.limit.max(500))?;

	let peak = history.iter().map(|p| p.total_equity).fold(0.0_f64, f64::max);
	let latest_equity = history.last().map(|p| p.total_equity).unwrap_or(0.0);
	let max_drawdown = history
		.iter()
		.scan(0.0_f64, |running_peak, point| {
			*running_peak = running_peak.max(point.total_equity);
			Some(if *running_peak > 0.0 {
				(*running_peak - point.total_equity) / *running_peak * 100.0
			} else {
				0.0
			})
		})
		.fold(0.0_f64, f64::max);

	Ok(Json(json!({
		"initial_balance": record.initial_balance,
		"latest_equity": latest_equity,
		"peak_equity": peak,
		"max_drawdown_percent": max_drawdown,
		"history": history,
	})))
}
