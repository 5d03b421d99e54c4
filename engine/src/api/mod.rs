//! HTTP control plane: public fleet views, the authentication flow, and the
//! authenticated configuration/trading surface.

pub mod auth;
pub mod cors;
pub mod csrf;
pub mod otp;
mod routes;

use axum::{
	extract::{FromRequestParts, Request, State},
	http::{request::Parts, StatusCode},
	middleware::{self, Next},
	response::{IntoResponse, Response},
	routing::{get, post, put},
	Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::{
	decision::TemplateStore, manager::TraderManager, settings::Settings, store::Store,
	vault::Vault,
};
use auth::AuthKeys;

#[derive(Clone)]
pub struct AppState {
	pub store: Store,
	pub manager: Arc<TraderManager>,
	pub templates: Arc<TemplateStore>,
	pub vault: Arc<Vault>,
	pub auth: Arc<AuthKeys>,
	pub settings: Arc<Settings>,
}

/// Error envelope every handler speaks: `{"error": message}` with a status.
/// Internal detail never leaks; anyhow errors collapse to a generic 500.
pub struct ApiError {
	status: StatusCode,
	message: String,
}

impl ApiError {
	pub fn bad_request(message: impl Into<String>) -> Self {
		Self { status: StatusCode::BAD_REQUEST, message: message.into() }
	}

	pub fn unauthorized(message: impl Into<String>) -> Self {
		Self { status: StatusCode::UNAUTHORIZED, message: message.into() }
	}

	pub fn forbidden(message: impl Into<String>) -> Self {
		Self { status: StatusCode::FORBIDDEN, message: message.into() }
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self { status: StatusCode::NOT_FOUND, message: message.into() }
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		(self.status, Json(json!({ "error": self.message }))).into_response()
	}
}

impl From<anyhow::Error> for ApiError {
	fn from(error: anyhow::Error) -> Self {
		tracing::error!(%error, "Internal error in handler");
		Self {
			status: StatusCode::INTERNAL_SERVER_ERROR,
			message: "internal error".to_string(),
		}
	}
}

/// Extractor proving the request carries a live access token. Handlers that
/// take it are the authenticated surface.
pub struct AuthUser(pub String);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
	type Rejection = ApiError;

	async fn from_request_parts(
		parts: &mut Parts,
		state: &AppState,
	) -> Result<Self, Self::Rejection> {
		let token = parts
			.headers
			.get(axum::http::header::AUTHORIZATION)
			.and_then(|value| value.to_str().ok())
			.and_then(|value| value.strip_prefix("Bearer "))
			.ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
		let claims = state
			.auth
			.verify(token, "access")
			.ok_or_else(|| ApiError::unauthorized("invalid or expired token"))?;
		Ok(AuthUser(claims.sub))
	}
}

/// Global CSRF guard. Skipped entirely when the operator disables it.
async fn csrf_guard(
	State(state): State<AppState>,
	request: Request,
	next: Next,
) -> Response {
	if state.settings.node.enable_csrf {
		let header_token = request
			.headers()
			.get(csrf::CSRF_HEADER)
			.and_then(|v| v.to_str().ok())
			.map(str::to_owned);
		let cookie_token = request
			.headers()
			.get(axum::http::header::COOKIE)
			.and_then(|v| v.to_str().ok())
			.and_then(|cookies| csrf::cookie_value(cookies, csrf::CSRF_COOKIE))
			.map(str::to_owned);
		if let Some(reason) = csrf::check(
			request.method(),
			request.uri().path(),
			header_token.as_deref(),
			cookie_token.as_deref(),
		) {
			return ApiError::forbidden(reason).into_response();
		}
	}
	next.run(request).await
}

pub fn router(state: AppState) -> Router {
	let cors = cors::cors_layer(&state.settings);

	let mut app = Router::new()
		// Public fleet views
		.route("/api/health", get(routes::public::health))
		.route("/api/supported-models", get(routes::public::supported_models))
		.route("/api/supported-exchanges", get(routes::public::supported_exchanges))
		.route("/api/config", get(routes::public::config))
		.route("/api/crypto/public-key", get(routes::public::crypto_public_key))
		.route("/api/csrf-token", get(routes::public::csrf_token))
		.route("/api/competition", get(routes::public::competition))
		.route("/api/top-traders", get(routes::public::top_traders))
		.route("/api/equity-history", get(routes::public::equity_history))
		.route("/api/equity-history-batch", post(routes::public::equity_history_batch))
		.route(
			"/api/prompt-templates",
			get(routes::public::list_templates).post(routes::configs::save_template),
		)
		.route(
			"/api/prompt-templates/:name",
			get(routes::public::get_template).put(routes::configs::save_named_template),
		)
		// Authentication flow
		.route("/api/register", post(routes::auth_flow::register))
		.route("/api/complete-registration", post(routes::auth_flow::complete_registration))
		.route("/api/login", post(routes::auth_flow::login))
		.route("/api/verify-otp", post(routes::auth_flow::verify_otp))
		.route("/api/refresh-token", post(routes::auth_flow::refresh_token))
		.route("/api/reset-password", post(routes::auth_flow::reset_password))
		.route("/api/logout", post(routes::auth_flow::logout))
		// Agents
		.route(
			"/api/traders",
			get(routes::public::list_traders).post(routes::traders::create_trader),
		)
		.route(
			"/api/traders/:id",
			get(routes::traders::get_trader)
				.put(routes::traders::update_trader)
				.delete(routes::traders::delete_trader),
		)
		.route("/api/traders/:id/start", post(routes::traders::start_trader))
		.route("/api/traders/:id/stop", post(routes::traders::stop_trader))
		.route("/api/traders/:id/prompt", put(routes::traders::update_prompt))
		// Authenticated read-only views
		.route("/api/status", get(routes::traders::status))
		.route("/api/account", get(routes::traders::account))
		.route("/api/positions", get(routes::traders::positions))
		.route("/api/decisions", get(routes::traders::decisions))
		.route("/api/decisions/latest", get(routes::traders::latest_decision))
		.route("/api/statistics", get(routes::traders::statistics))
		.route("/api/performance", get(routes::traders::performance))
		// Model / exchange configuration
		.route(
			"/api/models",
			get(routes::configs::list_models).post(routes::configs::update_model),
		)
		.route(
			"/api/exchanges",
			get(routes::configs::list_exchanges).post(routes::configs::update_exchange),
		)
		.route(
			"/api/user/signal-sources",
			get(routes::configs::signal_sources).put(routes::configs::update_signal_sources),
		);

	if state.settings.node.enable_client_decrypt_api {
		app = app.route("/api/crypto/decrypt", post(routes::configs::crypto_decrypt));
	}

	app.layer(middleware::from_fn_with_state(state.clone(), csrf_guard))
		.layer(cors)
		.with_state(state)
}

pub async fn serve(
	state: AppState,
	mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
	let port = state.settings.node.port;
	let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
	info!(port, "Control plane listening");
	axum::serve(listener, router(state))
		.with_graceful_shutdown(async move {
			let _ = shutdown.changed().await;
		})
		.await?;
	Ok(())
}
