//! Registration, login and token lifecycle. Registration is two-step: the
//! account is created with a TOTP secret, and only a verified OTP completes
//! it and yields tokens.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::api::{otp, ApiError, AppState, AuthUser};

#[derive(Deserialize)]
pub struct RegisterRequest {
	pub email: String,
	pub password: String,
	#[serde(default)]
	pub beta_code: String,
}

pub async fn register(
	State(state): State<AppState>,
	Json(request): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	if !request.email.contains('@') || request.password.len() < 8 {
		return Err(ApiError::bad_request(
			"a valid email and a password of at least 8 characters are required",
		));
	}
	if state.store.get_user_by_email(&request.email)?.is_some() {
		return Err(ApiError::bad_request("email already registered"));
	}

	// Beta gating: a code is consumed only when codes exist in the system
	if !request.beta_code.is_empty() {
		state
			.store
			.consume_beta_code(&request.beta_code, &request.email)
			.map_err(|e| ApiError::bad_request(e.to_string()))?;
	}

	let password_hash = bcrypt::hash(&request.password, bcrypt::DEFAULT_COST)
		.map_err(|_| ApiError::bad_request("unusable password"))?;
	let otp_secret = otp::generate_secret();
	let user = state.store.create_user(&request.email, &password_hash, &otp_secret)?;

	info!(user_id = %user.id, "User registered, awaiting OTP verification");
	Ok(Json(json!({
		"user_id": user.id,
		"otp_secret": otp_secret,
		"qr_code_url": otp::provisioning_url(&otp_secret, &request.email),
	})))
}

#[derive(Deserialize)]
pub struct CompleteRegistrationRequest {
	pub user_id: String,
	pub otp_code: String,
}

pub async fn complete_registration(
	State(state): State<AppState>,
	Json(request): Json<CompleteRegistrationRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let user = state
		.store
		.get_user(&request.user_id)?
		.ok_or_else(|| ApiError::not_found("user"))?;
	if !otp::verify(&user.otp_secret, &request.otp_code) {
		return Err(ApiError::unauthorized("invalid OTP code"));
	}
	state.store.mark_otp_verified(&user.id)?;

	let pair = state.auth.issue_pair(&user.id)?;
	Ok(Json(json!({
		"user_id": user.id,
		"access_token": pair.access_token,
		"refresh_token": pair.refresh_token,
		"expires_in": pair.expires_in,
	})))
}

#[derive(Deserialize)]
pub struct LoginRequest {
	pub email: String,
	pub password: String,
}

/// First factor. A valid password yields only the user id; tokens come from
/// the OTP step.
pub async fn login(
	State(state): State<AppState>,
	Json(request): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let user = state
		.store
		.get_user_by_email(&request.email)?
		.ok_or_else(|| ApiError::unauthorized("invalid credentials"))?;
	if !bcrypt::verify(&request.password, &user.password_hash).unwrap_or(false) {
		warn!(email = %request.email, "Failed login attempt");
		return Err(ApiError::unauthorized("invalid credentials"));
	}
	Ok(Json(json!({ "requires_otp": true, "user_id": user.id })))
}

#[derive(Deserialize)]
pub struct VerifyOtpRequest {
	pub user_id: String,
	pub otp_code: String,
}

pub async fn verify_otp(
	State(state): State<AppState>,
	Json(request): Json<VerifyOtpRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let user = state
		.store
		.get_user(&request.user_id)?
		.ok_or_else(|| ApiError::unauthorized("invalid credentials"))?;
	if !otp::verify(&user.otp_secret, &request.otp_code) {
		return Err(ApiError::unauthorized("invalid OTP code"));
	}
	let pair = state.auth.issue_pair(&user.id)?;
	Ok(Json(json!({
		"user_id": user.id,
		"access_token": pair.access_token,
		"refresh_token": pair.refresh_token,
		"expires_in": pair.expires_in,
	})))
}

#[derive(Deserialize)]
pub struct RefreshRequest {
	pub refresh_token: String,
}

/// Rotation: the presented refresh token is blacklisted as the new pair is
/// issued.
pub async fn refresh_token(
	State(state): State<AppState>,
	Json(request): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let claims = state
		.auth
		.verify(&request.refresh_token, "refresh")
		.ok_or_else(|| ApiError::unauthorized("invalid refresh token"))?;
	state.auth.blacklist(&claims.jti, claims.exp);

	let pair = state.auth.issue_pair(&claims.sub)?;
	Ok(Json(json!({
		"access_token": pair.access_token,
		"refresh_token": pair.refresh_token,
		"expires_in": pair.expires_in,
	})))
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
	pub email: String,
	pub otp_code: String,
	pub new_password: String,
}

/// Password reset authenticated by the second factor.
pub async fn reset_password(
	State(state): State<AppState>,
	Json(request): Json<ResetPasswordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	if request.new_password.len() < 8 {
		return Err(ApiError::bad_request("password must be at least 8 characters"));
	}
	let user = state
		.store
		.get_user_by_email(&request.email)?
		.ok_or_else(|| ApiError::unauthorized("invalid credentials"))?;
	if !otp::verify(&user.otp_secret, &request.otp_code) {
		return Err(ApiError::unauthorized("invalid OTP code"));
	}
	let password_hash = bcrypt::hash(&request.new_password, bcrypt::DEFAULT_COST)
		.map_err(|_| ApiError::bad_request("unusable password"))?;
	state.store.update_password(&user.id, &password_hash)?;
	info!(user_id = %user.id, "Password reset");
	Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
pub struct LogoutRequest {
	#[serde(default)]
	pub refresh_token: String,
}

/// Blacklists both the access token used for the call and the presented
/// refresh token.
pub async fn logout(
	State(state): State<AppState>,
	user: AuthUser,
	headers: axum::http::HeaderMap,
	Json(request): Json<LogoutRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
	if let Some(token) = headers
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
	{
		if let Some(claims) = state.auth.verify(token, "access") {
			state.auth.blacklist(&claims.jti, claims.exp);
		}
	}
	if !request.refresh_token.is_empty() {
		if let Some(claims) = state.auth.verify(&request.refresh_token, "refresh") {
			state.auth.blacklist(&claims.jti, claims.exp);
		}
	}
	info!(user_id = %user.0, "Logged out");
	Ok(Json(json!({ "status": "ok" })))
}
