//! End-to-end control-plane tests: the registration/OTP/token flow and the
//! configuration surface, driven through the real router.

use std::{path::PathBuf, sync::Arc};

use axum::{
	body::Body,
	http::{header, Request, StatusCode},
	Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use nofx_engine::{
	api::{auth::AuthKeys, otp, router, AppState},
	decision::TemplateStore,
	manager::TraderManager,
	settings::{Node, Prompts, Security, Settings, StoreSettings},
	store::Store,
	vault::Vault,
};

fn test_settings(db_file: PathBuf) -> Settings {
	Settings {
		node: Node {
			port: 0,
			environment: "development".to_string(),
			frontend_url: None,
			cors_allowed_origins: None,
			disable_cors: false,
			trust_proxy: false,
			enable_csrf: false,
			enable_client_decrypt_api: false,
		},
		security: Security {
			data_encryption_key: "integration-test-key-0123456789abcdef".to_string(),
			jwt_secret: Some("integration-test-jwt-secret".to_string()),
		},
		store: StoreSettings { db_file },
		prompts: Prompts { dir: PathBuf::from("/nonexistent/prompts") },
	}
}

fn test_app(dir: &tempfile::TempDir) -> Router {
	let settings = test_settings(dir.path().join("nofx.db"));
	let vault = Arc::new(Vault::new(&settings.security.data_encryption_key).unwrap());
	let store = Store::open(&settings.store.db_file, vault.clone()).unwrap();
	let templates = Arc::new(TemplateStore::load(settings.prompts.dir.clone()).unwrap());
	let (subscriptions, _rx) = tokio::sync::watch::channel(Vec::new());
	let hub = nofx_engine::market::MarketDataHub::new(
		Vec::new(),
		nofx_engine::market::CandleCache::default(),
	);
	let manager = TraderManager::new(store.clone(), hub, templates.clone(), subscriptions);
	let auth = Arc::new(AuthKeys::new(settings.security.jwt_secret.as_deref().unwrap()));
	router(AppState { store, manager, templates, vault, auth, settings: Arc::new(settings) })
}

fn post_json(path: &str, body: Value) -> Request<Body> {
	Request::builder()
		.method("POST")
		.uri(path)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(body.to_string()))
		.unwrap()
}

fn get(path: &str, bearer: Option<&str>) -> Request<Body> {
	let mut builder = Request::builder().method("GET").uri(path);
	if let Some(token) = bearer {
		builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
	}
	builder.body(Body::empty()).unwrap()
}

fn post_json_auth(path: &str, body: Value, bearer: &str) -> Request<Body> {
	Request::builder()
		.method("POST")
		.uri(path)
		.header(header::CONTENT_TYPE, "application/json")
		.header(header::AUTHORIZATION, format!("Bearer {bearer}"))
		.body(Body::from(body.to_string()))
		.unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
	let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
	serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn registration_otp_and_token_rotation() {
	let dir = tempfile::tempdir().unwrap();
	let app = test_app(&dir);

	// Health is open
	let response = app.clone().oneshot(get("/api/health", None)).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);

	// Register
	let response = app
		.clone()
		.oneshot(post_json(
			"/api/register",
			json!({"email": "trader@example.com", "password": "hunter2hunter2"}),
		))
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let registration = body_json(response).await;
	let user_id = registration["user_id"].as_str().unwrap().to_string();
	let otp_secret = registration["otp_secret"].as_str().unwrap().to_string();
	assert!(registration["qr_code_url"].as_str().unwrap().starts_with("otpauth://totp/"));

	// A wrong code is rejected
	let response = app
		.clone()
		.oneshot(post_json(
			"/api/complete-registration",
			json!({"user_id": user_id, "otp_code": "000000"}),
		))
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

	// The right code completes registration and yields a token pair
	let code = otp::current_code(&otp_secret).unwrap();
	let response = app
		.clone()
		.oneshot(post_json(
			"/api/complete-registration",
			json!({"user_id": user_id, "otp_code": code}),
		))
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let tokens = body_json(response).await;
	let access = tokens["access_token"].as_str().unwrap().to_string();
	let refresh = tokens["refresh_token"].as_str().unwrap().to_string();

	// Login is two-step
	let response = app
		.clone()
		.oneshot(post_json(
			"/api/login",
			json!({"email": "trader@example.com", "password": "hunter2hunter2"}),
		))
		.await
		.unwrap();
	let login = body_json(response).await;
	assert_eq!(login["requires_otp"], true);

	// Authenticated surface requires the bearer token
	let response = app.clone().oneshot(get("/api/models", None)).await.unwrap();
	assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
	let response = app.clone().oneshot(get("/api/models", Some(&access))).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);

	// Refresh rotates: the old refresh token dies on use
	let response = app
		.clone()
		.oneshot(post_json("/api/refresh-token", json!({"refresh_token": refresh})))
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let rotated = body_json(response).await;
	assert!(rotated["access_token"].as_str().is_some());

	let response = app
		.clone()
		.oneshot(post_json("/api/refresh-token", json!({"refresh_token": refresh})))
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn config_and_trader_lifecycle_over_http() {
	let dir = tempfile::tempdir().unwrap();
	let app = test_app(&dir);

	// Register and verify a user
	let registration = body_json(
		app.clone()
			.oneshot(post_json(
				"/api/register",
				json!({"email": "ops@example.com", "password": "longenoughpw"}),
			))
			.await
			.unwrap(),
	)
	.await;
	let code = otp::current_code(registration["otp_secret"].as_str().unwrap()).unwrap();
	let tokens = body_json(
		app.clone()
			.oneshot(post_json(
				"/api/complete-registration",
				json!({"user_id": registration["user_id"], "otp_code": code}),
			))
			.await
			.unwrap(),
	)
	.await;
	let access = tokens["access_token"].as_str().unwrap().to_string();

	// Configure a model and an exchange
	let model = body_json(
		app.clone()
			.oneshot(post_json_auth(
				"/api/models",
				json!({
					"model_id": "deepseek", "name": "DeepSeek", "provider": "deepseek",
					"enabled": true, "api_key": "sk-integration"
				}),
				&access,
			))
			.await
			.unwrap(),
	)
	.await;
	let exchange = body_json(
		app.clone()
			.oneshot(post_json_auth(
				"/api/exchanges",
				json!({
					"exchange_id": "binance", "enabled": true,
					"api_key": "key", "secret_key": "secret", "testnet": true
				}),
				&access,
			))
			.await
			.unwrap(),
	)
	.await;

	// Create a trader referencing them
	let response = app
		.clone()
		.oneshot(post_json_auth(
			"/api/traders",
			json!({
				"name": "integration agent",
				"ai_model_id": model["id"],
				"exchange_id": exchange["id"],
				"trading_symbols": "BTCUSDT",
				"scan_interval_minutes": 5
			}),
			&access,
		))
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let trader = body_json(response).await;
	let trader_id = trader["id"].as_str().unwrap().to_string();

	// It shows up in the public fleet view
	let competition = body_json(app.clone().oneshot(get("/api/competition", None)).await.unwrap())
		.await;
	assert_eq!(competition.as_array().unwrap().len(), 1);

	// Status is scoped to the owner
	let response = app
		.clone()
		.oneshot(get(&format!("/api/status?trader_id={trader_id}"), Some(&access)))
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	let status = body_json(response).await;
	assert_eq!(status["is_running"], false);

	// Delete is a 200 and repeatable
	let delete = |app: Router, access: String, trader_id: String| async move {
		app.oneshot(
			Request::builder()
				.method("DELETE")
				.uri(format!("/api/traders/{trader_id}"))
				.header(header::AUTHORIZATION, format!("Bearer {access}"))
				.body(Body::empty())
				.unwrap(),
		)
		.await
		.unwrap()
	};
	let response = delete(app.clone(), access.clone(), trader_id.clone()).await;
	assert_eq!(response.status(), StatusCode::OK);
	let response = delete(app.clone(), access.clone(), trader_id.clone()).await;
	assert_eq!(response.status(), StatusCode::OK);

	// Masked secrets on read
	let models = body_json(app.clone().oneshot(get("/api/models", Some(&access))).await.unwrap())
		.await;
	assert_eq!(models[0]["api_key"], "***");
}
