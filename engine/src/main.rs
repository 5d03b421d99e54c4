use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use nofx_engine::{
	api::{self, auth::AuthKeys, AppState},
	decision::TemplateStore,
	manager::TraderManager,
	market::{BinanceKlineSource, CandleCache, CandleStreamMonitor, KlineSource, MarketDataHub, OkxKlineSource},
	settings::{CommandLineOptions, Settings},
	store::Store,
	vault::Vault,
};

#[tokio::main]
async fn main() {
	let settings = match Settings::new(CommandLineOptions::parse()) {
		Ok(settings) => settings,
		Err(error) => {
			eprintln!("Error reading settings: {error:#}");
			std::process::exit(1);
		},
	};

	nofx_utilities::logging::init_logging();
	info!(version = env!("CARGO_PKG_VERSION"), "Starting nofx engine");

	// A missing or invalid master key must never let the process run
	let vault = match Vault::new(&settings.security.data_encryption_key) {
		Ok(vault) => Arc::new(vault),
		Err(error) => {
			error!(%error, "Could not initialise the secret vault");
			std::process::exit(1);
		},
	};

	let store = match Store::open(&settings.store.db_file, vault.clone()) {
		Ok(store) => store,
		Err(error) => {
			error!(%error, "Could not open the config store");
			std::process::exit(1);
		},
	};

	let jwt_secret = match store.jwt_secret(settings.security.jwt_secret.as_deref()) {
		Ok(secret) => secret,
		Err(error) => {
			error!(%error, "Could not bootstrap the JWT secret");
			std::process::exit(1);
		},
	};
	let auth = Arc::new(AuthKeys::new(&jwt_secret));

	let templates = match TemplateStore::load(settings.prompts.dir.clone()) {
		Ok(templates) => Arc::new(templates),
		Err(error) => {
			error!(%error, "Could not load prompt templates");
			std::process::exit(1);
		},
	};

	// Market data: REST failover hub plus the websocket candle cache
	let cache = CandleCache::default();
	let sources: Vec<Arc<dyn KlineSource>> = vec![
		Arc::new(BinanceKlineSource::default()),
		Arc::new(OkxKlineSource::default()),
	];
	let hub = MarketDataHub::new(sources, cache.clone());

	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
	let (subscriptions_tx, subscriptions_rx) = tokio::sync::watch::channel(Vec::new());

	tokio::spawn(hub.clone().run_health_loop(shutdown_rx.clone()));
	tokio::spawn(
		CandleStreamMonitor::new(cache, subscriptions_rx).run(shutdown_rx.clone()),
	);

	let manager = TraderManager::new(
		store.clone(),
		hub.clone(),
		templates.clone(),
		subscriptions_tx,
	);
	manager.load_and_recover().await;

	let state = AppState {
		store,
		manager: manager.clone(),
		templates,
		vault,
		auth,
		settings: Arc::new(settings),
	};
	let server = tokio::spawn(api::serve(state, shutdown_rx));

	wait_for_shutdown_signal().await;
	info!("Shutdown signal received, stopping agents");

	let _ = shutdown_tx.send(true);
	manager.stop_all().await;
	match server.await {
		Ok(Ok(())) => {},
		Ok(Err(error)) => error!(%error, "Control plane exited with an error"),
		Err(error) => error!(%error, "Control plane task panicked"),
	}
	info!("Engine stopped");
}

async fn wait_for_shutdown_signal() {
	use tokio::signal::unix::{signal, SignalKind};

	let ctrl_c = tokio::signal::ctrl_c();
	let mut terminate =
		signal(SignalKind::terminate()).expect("SIGTERM handler installs on unix");
	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate.recv() => {},
	}
}
