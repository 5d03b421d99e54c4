//! TraderManager: owns every running agent, drives lifecycle transitions, and
//! aggregates fleet views.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::{
	agent::{AutoTrader, SharedStatus},
	constants::COMPETITION_CACHE_TTL,
	decision::{AiClient, TemplateStore},
	exchange::make_trader,
	market::MarketDataHub,
	store::{Store, TraderRecord},
};

struct ManagedAgent {
	user_id: String,
	shutdown: watch::Sender<bool>,
	handle: tokio::task::JoinHandle<()>,
	status: SharedStatus,
}

pub struct TraderManager {
	store: Store,
	hub: Arc<MarketDataHub>,
	templates: Arc<TemplateStore>,
	agents: RwLock<HashMap<String, ManagedAgent>>,
	/// (symbol, timeframe) union of running agents, consumed by the candle
	/// stream monitor.
	subscriptions: watch::Sender<Vec<(String, String)>>,
	competition_cache: Mutex<Option<(Instant, Value)>>,
}

impl TraderManager {
	pub fn new(
		store: Store,
		hub: Arc<MarketDataHub>,
		templates: Arc<TemplateStore>,
		subscriptions: watch::Sender<Vec<(String, String)>>,
	) -> Arc<Self> {
		Arc::new(Self {
			store,
			hub,
			templates,
			agents: RwLock::new(HashMap::new()),
			subscriptions,
			competition_cache: Mutex::new(None),
		})
	}

	/// Startup recovery: restart every agent whose persisted record says it
	/// was running. Failures are reported per agent and never abort startup.
	pub async fn load_and_recover(&self) {
		let records = match self.store.get_all_traders() {
			Ok(records) => records,
			Err(error) => {
				error!(%error, "Could not load trader records");
				return;
			},
		};
		for record in records.into_iter().filter(|r| r.is_running) {
			let trader_id = record.id.clone();
			if let Err(error) = self.spawn_agent(record).await {
				warn!(trader_id, %error, "Could not recover running agent");
			}
		}
		self.refresh_subscriptions();
	}

	async fn spawn_agent(&self, record: TraderRecord) -> Result<()> {
		let mut agents = self.agents.write().await;
		if agents.contains_key(&record.id) {
			return Ok(());
		}

		let model = self
			.store
			.get_ai_model_by_pk(&record.user_id, record.ai_model_id)?
			.with_context(|| format!("model {} missing", record.ai_model_id))?;
		let exchange = self
			.store
			.get_exchange_by_pk(&record.user_id, record.exchange_id)?
			.with_context(|| format!("exchange {} missing", record.exchange_id))?;
		if !model.enabled {
			bail!("model {} is disabled", model.model_id);
		}
		if !exchange.enabled {
			bail!("exchange {} is disabled", exchange.exchange_id);
		}

		let trader = make_trader(&exchange).map_err(|e| anyhow::anyhow!(e.to_string()))?;
		let ai = AiClient::from_model_config(&model);

		let status: SharedStatus = Arc::new(parking_lot::RwLock::new(None));
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let auto_trader = AutoTrader::new(
			record.clone(),
			trader,
			ai,
			self.store.clone(),
			self.hub.clone(),
			self.templates.clone(),
			status.clone(),
		);
		let handle = tokio::spawn(auto_trader.run(shutdown_rx));

		agents.insert(
			record.id.clone(),
			ManagedAgent { user_id: record.user_id.clone(), shutdown: shutdown_tx, handle, status },
		);
		info!(trader_id = %record.id, "Agent registered and started");
		Ok(())
	}

	pub async fn start(&self, user_id: &str, trader_id: &str) -> Result<()> {
		let record = self
			.store
			.get_trader_config(user_id, trader_id)?
			.with_context(|| format!("trader {trader_id} not found"))?;
		self.spawn_agent(record).await?;
		self.store.update_trader_status(trader_id, true)?;
		self.refresh_subscriptions();
		Ok(())
	}

	/// Stop the agent's loop and wait for it to finish its current dispatch
	/// item and final record.
	pub async fn stop(&self, user_id: &str, trader_id: &str) -> Result<()> {
		let agent = {
			let mut agents = self.agents.write().await;
			let owner_matches = agents.get(trader_id).map(|agent| agent.user_id == user_id);
			match owner_matches {
				Some(true) => agents.remove(trader_id),
				Some(false) => bail!("trader {trader_id} belongs to another user"),
				None => None,
			}
		};
		if let Some(agent) = agent {
			let _ = agent.shutdown.send(true);
			if let Err(error) = agent.handle.await {
				error!(trader_id, %error, "Agent task join failed");
			}
		}
		self.store.update_trader_status(trader_id, false)?;
		self.refresh_subscriptions();
		Ok(())
	}

	/// Remove the agent from the in-memory registry (stopping it first). The
	/// store row is deleted separately, after this returns.
	pub async fn remove_trader(&self, user_id: &str, trader_id: &str) -> Result<()> {
		self.stop(user_id, trader_id).await
	}

	pub async fn is_running(&self, trader_id: &str) -> bool {
		self.agents.read().await.contains_key(trader_id)
	}

	pub async fn running_count(&self) -> usize {
		self.agents.read().await.len()
	}

	pub async fn live_status(&self, trader_id: &str) -> Option<crate::agent::LiveStatus> {
		let agents = self.agents.read().await;
		agents.get(trader_id).and_then(|a| a.status.read().clone())
	}

	/// Cancel every agent and wait for all loops to return.
	pub async fn stop_all(&self) {
		let drained: Vec<(String, ManagedAgent)> =
			self.agents.write().await.drain().collect();
		for (trader_id, agent) in drained {
			let _ = agent.shutdown.send(true);
			if let Err(error) = agent.handle.await {
				error!(trader_id, %error, "Agent task join failed");
			}
		}
		info!("All agents stopped");
	}

	/// Push the current (symbol, timeframe) union of running agents to the
	/// candle stream monitor.
	fn refresh_subscriptions(&self) {
		let symbols = self.store.get_custom_coins().unwrap_or_default();
		let timeframes = self.store.get_all_timeframes().unwrap_or_default();
		let mut pairs = Vec::with_capacity(symbols.len() * timeframes.len());
		for symbol in &symbols {
			for timeframe in &timeframes {
				pairs.push((symbol.clone(), timeframe.clone()));
			}
		}
		let _ = self.subscriptions.send(pairs);
	}

	/// Fleet leaderboard: each agent's latest decision record merged with its
	/// live status when the agent is running, sorted by PnL percent
	/// descending. Cached briefly to bound query cost.
	pub async fn get_competition_data(&self) -> Result<Value> {
		{
			let cache = self.competition_cache.lock().await;
			if let Some((at, value)) = cache.as_ref() {
				if at.elapsed() < COMPETITION_CACHE_TTL {
					return Ok(value.clone());
				}
			}
		}

		let mut entries = Vec::new();
		for record in self.store.get_all_traders()? {
			let latest = self.store.get_latest_decision(&record.id)?;
			let live = self.live_status(&record.id).await;

			let (equity, wallet, unrealized, margin_used) = match (&live, &latest) {
				(Some(live), _) => (
					live.total_equity,
					live.wallet_balance,
					live.unrealized_pnl,
					live.margin_used,
				),
				(None, Some(latest)) => (
					latest.account.total_equity,
					latest.account.wallet_balance,
					latest.account.unrealized_pnl,
					latest.account.margin_used,
				),
				(None, None) => (0.0, 0.0, 0.0, 0.0),
			};
			let baseline = record.initial_balance;
			let pnl_percent = if baseline > 0.0 {
				(equity - baseline) / baseline * 100.0
			} else {
				0.0
			};

			entries.push(json!({
				"trader_id": record.id,
				"name": record.name,
				"is_running": self.is_running(&record.id).await,
				"total_equity": equity,
				"wallet_balance": wallet,
				"unrealized_pnl": unrealized,
				"margin_used": margin_used,
				"initial_balance": baseline,
				"pnl_percent": pnl_percent,
				"cycle_number": latest.as_ref().map(|l| l.cycle_number).unwrap_or(0),
				"last_cycle_at": latest.as_ref().map(|l| l.timestamp.to_rfc3339()),
			}));
		}
		entries.sort_by(|a, b| {
			let pa = a["pnl_percent"].as_f64().unwrap_or(0.0);
			let pb = b["pnl_percent"].as_f64().unwrap_or(0.0);
			pb.partial_cmp(&pa).unwrap_or(std::cmp::Ordering::Equal)
		});
		let value = Value::Array(entries);

		*self.competition_cache.lock().await = Some((Instant::now(), value.clone()));
		Ok(value)
	}

	pub async fn get_top_traders_data(&self, limit: usize) -> Result<Value> {
		let competition = self.get_competition_data().await?;
		let top: Vec<Value> = competition
			.as_array()
			.cloned()
			.unwrap_or_default()
			.into_iter()
			.take(limit)
			.collect();
		Ok(Value::Array(top))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		market::{CandleCache, MarketDataHub},
		store::test_fixtures::create_fixture_trader,
		store::test_utils::test_store,
	};

	async fn test_manager(store: &Store) -> Arc<TraderManager> {
		let hub = MarketDataHub::new(vec![], CandleCache::default());
		let templates =
			Arc::new(TemplateStore::load(std::path::PathBuf::from("/nonexistent")).unwrap());
		let (subscriptions, _rx) = watch::channel(Vec::new());
		TraderManager::new(store.clone(), hub, templates, subscriptions)
	}

	#[tokio::test]
	async fn start_stop_round_trip() {
		let store = test_store();
		let trader = create_fixture_trader(&store, "default");
		let manager = test_manager(&store).await;

		manager.start("default", &trader.id).await.unwrap();
		assert!(manager.is_running(&trader.id).await);
		assert!(store.get_trader_config("default", &trader.id).unwrap().unwrap().is_running);

		manager.stop("default", &trader.id).await.unwrap();
		assert!(!manager.is_running(&trader.id).await);
		assert!(!store.get_trader_config("default", &trader.id).unwrap().unwrap().is_running);
		assert_eq!(manager.running_count().await, 0);
	}

	#[tokio::test]
	async fn stop_is_idempotent_and_scoped_to_owner() {
		let store = test_store();
		let trader = create_fixture_trader(&store, "default");
		let manager = test_manager(&store).await;

		// Stopping a never-started agent only clears the flag
		manager.stop("default", &trader.id).await.unwrap();
		assert!(!manager.is_running(&trader.id).await);

		manager.start("default", &trader.id).await.unwrap();
		assert!(manager.stop("someone-else", &trader.id).await.is_err());
		manager.stop("default", &trader.id).await.unwrap();
	}

	#[tokio::test]
	async fn competition_data_covers_all_traders() {
		let store = test_store();
		let trader = create_fixture_trader(&store, "default");
		let manager = test_manager(&store).await;

		let competition = manager.get_competition_data().await.unwrap();
		let entries = competition.as_array().unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0]["trader_id"], trader.id.as_str());
		assert_eq!(entries[0]["is_running"], false);
	}

	#[tokio::test]
	async fn stop_all_drains_registry() {
		let store = test_store();
		let trader = create_fixture_trader(&store, "default");
		let manager = test_manager(&store).await;
		manager.start("default", &trader.id).await.unwrap();
		manager.stop_all().await;
		assert_eq!(manager.running_count().await, 0);
	}
}
