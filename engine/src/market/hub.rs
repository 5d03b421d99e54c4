use anyhow::{bail, Result};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use super::{source::KlineSource, CandleCache, Kline};
use crate::constants::{KLINE_REQUEST_TIMEOUT, SOURCE_HEALTH_INTERVAL};
use nofx_utilities::make_periodic_tick;

/// Facade over the registered kline sources. Sources are tried in priority
/// order; unhealthy ones are demoted until a health poll readmits them. A
/// per-series lock dedupes concurrent identical fetches, and the websocket
/// cache is consulted before any HTTP request.
pub struct MarketDataHub {
	sources: Vec<Arc<dyn KlineSource>>,
	health: RwLock<HashMap<&'static str, bool>>,
	cache: CandleCache,
	flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MarketDataHub {
	pub fn new(sources: Vec<Arc<dyn KlineSource>>, cache: CandleCache) -> Arc<Self> {
		let health = sources.iter().map(|s| (s.name(), true)).collect();
		Arc::new(Self { sources, health: RwLock::new(health), cache, flights: Mutex::new(HashMap::new()) })
	}

	pub fn cache(&self) -> &CandleCache {
		&self.cache
	}

	pub fn is_healthy(&self, name: &str) -> bool {
		self.health.read().get(name).copied().unwrap_or(false)
	}

	/// Candles for one series, newest last. Served from the stream cache when
	/// warm, otherwise fetched from the first healthy source that returns a
	/// non-empty series.
	pub async fn get_klines(
		&self,
		symbol: &str,
		timeframe: &str,
		limit: u32,
	) -> Result<Vec<Kline>> {
		if let Some(cached) = self.cache.get(symbol, timeframe, limit) {
			return Ok(cached);
		}

		// One in-flight fetch per series; followers find the cache warm.
		let flight = self
			.flights
			.lock()
			.await
			.entry(format!("{symbol}:{timeframe}:{limit}"))
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone();
		let _guard = flight.lock().await;

		if let Some(cached) = self.cache.get(symbol, timeframe, limit) {
			return Ok(cached);
		}

		let mut errors = Vec::new();
		for pass_unhealthy in [false, true] {
			for source in &self.sources {
				if self.is_healthy(source.name()) == pass_unhealthy {
					continue;
				}
				match tokio::time::timeout(
					KLINE_REQUEST_TIMEOUT,
					source.get_klines(symbol, timeframe, limit),
				)
				.await
				{
					Ok(Ok(klines)) if !klines.is_empty() => {
						self.cache.replace_series(symbol, timeframe, klines.clone());
						return Ok(klines);
					},
					Ok(Ok(_)) => {
						errors.push(format!("{}: empty series", source.name()));
					},
					Ok(Err(error)) => {
						errors.push(format!("{}: {error}", source.name()));
					},
					Err(_) => {
						errors.push(format!("{}: timed out", source.name()));
					},
				}
			}
		}
		bail!("all kline sources failed for {symbol} {timeframe}: {}", errors.join("; "))
	}

	/// Latest price with the same failover order.
	pub async fn get_price(&self, symbol: &str) -> Result<f64> {
		let mut errors = Vec::new();
		for pass_unhealthy in [false, true] {
			for source in &self.sources {
				if self.is_healthy(source.name()) == pass_unhealthy {
					continue;
				}
				match tokio::time::timeout(KLINE_REQUEST_TIMEOUT, source.get_price(symbol)).await
				{
					Ok(Ok(price)) if price > 0.0 => return Ok(price),
					Ok(Ok(price)) => errors.push(format!("{}: bad price {price}", source.name())),
					Ok(Err(error)) => errors.push(format!("{}: {error}", source.name())),
					Err(_) => errors.push(format!("{}: timed out", source.name())),
				}
			}
		}
		bail!("all price sources failed for {symbol}: {}", errors.join("; "))
	}

	/// Poll every source's health endpoint and demote/readmit accordingly.
	/// Runs for the life of the process.
	pub async fn run_health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut tick = make_periodic_tick(SOURCE_HEALTH_INTERVAL, true);
		loop {
			tokio::select! {
				_ = tick.tick() => {},
				_ = shutdown.changed() => return,
			}

			for source in &self.sources {
				let healthy = matches!(
					tokio::time::timeout(KLINE_REQUEST_TIMEOUT, source.health_check()).await,
					Ok(Ok(()))
				);
				let was_healthy = self.is_healthy(source.name());
				if healthy != was_healthy {
					if healthy {
						info!(source = source.name(), "Kline source recovered");
					} else {
						warn!(source = source.name(), "Kline source demoted");
					}
				}
				self.health.write().insert(source.name(), healthy);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::market::{source::MockKlineSource, tests::kline};

	fn mock_source(name: &'static str) -> MockKlineSource {
		let mut source = MockKlineSource::new();
		source.expect_name().return_const(name);
		source
	}

	#[tokio::test]
	async fn fails_over_to_second_source() {
		// The expectation counts double as the call-count assertions
		let mut primary = mock_source("primary");
		primary
			.expect_get_klines()
			.times(1)
			.returning(|_, _, _| Err(anyhow::anyhow!("node down")));
		primary
			.expect_get_price()
			.times(1)
			.returning(|_| Err(anyhow::anyhow!("node down")));

		let mut backup = mock_source("backup");
		backup
			.expect_get_klines()
			.times(1)
			.returning(|_, _, _| Ok(vec![kline(1, 10.0), kline(2, 11.0)]));
		backup.expect_get_price().times(1).returning(|_| Ok(11.0));

		let hub = MarketDataHub::new(
			vec![Arc::new(primary) as Arc<dyn KlineSource>, Arc::new(backup)],
			CandleCache::default(),
		);

		let series = hub.get_klines("BTCUSDT", "1m", 2).await.unwrap();
		assert_eq!(series.len(), 2);

		let price = hub.get_price("BTCUSDT").await.unwrap();
		assert_eq!(price, 11.0);
	}

	#[tokio::test]
	async fn serves_from_cache_after_first_fetch() {
		let mut source = mock_source("only");
		source
			.expect_get_klines()
			.times(1)
			.returning(|_, _, _| Ok(vec![kline(1, 10.0), kline(2, 11.0)]));

		let hub = MarketDataHub::new(
			vec![Arc::new(source) as Arc<dyn KlineSource>],
			CandleCache::default(),
		);

		hub.get_klines("BTCUSDT", "1m", 2).await.unwrap();
		// The second identical request must be served from the cache; a
		// second source hit would fail the times(1) expectation on drop.
		hub.get_klines("BTCUSDT", "1m", 2).await.unwrap();
	}

	#[tokio::test]
	async fn all_sources_failing_is_an_error() {
		let mut source = mock_source("only");
		source
			.expect_get_klines()
			.returning(|_, _, _| Err(anyhow::anyhow!("node down")));
		source
			.expect_get_price()
			.returning(|_| Err(anyhow::anyhow!("node down")));

		let hub = MarketDataHub::new(
			vec![Arc::new(source) as Arc<dyn KlineSource>],
			CandleCache::default(),
		);
		assert!(hub.get_klines("BTCUSDT", "1m", 2).await.is_err());
		assert!(hub.get_price("BTCUSDT").await.is_err());
	}

	#[tokio::test]
	async fn empty_series_falls_through_to_next_source() {
		let mut primary = mock_source("primary");
		primary.expect_get_klines().times(1).returning(|_, _, _| Ok(Vec::new()));
		let mut backup = mock_source("backup");
		backup
			.expect_get_klines()
			.times(1)
			.returning(|_, _, _| Ok(vec![kline(1, 10.0)]));

		let hub = MarketDataHub::new(
			vec![Arc::new(primary) as Arc<dyn KlineSource>, Arc::new(backup)],
			CandleCache::default(),
		);
		assert_eq!(hub.get_klines("BTCUSDT", "1m", 1).await.unwrap().len(), 1);
	}
}
