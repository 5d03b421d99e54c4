use futures_util::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::{
	collections::HashMap,
	sync::Arc,
	time::{Duration, Instant},
};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::Kline;
use crate::constants::CANDLE_CACHE_STALENESS;

const MAX_CACHED_CANDLES: usize = 500;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct CachedSeries {
	klines: Vec<Kline>,
	updated_at: Instant,
}

/// In-memory candle series keyed by (symbol, timeframe), fed by the websocket
/// monitor and consulted by the REST facade before any HTTP call.
#[derive(Clone, Default)]
pub struct CandleCache {
	inner: Arc<RwLock<HashMap<(String, String), CachedSeries>>>,
}

impl CandleCache {
	/// A warm series with enough candles, or nothing.
	pub fn get(&self, symbol: &str, timeframe: &str, limit: u32) -> Option<Vec<Kline>> {
		let inner = self.inner.read();
		let series = inner.get(&(symbol.to_string(), timeframe.to_string()))?;
		if series.updated_at.elapsed() > CANDLE_CACHE_STALENESS {
			return None;
		}
		let limit = limit as usize;
		if series.klines.len() < limit {
			return None;
		}
		Some(series.klines[series.klines.len() - limit..].to_vec())
	}

	/// Seed a series from a REST snapshot.
	pub fn replace_series(&self, symbol: &str, timeframe: &str, klines: Vec<Kline>) {
		self.inner.write().insert(
			(symbol.to_string(), timeframe.to_string()),
			CachedSeries { klines, updated_at: Instant::now() },
		);
	}

	/// Merge one streamed candle. The newest candle updates in place until its
	/// open time moves forward.
	pub fn upsert(&self, symbol: &str, timeframe: &str, kline: Kline) {
		let mut inner = self.inner.write();
		let series = inner
			.entry((symbol.to_string(), timeframe.to_string()))
			.or_insert_with(|| CachedSeries { klines: Vec::new(), updated_at: Instant::now() });

		match series.klines.last_mut() {
			Some(last) if last.open_time == kline.open_time => *last = kline,
			Some(last) if last.open_time > kline.open_time => {
				// Out-of-order frame, drop it
				debug!(symbol, timeframe, "Dropping stale websocket candle");
			},
			_ => {
				series.klines.push(kline);
				if series.klines.len() > MAX_CACHED_CANDLES {
					let excess = series.klines.len() - MAX_CACHED_CANDLES;
					series.klines.drain(..excess);
				}
			},
		}
		series.updated_at = Instant::now();
	}
}

/// Subscribes to the union of (symbol, timeframe) pairs of running agents and
/// keeps the candle cache warm. Reconnects when the subscription set changes.
pub struct CandleStreamMonitor {
	cache: CandleCache,
	ws_url: String,
	subscriptions: watch::Receiver<Vec<(String, String)>>,
}

impl CandleStreamMonitor {
	pub fn new(
		cache: CandleCache,
		subscriptions: watch::Receiver<Vec<(String, String)>>,
	) -> Self {
		Self { cache, ws_url: "wss://fstream.binance.com/stream".to_string(), subscriptions }
	}

	fn stream_url(&self, pairs: &[(String, String)]) -> String {
		let streams = pairs
			.iter()
			.map(|(symbol, timeframe)| {
				format!("{}@kline_{}", symbol.to_lowercase(), timeframe)
			})
			.collect::<Vec<_>>()
			.join("/");
		format!("{}?streams={}", self.ws_url, streams)
	}

	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
		loop {
			let pairs = self.subscriptions.borrow().clone();
			if pairs.is_empty() {
				tokio::select! {
					result = self.subscriptions.changed() => {
						if result.is_err() {
							return;
						}
					},
					_ = shutdown.changed() => return,
				}
				continue;
			}

			let url = self.stream_url(&pairs);
			let stream = match connect_async(url.as_str()).await {
				Ok((stream, _)) => stream,
				Err(error) => {
					warn!(%error, "Candle stream connect failed, retrying");
					tokio::select! {
						_ = tokio::time::sleep(RECONNECT_DELAY) => continue,
						_ = shutdown.changed() => return,
					}
				},
			};
			info!(streams = pairs.len(), "Candle stream connected");
			let (_, mut read) = stream.split();

			loop {
				tokio::select! {
					message = read.next() => match message {
						Some(Ok(Message::Text(text))) => self.handle_frame(&text),
						Some(Ok(_)) => {},
						Some(Err(error)) => {
							warn!(%error, "Candle stream read failed, reconnecting");
							break;
						},
						None => {
							warn!("Candle stream closed, reconnecting");
							break;
						},
					},
					result = self.subscriptions.changed() => {
						if result.is_err() {
							return;
						}
						info!("Subscription set changed, reconnecting candle stream");
						break;
					},
					_ = shutdown.changed() => return,
				}
			}
		}
	}

	fn handle_frame(&self, text: &str) {
		let Ok(frame) = serde_json::from_str::<Value>(text) else {
			return;
		};
		let data = &frame["data"];
		if data["e"].as_str() != Some("kline") {
			return;
		}
		let k = &data["k"];
		let (Some(symbol), Some(timeframe)) = (k["s"].as_str(), k["i"].as_str()) else {
			return;
		};
		let parse = |v: &Value| v.as_str().and_then(|s| s.parse::<f64>().ok());
		let (Some(open), Some(high), Some(low), Some(close), Some(volume)) =
			(parse(&k["o"]), parse(&k["h"]), parse(&k["l"]), parse(&k["c"]), parse(&k["v"]))
		else {
			return;
		};
		let (Some(open_time), Some(close_time)) = (k["t"].as_i64(), k["T"].as_i64()) else {
			return;
		};

		self.cache.upsert(
			symbol,
			timeframe,
			Kline { open_time, open, high, low, close, volume, close_time },
		);
	}
}
