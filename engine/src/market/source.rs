use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use super::Kline;
use crate::constants::KLINE_REQUEST_TIMEOUT;

/// A named candle source. Sources are tried in registration order by the hub;
/// unhealthy ones are demoted until their next passing health check.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KlineSource: Send + Sync {
	fn name(&self) -> &'static str;

	async fn get_klines(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Kline>>;

	/// Latest traded price for the symbol.
	async fn get_price(&self, symbol: &str) -> Result<f64>;

	async fn health_check(&self) -> Result<()>;
}

fn parse_f64(value: &Value) -> Result<f64> {
	match value {
		Value::String(s) => s.parse().context("numeric string"),
		Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("number out of range")),
		other => bail!("expected number, got {other}"),
	}
}

// ===== Binance USD-M futures =====

pub struct BinanceKlineSource {
	client: reqwest::Client,
	base_url: String,
}

impl Default for BinanceKlineSource {
	fn default() -> Self {
		Self::new("https://fapi.binance.com")
	}
}

impl BinanceKlineSource {
	pub fn new(base_url: &str) -> Self {
		Self {
			client: reqwest::Client::builder()
				.timeout(KLINE_REQUEST_TIMEOUT)
				.build()
				.expect("reqwest client with static config"),
			base_url: base_url.trim_end_matches('/').to_string(),
		}
	}
}

#[async_trait]
impl KlineSource for BinanceKlineSource {
	fn name(&self) -> &'static str {
		"binance"
	}

	async fn get_klines(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Kline>> {
		let rows: Vec<Vec<Value>> = self
			.client
			.get(format!("{}/fapi/v1/klines", self.base_url))
			.query(&[
				("symbol", symbol),
				("interval", timeframe),
				("limit", &limit.to_string()),
			])
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;

		rows.iter()
			.map(|row| {
				if row.len() < 7 {
					bail!("kline row too short: {row:?}");
				}
				Ok(Kline {
					open_time: row[0].as_i64().ok_or_else(|| anyhow!("bad open time"))?,
					open: parse_f64(&row[1])?,
					high: parse_f64(&row[2])?,
					low: parse_f64(&row[3])?,
					close: parse_f64(&row[4])?,
					volume: parse_f64(&row[5])?,
					close_time: row[6].as_i64().ok_or_else(|| anyhow!("bad close time"))?,
				})
			})
			.collect()
	}

	async fn get_price(&self, symbol: &str) -> Result<f64> {
		let ticker: Value = self
			.client
			.get(format!("{}/fapi/v1/ticker/price", self.base_url))
			.query(&[("symbol", symbol)])
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		parse_f64(&ticker["price"]).with_context(|| format!("ticker for {symbol}"))
	}

	async fn health_check(&self) -> Result<()> {
		self.client
			.get(format!("{}/fapi/v1/ping", self.base_url))
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}
}

// ===== OKX perpetual swaps (fallback) =====

pub struct OkxKlineSource {
	client: reqwest::Client,
	base_url: String,
}

impl Default for OkxKlineSource {
	fn default() -> Self {
		Self::new("https://www.okx.com")
	}
}

impl OkxKlineSource {
	pub fn new(base_url: &str) -> Self {
		Self {
			client: reqwest::Client::builder()
				.timeout(KLINE_REQUEST_TIMEOUT)
				.build()
				.expect("reqwest client with static config"),
			base_url: base_url.trim_end_matches('/').to_string(),
		}
	}

	/// `BTCUSDT` -> `BTC-USDT-SWAP`
	fn instrument(symbol: &str) -> String {
		match symbol.strip_suffix("USDT") {
			Some(base) if !base.is_empty() => format!("{base}-USDT-SWAP"),
			_ => symbol.to_string(),
		}
	}

	/// OKX spells hour-and-up bars in uppercase.
	fn bar(timeframe: &str) -> String {
		if timeframe.ends_with('h') || timeframe.ends_with('d') || timeframe.ends_with('w') {
			timeframe.to_uppercase()
		} else {
			timeframe.to_string()
		}
	}
}

#[async_trait]
impl KlineSource for OkxKlineSource {
	fn name(&self) -> &'static str {
		"okx"
	}

	async fn get_klines(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Kline>> {
		let body: Value = self
			.client
			.get(format!("{}/api/v5/market/candles", self.base_url))
			.query(&[
				("instId", Self::instrument(symbol).as_str()),
				("bar", Self::bar(timeframe).as_str()),
				("limit", &limit.to_string()),
			])
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;

		if body["code"].as_str() != Some("0") {
			bail!("okx error: {}", body["msg"].as_str().unwrap_or("unknown"));
		}

		let rows = body["data"].as_array().ok_or_else(|| anyhow!("missing data array"))?;
		let mut klines = rows
			.iter()
			.map(|row| {
				let row = row.as_array().ok_or_else(|| anyhow!("bad candle row"))?;
				if row.len() < 6 {
					bail!("candle row too short");
				}
				let open_time: i64 =
					row[0].as_str().ok_or_else(|| anyhow!("bad ts"))?.parse()?;
				Ok(Kline {
					open_time,
					open: parse_f64(&row[1])?,
					high: parse_f64(&row[2])?,
					low: parse_f64(&row[3])?,
					close: parse_f64(&row[4])?,
					volume: parse_f64(&row[5])?,
					close_time: open_time + timeframe_millis(timeframe) - 1,
				})
			})
			.collect::<Result<Vec<Kline>>>()?;

		// OKX returns newest first
		klines.reverse();
		Ok(klines)
	}

	async fn get_price(&self, symbol: &str) -> Result<f64> {
		let body: Value = self
			.client
			.get(format!("{}/api/v5/market/ticker", self.base_url))
			.query(&[("instId", Self::instrument(symbol).as_str())])
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;
		let last = &body["data"][0]["last"];
		parse_f64(last).with_context(|| format!("ticker for {symbol}"))
	}

	async fn health_check(&self) -> Result<()> {
		self.client
			.get(format!("{}/api/v5/public/time", self.base_url))
			.send()
			.await?
			.error_for_status()?;
		Ok(())
	}
}

/// Duration of one candle in milliseconds.
pub fn timeframe_millis(timeframe: &str) -> i64 {
	let (value, unit) = timeframe.split_at(timeframe.len().saturating_sub(1));
	let value: i64 = value.parse().unwrap_or(1);
	match unit {
		"m" => value * 60_000,
		"h" => value * 3_600_000,
		"d" => value * 86_400_000,
		"w" => value * 7 * 86_400_000,
		_ => 60_000,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn okx_symbol_mapping() {
		assert_eq!(OkxKlineSource::instrument("BTCUSDT"), "BTC-USDT-SWAP");
		assert_eq!(OkxKlineSource::instrument("SOLUSDT"), "SOL-USDT-SWAP");
		assert_eq!(OkxKlineSource::instrument("WEIRD"), "WEIRD");
	}

	#[test]
	fn okx_bar_mapping() {
		assert_eq!(OkxKlineSource::bar("15m"), "15m");
		assert_eq!(OkxKlineSource::bar("1h"), "1H");
		assert_eq!(OkxKlineSource::bar("4h"), "4H");
		assert_eq!(OkxKlineSource::bar("1d"), "1D");
	}

	#[test]
	fn timeframe_durations() {
		assert_eq!(timeframe_millis("1m"), 60_000);
		assert_eq!(timeframe_millis("15m"), 900_000);
		assert_eq!(timeframe_millis("4h"), 14_400_000);
	}
}
