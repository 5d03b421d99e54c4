//! Lighter perp adapter. Identification is the L1 wallet; order signing uses
//! the venue's separate API key schedule. Without that key the adapter runs
//! in reduced V1 mode: account, position and price reads are live, mutating
//! calls are refused with a business error naming the missing key.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

use super::{
	precision::{format_quantity_with, SymbolPrecision},
	Balance, ExchangeType, OrderFill, Position, Trader,
};
use crate::{constants::VENUE_REQUEST_TIMEOUT, errors::VenueError, store::TradeSide};

const BASE_URL: &str = "https://mainnet.zklighter.elliot.ai";

pub struct LighterTrader {
	client: reqwest::Client,
	wallet: String,
	api_private_key: String,
	account_index: i64,
	markets: RwLock<HashMap<String, SymbolPrecision>>,
}

fn coin_of(symbol: &str) -> &str {
	symbol.strip_suffix("USDT").unwrap_or(symbol)
}

impl LighterTrader {
	pub fn new(wallet: &str, api_private_key: &str, account_index: i64) -> Self {
		Self {
			client: reqwest::Client::builder()
				.timeout(VENUE_REQUEST_TIMEOUT)
				.build()
				.expect("reqwest client with static config"),
			wallet: wallet.to_string(),
			api_private_key: api_private_key.to_string(),
			account_index,
			markets: RwLock::new(HashMap::new()),
		}
	}

	fn v1_mode(&self) -> bool {
		self.api_private_key.is_empty()
	}

	/// Every mutation funnels through here until the order-signing key
	/// schedule is wired up; V1 installs never have the key at all.
	fn refuse_mutation(&self, operation: &str) -> VenueError {
		if self.v1_mode() {
			VenueError::Business(format!(
				"{operation} unavailable: running in V1 mode without an order-signing API key"
			))
		} else {
			VenueError::Business(format!(
				"{operation} unavailable: order signing for this venue requires the \
				 venue SDK key schedule"
			))
		}
	}

	async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, VenueError> {
		let response = self
			.client
			.get(format!("{BASE_URL}{path}"))
			.query(params)
			.send()
			.await?;
		let status = response.status();
		let body = response.text().await?;
		if !status.is_success() {
			return Err(VenueError::classify(status, &body));
		}
		serde_json::from_str(&body).map_err(|e| VenueError::Retryable(e.to_string()))
	}

	async fn account(&self) -> Result<Value, VenueError> {
		let (by, value) = if self.account_index > 0 {
			("index", self.account_index.to_string())
		} else {
			("l1_address", self.wallet.clone())
		};
		let response = self
			.get("/api/v1/account", &[("by", by.to_string()), ("value", value)])
			.await?;
		response["accounts"][0]
			.as_object()
			.map(|_| response["accounts"][0].clone())
			.ok_or_else(|| VenueError::Auth("account not found on venue".to_string()))
	}

	async fn market_precision(&self, symbol: &str) -> Result<SymbolPrecision, VenueError> {
		let coin = coin_of(symbol);
		if let Some(precision) = self.markets.read().get(coin) {
			return Ok(*precision);
		}
		let details = self.get("/api/v1/orderBookDetails", &[]).await?;
		{
			let mut markets = self.markets.write();
			for market in details["order_book_details"].as_array().cloned().unwrap_or_default()
			{
				let Some(name) = market["symbol"].as_str() else { continue };
				let size_decimals =
					market["size_decimals"].as_u64().unwrap_or(4) as u32;
				let price_decimals =
					market["price_decimals"].as_u64().unwrap_or(2) as u32;
				markets.insert(
					name.to_string(),
					SymbolPrecision {
						price_precision: price_decimals,
						quantity_precision: size_decimals,
						tick_size: 10f64.powi(-(price_decimals as i32)),
						step_size: 10f64.powi(-(size_decimals as i32)),
					},
				);
			}
		}
		self.markets
			.read()
			.get(coin)
			.copied()
			.ok_or_else(|| VenueError::Business(format!("market {coin} unknown to the venue")))
	}
}

#[async_trait]
impl Trader for LighterTrader {
	fn exchange_type(&self) -> ExchangeType {
		ExchangeType::Lighter
	}

	async fn get_balance(&self) -> Result<Balance, VenueError> {
		let account = self.account().await?;
		let parse = |v: &Value| {
			v.as_str()
				.and_then(|s| s.parse::<f64>().ok())
				.or_else(|| v.as_f64())
				.unwrap_or(0.0)
		};
		let collateral = parse(&account["collateral"]);
		let unrealized: f64 = account["positions"]
			.as_array()
			.map(|positions| {
				positions.iter().map(|p| parse(&p["unrealized_pnl"])).sum()
			})
			.unwrap_or(0.0);
		Ok(Balance {
			wallet_balance: collateral,
			unrealized_pnl: unrealized,
			available: parse(&account["available_balance"]),
		})
	}

	async fn get_positions(&self) -> Result<Vec<Position>, VenueError> {
		let account = self.account().await?;
		let parse = |v: &Value| {
			v.as_str()
				.and_then(|s| s.parse::<f64>().ok())
				.or_else(|| v.as_f64())
				.unwrap_or(0.0)
		};
		let mut positions = Vec::new();
		for position in account["positions"].as_array().cloned().unwrap_or_default() {
			let size = parse(&position["position"]);
			if size == 0.0 {
				continue;
			}
			let coin = position["symbol"].as_str().unwrap_or_default();
			// sign: 1 long, -1 short
			let is_long = position["sign"].as_i64().unwrap_or(1) >= 0;
			positions.push(Position {
				symbol: format!("{coin}USDT"),
				side: if is_long { TradeSide::Long } else { TradeSide::Short },
				quantity: size.abs(),
				entry_price: parse(&position["avg_entry_price"]),
				mark_price: 0.0,
				unrealized_pnl: parse(&position["unrealized_pnl"]),
				leverage: 1.0,
				liquidation_price: parse(&position["liquidation_price"]),
			});
		}
		Ok(positions)
	}

	async fn get_market_price(&self, symbol: &str) -> Result<f64, VenueError> {
		let coin = coin_of(symbol);
		let details = self.get("/api/v1/orderBookDetails", &[]).await?;
		for market in details["order_book_details"].as_array().cloned().unwrap_or_default() {
			if market["symbol"].as_str() == Some(coin) {
				let price = market["last_trade_price"]
					.as_str()
					.and_then(|s| s.parse::<f64>().ok())
					.or_else(|| market["last_trade_price"].as_f64())
					.unwrap_or(0.0);
				if price > 0.0 {
					return Ok(price);
				}
			}
		}
		Err(VenueError::Retryable(format!("no price for {symbol}")))
	}

	async fn open_long(&self, _: &str, _: f64, _: f64) -> Result<OrderFill, VenueError> {
		Err(self.refuse_mutation("open_long"))
	}

	async fn open_short(&self, _: &str, _: f64, _: f64) -> Result<OrderFill, VenueError> {
		Err(self.refuse_mutation("open_short"))
	}

	async fn close_long(&self, _: &str, _: f64) -> Result<OrderFill, VenueError> {
		Err(self.refuse_mutation("close_long"))
	}

	async fn close_short(&self, _: &str, _: f64) -> Result<OrderFill, VenueError> {
		Err(self.refuse_mutation("close_short"))
	}

	async fn set_stop_loss(
		&self,
		_: &str,
		_: TradeSide,
		_: f64,
		_: f64,
	) -> Result<(), VenueError> {
		Err(self.refuse_mutation("set_stop_loss"))
	}

	async fn set_take_profit(
		&self,
		_: &str,
		_: TradeSide,
		_: f64,
		_: f64,
	) -> Result<(), VenueError> {
		Err(self.refuse_mutation("set_take_profit"))
	}

	async fn cancel_stop_loss_orders(&self, _: &str) -> Result<(), VenueError> {
		Ok(())
	}

	async fn cancel_take_profit_orders(&self, _: &str) -> Result<(), VenueError> {
		Ok(())
	}

	async fn cancel_stop_orders(&self, _: &str) -> Result<(), VenueError> {
		Ok(())
	}

	async fn cancel_all_orders(&self, _: &str) -> Result<(), VenueError> {
		Ok(())
	}

	async fn set_leverage(&self, _: &str, _: f64) -> Result<(), VenueError> {
		Err(self.refuse_mutation("set_leverage"))
	}

	async fn set_margin_mode(&self, _: &str, _: bool) -> Result<(), VenueError> {
		Ok(())
	}

	async fn format_quantity(&self, symbol: &str, quantity: f64) -> Result<String, VenueError> {
		let precision = self.market_precision(symbol).await?;
		format_quantity_with(&precision, quantity)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn v1_mode_detection() {
		assert!(LighterTrader::new("0xabc", "", 0).v1_mode());
		assert!(!LighterTrader::new("0xabc", "lighter-key", 3).v1_mode());
	}

	#[tokio::test]
	async fn mutations_are_refused_in_v1_mode() {
		let trader = LighterTrader::new("0xabc", "", 0);
		let error = trader.open_long("BTCUSDT", 0.1, 5.0).await.unwrap_err();
		assert!(matches!(error, VenueError::Business(_)));
		assert!(error.to_string().contains("V1 mode"));
	}
}
