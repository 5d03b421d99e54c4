//! Binance USD-M futures adapter. HMAC-SHA256 signed queries, per-symbol
//! precision cache loaded from exchange metadata on first use.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use super::{
	order_strategy::OrderSubmission,
	precision::{format_price_with, format_quantity_with, PrecisionCache, SymbolPrecision},
	Balance, ExchangeType, OrderFill, OrderSide, Position, Trader,
};
use crate::{
	constants::VENUE_REQUEST_TIMEOUT,
	errors::VenueError,
	store::TradeSide,
};

const MAINNET_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";
const RECV_WINDOW: &str = "5000";

pub struct BinanceTrader {
	client: reqwest::Client,
	base_url: String,
	api_key: String,
	secret_key: String,
	precision: PrecisionCache,
}

enum Method {
	Get,
	Post,
	Delete,
}

fn venue_error(status: reqwest::StatusCode, body: &str) -> VenueError {
	// Binance error bodies are {"code": -xxxx, "msg": "..."}
	let code = serde_json::from_str::<Value>(body)
		.ok()
		.and_then(|v| v["code"].as_i64())
		.unwrap_or(0);
	match code {
		-1021 => VenueError::Retryable(format!("timestamp outside recvWindow: {body}")),
		-1003 | -1015 => VenueError::Retryable(format!("rate limited: {body}")),
		-1022 | -2014 | -2015 => VenueError::Auth(body.to_string()),
		-2019 | -4164 | -1111 | -1013 => VenueError::Business(body.to_string()),
		-4046 | -4059 => {
			// "No need to change margin type" / position side: already as requested
			VenueError::Business(format!("noop:{body}"))
		},
		_ => VenueError::classify(status, body),
	}
}

impl BinanceTrader {
	pub fn new(api_key: &str, secret_key: &str, testnet: bool) -> Self {
		Self {
			client: reqwest::Client::builder()
				.timeout(VENUE_REQUEST_TIMEOUT)
				.build()
				.expect("reqwest client with static config"),
			base_url: if testnet { TESTNET_URL } else { MAINNET_URL }.to_string(),
			api_key: api_key.to_string(),
			secret_key: secret_key.to_string(),
			precision: PrecisionCache::default(),
		}
	}

	fn sign(&self, query: &str) -> String {
		let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
			.expect("HMAC accepts any key length");
		mac.update(query.as_bytes());
		hex::encode(mac.finalize().into_bytes())
	}

	async fn public_request(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, VenueError> {
		let response = self
			.client
			.get(format!("{}{path}", self.base_url))
			.query(params)
			.send()
			.await?;
		let status = response.status();
		let body = response.text().await?;
		if !status.is_success() {
			return Err(venue_error(status, &body));
		}
		serde_json::from_str(&body).map_err(|e| VenueError::Retryable(e.to_string()))
	}

	async fn signed_request(
		&self,
		method: Method,
		path: &str,
		params: &[(&str, String)],
	) -> Result<Value, VenueError> {
		let timestamp = chrono::Utc::now().timestamp_millis().to_string();
		let mut query = params
			.iter()
			.map(|(k, v)| format!("{k}={v}"))
			.collect::<Vec<_>>()
			.join("&");
		if !query.is_empty() {
			query.push('&');
		}
		query.push_str(&format!("recvWindow={RECV_WINDOW}&timestamp={timestamp}"));
		let signature = self.sign(&query);
		let url = format!("{}{path}?{query}&signature={signature}", self.base_url);

		let request = match method {
			Method::Get => self.client.get(url),
			Method::Post => self.client.post(url),
			Method::Delete => self.client.delete(url),
		};
		let response = request.header("X-MBX-APIKEY", &self.api_key).send().await?;
		let status = response.status();
		let body = response.text().await?;
		if !status.is_success() {
			return Err(venue_error(status, &body));
		}
		serde_json::from_str(&body).map_err(|e| VenueError::Retryable(e.to_string()))
	}

	/// Load the symbol's filters from exchangeInfo into the cache on first use.
	async fn symbol_precision(&self, symbol: &str) -> Result<SymbolPrecision, VenueError> {
		if let Some(precision) = self.precision.get(symbol) {
			return Ok(precision);
		}

		let info = self.public_request("/fapi/v1/exchangeInfo", &[]).await?;
		let Some(symbols) = info["symbols"].as_array() else {
			return Err(VenueError::Retryable("exchangeInfo without symbols".to_string()));
		};
		for entry in symbols {
			let Some(name) = entry["symbol"].as_str() else { continue };
			let mut precision = SymbolPrecision {
				price_precision: entry["pricePrecision"].as_u64().unwrap_or(2) as u32,
				quantity_precision: entry["quantityPrecision"].as_u64().unwrap_or(3) as u32,
				..Default::default()
			};
			if let Some(filters) = entry["filters"].as_array() {
				for filter in filters {
					match filter["filterType"].as_str() {
						Some("PRICE_FILTER") =>
							if let Some(tick) =
								filter["tickSize"].as_str().and_then(|s| s.parse().ok())
							{
								precision.tick_size = tick;
							},
						Some("LOT_SIZE") =>
							if let Some(step) =
								filter["stepSize"].as_str().and_then(|s| s.parse().ok())
							{
								precision.step_size = step;
							},
						_ => {},
					}
				}
			}
			self.precision.insert(name, precision);
		}

		self.precision.get(symbol).ok_or_else(|| {
			VenueError::Business(format!("symbol {symbol} unknown to the venue"))
		})
	}

	async fn place_order(&self, params: &[(&str, String)]) -> Result<Value, VenueError> {
		self.signed_request(Method::Post, "/fapi/v1/order", params).await
	}

	async fn open_orders(&self, symbol: &str) -> Result<Vec<Value>, VenueError> {
		let orders = self
			.signed_request(
				Method::Get,
				"/fapi/v1/openOrders",
				&[("symbol", symbol.to_string())],
			)
			.await?;
		Ok(orders.as_array().cloned().unwrap_or_default())
	}

	async fn cancel_orders_of_types(
		&self,
		symbol: &str,
		types: &[&str],
	) -> Result<(), VenueError> {
		for order in self.open_orders(symbol).await? {
			let order_type = order["type"].as_str().unwrap_or("");
			if !types.contains(&order_type) {
				continue;
			}
			if let Some(order_id) = order["orderId"].as_i64() {
				self.signed_request(
					Method::Delete,
					"/fapi/v1/order",
					&[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
				)
				.await?;
			}
		}
		Ok(())
	}

	async fn market_order(
		&self,
		symbol: &str,
		side: OrderSide,
		quantity: f64,
		reduce_only: bool,
	) -> Result<OrderFill, VenueError> {
		let formatted = self.format_quantity(symbol, quantity).await?;
		let mut params = vec![
			("symbol", symbol.to_string()),
			("side", side.as_str().to_string()),
			("type", "MARKET".to_string()),
			("quantity", formatted),
			("newOrderRespType", "RESULT".to_string()),
		];
		if reduce_only {
			params.push(("reduceOnly", "true".to_string()));
		}
		let response = self.place_order(&params).await?;
		let executed = response["executedQty"]
			.as_str()
			.and_then(|s| s.parse().ok())
			.unwrap_or(quantity);
		let avg_price = response["avgPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
		Ok(OrderFill {
			symbol: symbol.to_string(),
			side,
			quantity: executed,
			avg_price,
			order_id: response["orderId"].as_i64().unwrap_or_default().to_string(),
		})
	}

	/// Place one protective stop order after removing any existing ones of the
	/// same kind for the symbol.
	async fn upsert_trigger_order(
		&self,
		symbol: &str,
		side: TradeSide,
		quantity: f64,
		price: f64,
		order_type: &str,
	) -> Result<(), VenueError> {
		self.cancel_orders_of_types(symbol, &[order_type]).await?;

		let precision = self.symbol_precision(symbol).await?;
		let params = vec![
			("symbol", symbol.to_string()),
			("side", OrderSide::closing(side).as_str().to_string()),
			("type", order_type.to_string()),
			("stopPrice", format_price_with(&precision, price)?),
			("quantity", format_quantity_with(&precision, quantity)?),
			("reduceOnly", "true".to_string()),
			("workingType", "MARK_PRICE".to_string()),
		];
		self.place_order(&params).await?;
		Ok(())
	}
}

#[async_trait]
impl Trader for BinanceTrader {
	fn exchange_type(&self) -> ExchangeType {
		ExchangeType::Binance
	}

	async fn get_balance(&self) -> Result<Balance, VenueError> {
		let balances = self.signed_request(Method::Get, "/fapi/v2/balance", &[]).await?;
		let Some(entries) = balances.as_array() else {
			return Err(VenueError::Retryable("balance response not an array".to_string()));
		};
		for entry in entries {
			if entry["asset"].as_str() == Some("USDT") {
				let get = |key: &str| {
					entry[key].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0)
				};
				return Ok(Balance {
					wallet_balance: get("balance"),
					unrealized_pnl: get("crossUnPnl"),
					available: get("availableBalance"),
				});
			}
		}
		Ok(Balance::default())
	}

	async fn get_positions(&self) -> Result<Vec<Position>, VenueError> {
		let response =
			self.signed_request(Method::Get, "/fapi/v2/positionRisk", &[]).await?;
		let Some(entries) = response.as_array() else {
			return Err(VenueError::Retryable("positionRisk response not an array".to_string()));
		};
		let mut positions = Vec::new();
		for entry in entries {
			let get = |key: &str| {
				entry[key].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0)
			};
			let amount = get("positionAmt");
			if amount == 0.0 {
				continue;
			}
			positions.push(Position {
				symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
				side: if amount > 0.0 { TradeSide::Long } else { TradeSide::Short },
				quantity: amount.abs(),
				entry_price: get("entryPrice"),
				mark_price: get("markPrice"),
				unrealized_pnl: get("unRealizedProfit"),
				leverage: get("leverage"),
				liquidation_price: get("liquidationPrice"),
			});
		}
		Ok(positions)
	}

	async fn get_market_price(&self, symbol: &str) -> Result<f64, VenueError> {
		let ticker =
			self.public_request("/fapi/v1/ticker/price", &[("symbol", symbol)]).await?;
		ticker["price"]
			.as_str()
			.and_then(|s| s.parse().ok())
			.ok_or_else(|| VenueError::Retryable(format!("no price for {symbol}")))
	}

	async fn open_long(
		&self,
		symbol: &str,
		quantity: f64,
		_leverage: f64,
	) -> Result<OrderFill, VenueError> {
		self.market_order(symbol, OrderSide::Buy, quantity, false).await
	}

	async fn open_short(
		&self,
		symbol: &str,
		quantity: f64,
		_leverage: f64,
	) -> Result<OrderFill, VenueError> {
		self.market_order(symbol, OrderSide::Sell, quantity, false).await
	}

	async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderFill, VenueError> {
		self.market_order(symbol, OrderSide::Sell, quantity, true).await
	}

	async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderFill, VenueError> {
		self.market_order(symbol, OrderSide::Buy, quantity, true).await
	}

	async fn set_stop_loss(
		&self,
		symbol: &str,
		side: TradeSide,
		quantity: f64,
		price: f64,
	) -> Result<(), VenueError> {
		self.upsert_trigger_order(symbol, side, quantity, price, "STOP_MARKET").await
	}

	async fn set_take_profit(
		&self,
		symbol: &str,
		side: TradeSide,
		quantity: f64,
		price: f64,
	) -> Result<(), VenueError> {
		self.upsert_trigger_order(symbol, side, quantity, price, "TAKE_PROFIT_MARKET").await
	}

	async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), VenueError> {
		self.cancel_orders_of_types(symbol, &["STOP_MARKET"]).await
	}

	async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), VenueError> {
		self.cancel_orders_of_types(symbol, &["TAKE_PROFIT_MARKET"]).await
	}

	async fn cancel_stop_orders(&self, symbol: &str) -> Result<(), VenueError> {
		self.cancel_orders_of_types(symbol, &["STOP_MARKET", "TAKE_PROFIT_MARKET"]).await
	}

	async fn cancel_all_orders(&self, symbol: &str) -> Result<(), VenueError> {
		self.signed_request(
			Method::Delete,
			"/fapi/v1/allOpenOrders",
			&[("symbol", symbol.to_string())],
		)
		.await?;
		Ok(())
	}

	async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<(), VenueError> {
		self.signed_request(
			Method::Post,
			"/fapi/v1/leverage",
			&[
				("symbol", symbol.to_string()),
				("leverage", (leverage.max(1.0) as i64).to_string()),
			],
		)
		.await?;
		Ok(())
	}

	async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<(), VenueError> {
		let result = self
			.signed_request(
				Method::Post,
				"/fapi/v1/marginType",
				&[
					("symbol", symbol.to_string()),
					("marginType", if is_cross { "CROSSED" } else { "ISOLATED" }.to_string()),
				],
			)
			.await;
		match result {
			Ok(_) => Ok(()),
			// Already in the requested mode
			Err(VenueError::Business(message)) if message.starts_with("noop:") => Ok(()),
			Err(error) => Err(error),
		}
	}

	async fn format_quantity(&self, symbol: &str, quantity: f64) -> Result<String, VenueError> {
		let precision = self.symbol_precision(symbol).await?;
		format_quantity_with(&precision, quantity)
	}

	fn order_submission(&self) -> Option<&dyn OrderSubmission> {
		Some(self)
	}
}

#[async_trait]
impl OrderSubmission for BinanceTrader {
	async fn submit_market(
		&self,
		symbol: &str,
		side: OrderSide,
		quantity: f64,
		reduce_only: bool,
	) -> Result<OrderFill, VenueError> {
		self.market_order(symbol, side, quantity, reduce_only).await
	}

	async fn submit_post_only_limit(
		&self,
		symbol: &str,
		side: OrderSide,
		quantity: f64,
		price: f64,
		reduce_only: bool,
	) -> Result<String, VenueError> {
		let precision = self.symbol_precision(symbol).await?;
		let mut params = vec![
			("symbol", symbol.to_string()),
			("side", side.as_str().to_string()),
			("type", "LIMIT".to_string()),
			// GTX: post-only, rejected instead of crossing the book
			("timeInForce", "GTX".to_string()),
			("price", format_price_with(&precision, price)?),
			("quantity", format_quantity_with(&precision, quantity)?),
		];
		if reduce_only {
			params.push(("reduceOnly", "true".to_string()));
		}
		let response = self.place_order(&params).await?;
		Ok(response["orderId"].as_i64().unwrap_or_default().to_string())
	}

	async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError> {
		self.signed_request(
			Method::Delete,
			"/fapi/v1/order",
			&[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
		)
		.await?;
		Ok(())
	}

	async fn filled_quantity(&self, symbol: &str, order_id: &str) -> Result<f64, VenueError> {
		let order = self
			.signed_request(
				Method::Get,
				"/fapi/v1/order",
				&[("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
			)
			.await?;
		Ok(order["executedQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0))
	}

	async fn mid_price(&self, symbol: &str) -> Result<f64, VenueError> {
		let book = self
			.public_request("/fapi/v1/ticker/bookTicker", &[("symbol", symbol)])
			.await?;
		let bid = book["bidPrice"].as_str().and_then(|s| s.parse::<f64>().ok());
		let ask = book["askPrice"].as_str().and_then(|s| s.parse::<f64>().ok());
		match (bid, ask) {
			(Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 => Ok((bid + ask) / 2.0),
			_ => self.get_market_price(symbol).await,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signature_matches_reference_vector() {
		// Vector from the Binance API documentation
		let trader = BinanceTrader::new(
			"vmPUZE6mv9SD5VNHk4HlWFsOr6aKE2zvsw0MuIgwCIPy6utIco14y7Ju91duEh8A",
			"NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j",
			false,
		);
		let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
		assert_eq!(
			trader.sign(query),
			"c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
		);
	}

	#[test]
	fn error_mapping() {
		let rate_limited = venue_error(
			reqwest::StatusCode::IM_A_TEAPOT,
			r#"{"code":-1003,"msg":"Too many requests."}"#,
		);
		assert!(rate_limited.is_retryable());

		assert!(matches!(
			venue_error(
				reqwest::StatusCode::UNAUTHORIZED,
				r#"{"code":-2015,"msg":"Invalid API-key."}"#
			),
			VenueError::Auth(_)
		));

		assert!(matches!(
			venue_error(
				reqwest::StatusCode::BAD_REQUEST,
				r#"{"code":-2019,"msg":"Margin is insufficient."}"#
			),
			VenueError::Business(_)
		));
	}

	#[test]
	fn testnet_base_url() {
		let trader = BinanceTrader::new("k", "s", true);
		assert_eq!(trader.base_url, TESTNET_URL);
	}
}
