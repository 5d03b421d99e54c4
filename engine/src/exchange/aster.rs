//! Aster perp adapter. The REST surface mirrors the CEX-style futures API,
//! but authentication is an ECDSA signature from a signer wallet acting for
//! the user wallet, over the keccak hash of the sorted query.

use async_trait::async_trait;
use ethers::{signers::LocalWallet, types::H256, utils::keccak256};
use serde_json::Value;

use super::{
	precision::{format_price_with, format_quantity_with, PrecisionCache, SymbolPrecision},
	Balance, ExchangeType, OrderFill, OrderSide, Position, Trader,
};
use crate::{constants::VENUE_REQUEST_TIMEOUT, errors::VenueError, store::TradeSide};

const BASE_URL: &str = "https://fapi.asterdex.com";

pub struct AsterTrader {
	client: reqwest::Client,
	user_address: String,
	signer_address: String,
	signer: LocalWallet,
	precision: PrecisionCache,
}

enum Method {
	Get,
	Post,
	Delete,
}

impl AsterTrader {
	pub fn new(
		user_address: &str,
		signer_address: &str,
		signer_private_key: &str,
	) -> Result<Self, VenueError> {
		let signer = signer_private_key
			.trim_start_matches("0x")
			.parse::<LocalWallet>()
			.map_err(|e| VenueError::Auth(format!("invalid signer key: {e}")))?;
		Ok(Self {
			client: reqwest::Client::builder()
				.timeout(VENUE_REQUEST_TIMEOUT)
				.build()
				.expect("reqwest client with static config"),
			user_address: user_address.to_string(),
			signer_address: signer_address.to_string(),
			signer,
			precision: PrecisionCache::default(),
		})
	}

	/// Sorted query + user/signer/nonce, keccak-hashed and signed by the
	/// signer wallet.
	fn signed_query(&self, params: &[(&str, String)]) -> Result<String, VenueError> {
		let nonce = chrono::Utc::now().timestamp_millis();
		let mut pairs: Vec<(String, String)> = params
			.iter()
			.map(|(k, v)| (k.to_string(), v.clone()))
			.chain([
				("user".to_string(), self.user_address.clone()),
				("signer".to_string(), self.signer_address.clone()),
				("nonce".to_string(), nonce.to_string()),
				("timestamp".to_string(), nonce.to_string()),
				("recvWindow".to_string(), "5000".to_string()),
			])
			.collect();
		pairs.sort();
		let query =
			pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");

		let digest = keccak256(query.as_bytes());
		let signature = self
			.signer
			.sign_hash(H256::from(digest))
			.map_err(|e| VenueError::Auth(format!("signing failed: {e}")))?;
		Ok(format!("{query}&signature=0x{signature}"))
	}

	async fn signed_request(
		&self,
		method: Method,
		path: &str,
		params: &[(&str, String)],
	) -> Result<Value, VenueError> {
		let url = format!("{BASE_URL}{path}?{}", self.signed_query(params)?);
		let request = match method {
			Method::Get => self.client.get(url),
			Method::Post => self.client.post(url),
			Method::Delete => self.client.delete(url),
		};
		let response = request.send().await?;
		let status = response.status();
		let body = response.text().await?;
		if !status.is_success() {
			return Err(VenueError::classify(status, &body));
		}
		serde_json::from_str(&body).map_err(|e| VenueError::Retryable(e.to_string()))
	}

	async fn public_request(
		&self,
		path: &str,
		params: &[(&str, &str)],
	) -> Result<Value, VenueError> {
		let response =
			self.client.get(format!("{BASE_URL}{path}")).query(params).send().await?;
		let status = response.status();
		let body = response.text().await?;
		if !status.is_success() {
			return Err(VenueError::classify(status, &body));
		}
		serde_json::from_str(&body).map_err(|e| VenueError::Retryable(e.to_string()))
	}

	async fn symbol_precision(&self, symbol: &str) -> Result<SymbolPrecision, VenueError> {
		if let Some(precision) = self.precision.get(symbol) {
			return Ok(precision);
		}
		let info = self.public_request("/fapi/v1/exchangeInfo", &[]).await?;
		for entry in info["symbols"].as_array().cloned().unwrap_or_default() {
			let Some(name) = entry["symbol"].as_str() else { continue };
			let mut precision = SymbolPrecision {
				price_precision: entry["pricePrecision"].as_u64().unwrap_or(2) as u32,
				quantity_precision: entry["quantityPrecision"].as_u64().unwrap_or(3) as u32,
				..Default::default()
			};
			for filter in entry["filters"].as_array().cloned().unwrap_or_default() {
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
			self.precision.insert(name, precision);
		}
		self.precision
			.get(symbol)
			.ok_or_else(|| VenueError::Business(format!("symbol {symbol} unknown to the venue")))
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
		let response = self.signed_request(Method::Post, "/fapi/v1/order", &params).await?;
		Ok(OrderFill {
			symbol: symbol.to_string(),
			side,
			quantity: response["executedQty"]
				.as_str()
				.and_then(|s| s.parse().ok())
				.unwrap_or(quantity),
			avg_price: response["avgPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
			order_id: response["orderId"].as_i64().unwrap_or_default().to_string(),
		})
	}

	async fn cancel_orders_of_types(
		&self,
		symbol: &str,
		types: &[&str],
	) -> Result<(), VenueError> {
		let orders = self
			.signed_request(
				Method::Get,
				"/fapi/v1/openOrders",
				&[("symbol", symbol.to_string())],
			)
			.await?;
		for order in orders.as_array().cloned().unwrap_or_default() {
			if !types.contains(&order["type"].as_str().unwrap_or("")) {
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
		self.signed_request(
			Method::Post,
			"/fapi/v1/order",
			&[
				("symbol", symbol.to_string()),
				("side", OrderSide::closing(side).as_str().to_string()),
				("type", order_type.to_string()),
				("stopPrice", format_price_with(&precision, price)?),
				("quantity", format_quantity_with(&precision, quantity)?),
				("reduceOnly", "true".to_string()),
				("workingType", "MARK_PRICE".to_string()),
			],
		)
		.await?;
		Ok(())
	}
}

#[async_trait]
impl Trader for AsterTrader {
	fn exchange_type(&self) -> ExchangeType {
		ExchangeType::Aster
	}

	async fn get_balance(&self) -> Result<Balance, VenueError> {
		let balances = self.signed_request(Method::Get, "/fapi/v2/balance", &[]).await?;
		for entry in balances.as_array().cloned().unwrap_or_default() {
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
		let mut positions = Vec::new();
		for entry in response.as_array().cloned().unwrap_or_default() {
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
		match self
			.signed_request(
				Method::Post,
				"/fapi/v1/marginType",
				&[
					("symbol", symbol.to_string()),
					("marginType", if is_cross { "CROSSED" } else { "ISOLATED" }.to_string()),
				],
			)
			.await
		{
			Ok(_) => Ok(()),
			// Venue reports "no need to change" as an error; the call is idempotent
			Err(VenueError::Business(_)) => Ok(()),
			Err(error) => Err(error),
		}
	}

	async fn format_quantity(&self, symbol: &str, quantity: f64) -> Result<String, VenueError> {
		let precision = self.symbol_precision(symbol).await?;
		format_quantity_with(&precision, quantity)
	}
}
