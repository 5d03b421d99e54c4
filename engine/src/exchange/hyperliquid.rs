//! Hyperliquid perp adapter. Orders are typed actions hashed with msgpack and
//! signed EIP-712 style by an agent wallet (a separate key with negligible
//! balance) on behalf of the main wallet that holds the funds.

use async_trait::async_trait;
use ethers::{signers::LocalWallet, types::H256, utils::keccak256};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{
	order_strategy::OrderSubmission,
	precision::{format_quantity_with, SymbolPrecision},
	Balance, ExchangeType, OrderFill, OrderSide, Position, Trader,
};
use crate::{constants::VENUE_REQUEST_TIMEOUT, errors::VenueError, store::TradeSide};

const MAINNET_URL: &str = "https://api.hyperliquid.xyz";
const TESTNET_URL: &str = "https://api.hyperliquid-testnet.xyz";

/// Aggressive IoC limit band standing in for a market order.
const MARKET_SLIPPAGE: f64 = 0.05;

#[derive(Clone, Copy)]
struct AssetInfo {
	index: u32,
	sz_decimals: u32,
}

pub struct HyperliquidTrader {
	client: reqwest::Client,
	base_url: String,
	agent_wallet: LocalWallet,
	main_wallet: String,
	testnet: bool,
	assets: RwLock<HashMap<String, AssetInfo>>,
}

// ===== wire shapes; field order is part of the signature =====

#[derive(Serialize)]
struct OrderAction {
	#[serde(rename = "type")]
	kind: &'static str,
	orders: Vec<OrderWire>,
	grouping: &'static str,
}

#[derive(Serialize)]
struct OrderWire {
	a: u32,
	b: bool,
	p: String,
	s: String,
	r: bool,
	t: OrderTypeWire,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OrderTypeWire {
	Limit { limit: LimitWire },
	Trigger { trigger: TriggerWire },
}

#[derive(Serialize)]
struct LimitWire {
	tif: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerWire {
	is_market: bool,
	trigger_px: String,
	tpsl: &'static str,
}

#[derive(Serialize)]
struct CancelAction {
	#[serde(rename = "type")]
	kind: &'static str,
	cancels: Vec<CancelWire>,
}

#[derive(Serialize)]
struct CancelWire {
	a: u32,
	o: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateLeverageAction {
	#[serde(rename = "type")]
	kind: &'static str,
	asset: u32,
	is_cross: bool,
	leverage: u32,
}

/// keccak(rmp(action) || nonce_be || 0x00), the value the phantom agent
/// carries into the EIP-712 struct.
fn connection_id<A: Serialize>(action: &A, nonce: u64) -> Result<[u8; 32], VenueError> {
	let mut bytes = rmp_serde::to_vec_named(action)
		.map_err(|e| VenueError::Business(format!("action encoding failed: {e}")))?;
	bytes.extend_from_slice(&nonce.to_be_bytes());
	bytes.push(0); // no vault address
	Ok(keccak256(bytes))
}

fn u256_word(value: u64) -> [u8; 32] {
	let mut word = [0u8; 32];
	word[24..].copy_from_slice(&value.to_be_bytes());
	word
}

/// EIP-712 digest of the phantom agent over the fixed Exchange domain.
fn agent_digest(source: &str, connection_id: [u8; 32]) -> [u8; 32] {
	let domain_type_hash = keccak256(
		"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
	);
	let mut domain = Vec::with_capacity(5 * 32);
	domain.extend_from_slice(&domain_type_hash);
	domain.extend_from_slice(&keccak256("Exchange"));
	domain.extend_from_slice(&keccak256("1"));
	domain.extend_from_slice(&u256_word(1337));
	domain.extend_from_slice(&[0u8; 32]); // zero verifying contract
	let domain_separator = keccak256(domain);

	let agent_type_hash = keccak256("Agent(string source,bytes32 connectionId)");
	let mut agent = Vec::with_capacity(3 * 32);
	agent.extend_from_slice(&agent_type_hash);
	agent.extend_from_slice(&keccak256(source));
	agent.extend_from_slice(&connection_id);
	let struct_hash = keccak256(agent);

	let mut digest = Vec::with_capacity(2 + 2 * 32);
	digest.extend_from_slice(&[0x19, 0x01]);
	digest.extend_from_slice(&domain_separator);
	digest.extend_from_slice(&struct_hash);
	keccak256(digest)
}

/// Prices carry at most five significant figures and six decimals.
fn format_hl_price(price: f64) -> String {
	if price <= 0.0 {
		return "0".to_string();
	}
	let magnitude = price.abs().log10().floor() as i32;
	let decimals = (5 - 1 - magnitude).clamp(0, 6) as usize;
	let formatted = format!("{price:.decimals$}");
	// Trailing zeros are rejected by the venue
	if formatted.contains('.') {
		formatted.trim_end_matches('0').trim_end_matches('.').to_string()
	} else {
		formatted
	}
}

fn coin_of(symbol: &str) -> &str {
	symbol.strip_suffix("USDT").unwrap_or(symbol)
}

impl HyperliquidTrader {
	pub fn new(
		agent_private_key: &str,
		main_wallet: &str,
		testnet: bool,
	) -> Result<Self, VenueError> {
		let agent_wallet = agent_private_key
			.trim_start_matches("0x")
			.parse::<LocalWallet>()
			.map_err(|e| VenueError::Auth(format!("invalid agent wallet key: {e}")))?;
		Ok(Self {
			client: reqwest::Client::builder()
				.timeout(VENUE_REQUEST_TIMEOUT)
				.build()
				.expect("reqwest client with static config"),
			base_url: if testnet { TESTNET_URL } else { MAINNET_URL }.to_string(),
			agent_wallet,
			main_wallet: main_wallet.to_string(),
			testnet,
			assets: RwLock::new(HashMap::new()),
		})
	}

	async fn info(&self, body: Value) -> Result<Value, VenueError> {
		let response = self
			.client
			.post(format!("{}/info", self.base_url))
			.json(&body)
			.send()
			.await?;
		let status = response.status();
		let text = response.text().await?;
		if !status.is_success() {
			return Err(VenueError::classify(status, &text));
		}
		serde_json::from_str(&text).map_err(|e| VenueError::Retryable(e.to_string()))
	}

	async fn exchange<A: Serialize>(&self, action: &A) -> Result<Value, VenueError> {
		let nonce = chrono::Utc::now().timestamp_millis() as u64;
		let digest =
			agent_digest(if self.testnet { "b" } else { "a" }, connection_id(action, nonce)?);
		let signature = self
			.agent_wallet
			.sign_hash(H256::from(digest))
			.map_err(|e| VenueError::Auth(format!("signing failed: {e}")))?;

		let body = json!({
			"action": serde_json::to_value(action)
				.map_err(|e| VenueError::Business(e.to_string()))?,
			"nonce": nonce,
			"signature": {
				"r": format!("0x{:064x}", signature.r),
				"s": format!("0x{:064x}", signature.s),
				"v": signature.v,
			},
		});

		let response = self
			.client
			.post(format!("{}/exchange", self.base_url))
			.json(&body)
			.send()
			.await?;
		let status = response.status();
		let text = response.text().await?;
		if !status.is_success() {
			return Err(VenueError::classify(status, &text));
		}
		let value: Value =
			serde_json::from_str(&text).map_err(|e| VenueError::Retryable(e.to_string()))?;
		if value["status"].as_str() == Some("ok") {
			Ok(value)
		} else {
			Err(VenueError::Business(text))
		}
	}

	async fn asset_info(&self, symbol: &str) -> Result<AssetInfo, VenueError> {
		let coin = coin_of(symbol);
		if let Some(info) = self.assets.read().get(coin) {
			return Ok(*info);
		}

		let meta = self.info(json!({"type": "meta"})).await?;
		let Some(universe) = meta["universe"].as_array() else {
			return Err(VenueError::Retryable("meta without universe".to_string()));
		};
		{
			let mut assets = self.assets.write();
			for (index, entry) in universe.iter().enumerate() {
				if let Some(name) = entry["name"].as_str() {
					assets.insert(
						name.to_string(),
						AssetInfo {
							index: index as u32,
							sz_decimals: entry["szDecimals"].as_u64().unwrap_or(3) as u32,
						},
					);
				}
			}
		}
		self.assets
			.read()
			.get(coin)
			.copied()
			.ok_or_else(|| VenueError::Business(format!("asset {coin} unknown to the venue")))
	}

	fn size_precision(&self, asset: AssetInfo) -> SymbolPrecision {
		SymbolPrecision {
			price_precision: 6,
			quantity_precision: asset.sz_decimals,
			tick_size: 0.0,
			step_size: 10f64.powi(-(asset.sz_decimals as i32)),
		}
	}

	async fn place_single_order(&self, order: OrderWire) -> Result<Value, VenueError> {
		let action = OrderAction { kind: "order", orders: vec![order], grouping: "na" };
		self.exchange(&action).await
	}

	/// Extract the fill from an order response status list.
	fn fill_from_response(
		response: &Value,
		symbol: &str,
		side: OrderSide,
		fallback_quantity: f64,
	) -> Result<OrderFill, VenueError> {
		let status = &response["response"]["data"]["statuses"][0];
		if let Some(error) = status["error"].as_str() {
			return Err(VenueError::Business(error.to_string()));
		}
		let filled = &status["filled"];
		let quantity = filled["totalSz"]
			.as_str()
			.and_then(|s| s.parse().ok())
			.unwrap_or(fallback_quantity);
		let avg_price = filled["avgPx"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
		let order_id = filled["oid"]
			.as_u64()
			.or_else(|| status["resting"]["oid"].as_u64())
			.unwrap_or_default();
		Ok(OrderFill {
			symbol: symbol.to_string(),
			side,
			quantity,
			avg_price,
			order_id: order_id.to_string(),
		})
	}

	/// IoC limit at an aggressive band around the mid, the venue's stand-in
	/// for a market order.
	async fn market_order(
		&self,
		symbol: &str,
		side: OrderSide,
		quantity: f64,
		reduce_only: bool,
	) -> Result<OrderFill, VenueError> {
		let asset = self.asset_info(symbol).await?;
		let mid = self.get_market_price(symbol).await?;
		let price = match side {
			OrderSide::Buy => mid * (1.0 + MARKET_SLIPPAGE),
			OrderSide::Sell => mid * (1.0 - MARKET_SLIPPAGE),
		};
		let size = format_quantity_with(&self.size_precision(asset), quantity)?;
		let response = self
			.place_single_order(OrderWire {
				a: asset.index,
				b: side == OrderSide::Buy,
				p: format_hl_price(price),
				s: size,
				r: reduce_only,
				t: OrderTypeWire::Limit { limit: LimitWire { tif: "Ioc" } },
			})
			.await?;
		Self::fill_from_response(&response, symbol, side, quantity)
	}

	async fn open_trigger_orders(&self, symbol: &str) -> Result<Vec<(u64, String)>, VenueError> {
		let coin = coin_of(symbol);
		let orders = self
			.info(json!({"type": "frontendOpenOrders", "user": self.main_wallet}))
			.await?;
		let mut triggers = Vec::new();
		for order in orders.as_array().cloned().unwrap_or_default() {
			if order["coin"].as_str() != Some(coin) {
				continue;
			}
			let order_type = order["orderType"].as_str().unwrap_or("").to_string();
			if order_type.contains("Stop") || order_type.contains("Take Profit") {
				if let Some(oid) = order["oid"].as_u64() {
					triggers.push((oid, order_type));
				}
			}
		}
		Ok(triggers)
	}

	async fn cancel_oids(&self, symbol: &str, oids: Vec<u64>) -> Result<(), VenueError> {
		if oids.is_empty() {
			return Ok(());
		}
		let asset = self.asset_info(symbol).await?;
		let action = CancelAction {
			kind: "cancel",
			cancels: oids.into_iter().map(|o| CancelWire { a: asset.index, o }).collect(),
		};
		self.exchange(&action).await?;
		Ok(())
	}

	async fn cancel_triggers_matching(
		&self,
		symbol: &str,
		predicate: impl Fn(&str) -> bool + Send,
	) -> Result<(), VenueError> {
		let oids = self
			.open_trigger_orders(symbol)
			.await?
			.into_iter()
			.filter(|(_, order_type)| predicate(order_type))
			.map(|(oid, _)| oid)
			.collect();
		self.cancel_oids(symbol, oids).await
	}

	async fn place_trigger(
		&self,
		symbol: &str,
		side: TradeSide,
		quantity: f64,
		price: f64,
		tpsl: &'static str,
	) -> Result<(), VenueError> {
		let asset = self.asset_info(symbol).await?;
		let size = format_quantity_with(&self.size_precision(asset), quantity)?;
		let trigger_px = format_hl_price(price);
		self.place_single_order(OrderWire {
			a: asset.index,
			b: OrderSide::closing(side) == OrderSide::Buy,
			p: trigger_px.clone(),
			s: size,
			r: true,
			t: OrderTypeWire::Trigger {
				trigger: TriggerWire { is_market: true, trigger_px, tpsl },
			},
		})
		.await?;
		Ok(())
	}
}

#[async_trait]
impl Trader for HyperliquidTrader {
	fn exchange_type(&self) -> ExchangeType {
		ExchangeType::Hyperliquid
	}

	async fn get_balance(&self) -> Result<Balance, VenueError> {
		let state = self
			.info(json!({"type": "clearinghouseState", "user": self.main_wallet}))
			.await?;
		let account_value = state["marginSummary"]["accountValue"]
			.as_str()
			.and_then(|s| s.parse::<f64>().ok())
			.unwrap_or(0.0);
		let withdrawable =
			state["withdrawable"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
		let unrealized: f64 = state["assetPositions"]
			.as_array()
			.map(|positions| {
				positions
					.iter()
					.filter_map(|p| {
						p["position"]["unrealizedPnl"].as_str().and_then(|s| s.parse::<f64>().ok())
					})
					.sum()
			})
			.unwrap_or(0.0);
		Ok(Balance {
			wallet_balance: account_value - unrealized,
			unrealized_pnl: unrealized,
			available: withdrawable,
		})
	}

	async fn get_positions(&self) -> Result<Vec<Position>, VenueError> {
		let state = self
			.info(json!({"type": "clearinghouseState", "user": self.main_wallet}))
			.await?;
		let mids = self.info(json!({"type": "allMids"})).await?;

		let mut positions = Vec::new();
		for entry in state["assetPositions"].as_array().cloned().unwrap_or_default() {
			let position = &entry["position"];
			let parse =
				|v: &Value| v.as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
			let size = parse(&position["szi"]);
			if size == 0.0 {
				continue;
			}
			let coin = position["coin"].as_str().unwrap_or_default();
			positions.push(Position {
				symbol: format!("{coin}USDT"),
				side: if size > 0.0 { TradeSide::Long } else { TradeSide::Short },
				quantity: size.abs(),
				entry_price: parse(&position["entryPx"]),
				mark_price: parse(&mids[coin]),
				unrealized_pnl: parse(&position["unrealizedPnl"]),
				leverage: position["leverage"]["value"].as_f64().unwrap_or(1.0),
				liquidation_price: parse(&position["liquidationPx"]),
			});
		}
		Ok(positions)
	}

	async fn get_market_price(&self, symbol: &str) -> Result<f64, VenueError> {
		let mids = self.info(json!({"type": "allMids"})).await?;
		mids[coin_of(symbol)]
			.as_str()
			.and_then(|s| s.parse().ok())
			.ok_or_else(|| VenueError::Retryable(format!("no mid for {symbol}")))
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
		self.cancel_stop_loss_orders(symbol).await?;
		self.place_trigger(symbol, side, quantity, price, "sl").await
	}

	async fn set_take_profit(
		&self,
		symbol: &str,
		side: TradeSide,
		quantity: f64,
		price: f64,
	) -> Result<(), VenueError> {
		self.cancel_take_profit_orders(symbol).await?;
		self.place_trigger(symbol, side, quantity, price, "tp").await
	}

	async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), VenueError> {
		self.cancel_triggers_matching(symbol, |t| t.contains("Stop")).await
	}

	async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), VenueError> {
		self.cancel_triggers_matching(symbol, |t| t.contains("Take Profit")).await
	}

	async fn cancel_stop_orders(&self, symbol: &str) -> Result<(), VenueError> {
		self.cancel_triggers_matching(symbol, |_| true).await
	}

	async fn cancel_all_orders(&self, symbol: &str) -> Result<(), VenueError> {
		let coin = coin_of(symbol).to_string();
		let orders = self
			.info(json!({"type": "openOrders", "user": self.main_wallet}))
			.await?;
		let oids = orders
			.as_array()
			.cloned()
			.unwrap_or_default()
			.iter()
			.filter(|o| o["coin"].as_str() == Some(coin.as_str()))
			.filter_map(|o| o["oid"].as_u64())
			.collect();
		self.cancel_oids(symbol, oids).await
	}

	async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<(), VenueError> {
		let asset = self.asset_info(symbol).await?;
		let action = UpdateLeverageAction {
			kind: "updateLeverage",
			asset: asset.index,
			is_cross: true,
			leverage: leverage.max(1.0) as u32,
		};
		self.exchange(&action).await?;
		Ok(())
	}

	async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<(), VenueError> {
		// Margin mode rides on the leverage action for this venue; re-assert
		// the current leverage with the requested mode.
		let asset = self.asset_info(symbol).await?;
		let action = UpdateLeverageAction {
			kind: "updateLeverage",
			asset: asset.index,
			is_cross,
			leverage: 1,
		};
		match self.exchange(&action).await {
			Ok(_) => Ok(()),
			// Open positions pin the mode; not an error for an idempotent call
			Err(VenueError::Business(_)) => Ok(()),
			Err(error) => Err(error),
		}
	}

	async fn format_quantity(&self, symbol: &str, quantity: f64) -> Result<String, VenueError> {
		let asset = self.asset_info(symbol).await?;
		format_quantity_with(&self.size_precision(asset), quantity)
	}

	fn order_submission(&self) -> Option<&dyn OrderSubmission> {
		Some(self)
	}
}

#[async_trait]
impl OrderSubmission for HyperliquidTrader {
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
		let asset = self.asset_info(symbol).await?;
		let size = format_quantity_with(&self.size_precision(asset), quantity)?;
		let response = self
			.place_single_order(OrderWire {
				a: asset.index,
				b: side == OrderSide::Buy,
				p: format_hl_price(price),
				s: size,
				r: reduce_only,
				// Alo: add-liquidity-only, the venue's post-only
				t: OrderTypeWire::Limit { limit: LimitWire { tif: "Alo" } },
			})
			.await?;
		let status = &response["response"]["data"]["statuses"][0];
		if let Some(error) = status["error"].as_str() {
			return Err(VenueError::Business(error.to_string()));
		}
		let oid = status["resting"]["oid"]
			.as_u64()
			.or_else(|| status["filled"]["oid"].as_u64())
			.ok_or_else(|| VenueError::Retryable("order response without oid".to_string()))?;
		Ok(oid.to_string())
	}

	async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError> {
		let oid = order_id
			.parse::<u64>()
			.map_err(|_| VenueError::Business(format!("bad order id {order_id}")))?;
		self.cancel_oids(symbol, vec![oid]).await
	}

	async fn filled_quantity(&self, _symbol: &str, order_id: &str) -> Result<f64, VenueError> {
		let oid = order_id
			.parse::<u64>()
			.map_err(|_| VenueError::Business(format!("bad order id {order_id}")))?;
		let status = self
			.info(json!({"type": "orderStatus", "user": self.main_wallet, "oid": oid}))
			.await?;
		let order = &status["order"]["order"];
		let orig: f64 = order["origSz"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
		let remaining: f64 = order["sz"].as_str().and_then(|s| s.parse().ok()).unwrap_or(orig);
		Ok((orig - remaining).max(0.0))
	}

	async fn mid_price(&self, symbol: &str) -> Result<f64, VenueError> {
		self.get_market_price(symbol).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn price_formatting_keeps_five_significant_figures() {
		assert_eq!(format_hl_price(12345.678), "12346");
		assert_eq!(format_hl_price(1234.5678), "1234.6");
		assert_eq!(format_hl_price(1.2345678), "1.2346");
		assert_eq!(format_hl_price(0.00123456), "0.001235");
		assert_eq!(format_hl_price(50000.0), "50000");
	}

	#[test]
	fn symbol_to_coin() {
		assert_eq!(coin_of("BTCUSDT"), "BTC");
		assert_eq!(coin_of("SOLUSDT"), "SOL");
		assert_eq!(coin_of("BTC"), "BTC");
	}

	#[test]
	fn connection_id_is_stable_and_nonce_sensitive() {
		let action = OrderAction { kind: "order", orders: vec![], grouping: "na" };
		let a = connection_id(&action, 1).unwrap();
		let b = connection_id(&action, 1).unwrap();
		let c = connection_id(&action, 2).unwrap();
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn digest_depends_on_network_source() {
		let id = [7u8; 32];
		assert_ne!(agent_digest("a", id), agent_digest("b", id));
	}

	#[test]
	fn rejects_bad_agent_key() {
		assert!(HyperliquidTrader::new("not-a-key", "0xabc", false).is_err());
	}

	#[test]
	fn order_wire_shape() {
		// Field order in the JSON mirrors the signed msgpack order
		let wire = OrderWire {
			a: 3,
			b: true,
			p: "50000".to_string(),
			s: "0.01".to_string(),
			r: false,
			t: OrderTypeWire::Limit { limit: LimitWire { tif: "Gtc" } },
		};
		let json = serde_json::to_string(&wire).unwrap();
		assert_eq!(json, r#"{"a":3,"b":true,"p":"50000","s":"0.01","r":false,"t":{"limit":{"tif":"Gtc"}}}"#);

		let trigger = OrderTypeWire::Trigger {
			trigger: TriggerWire {
				is_market: true,
				trigger_px: "49000".to_string(),
				tpsl: "sl",
			},
		};
		assert_eq!(
			serde_json::to_string(&trigger).unwrap(),
			r#"{"trigger":{"isMarket":true,"triggerPx":"49000","tpsl":"sl"}}"#
		);
	}
}
