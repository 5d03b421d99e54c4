//! Venue adapters behind one capability trait. Each agent owns exactly one
//! boxed adapter; precision caches are per-adapter.

mod aster;
mod binance;
mod hyperliquid;
mod lighter;
mod order_strategy;
mod precision;
mod retry;

pub use aster::AsterTrader;
pub use binance::BinanceTrader;
pub use hyperliquid::HyperliquidTrader;
pub use lighter::LighterTrader;
pub use order_strategy::{execute_with_strategy, OrderSubmission, StrategyParams};
pub use precision::{format_quantity_with, PrecisionCache, SymbolPrecision};
pub use retry::with_retry;

use async_trait::async_trait;
use serde::Serialize;

use crate::{
	errors::VenueError,
	store::{ExchangeConfig, TradeSide},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
	Binance,
	Hyperliquid,
	Aster,
	Lighter,
}

impl ExchangeType {
	pub fn as_str(&self) -> &'static str {
		match self {
			ExchangeType::Binance => "binance",
			ExchangeType::Hyperliquid => "hyperliquid",
			ExchangeType::Aster => "aster",
			ExchangeType::Lighter => "lighter",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
	Buy,
	Sell,
}

impl OrderSide {
	pub fn as_str(&self) -> &'static str {
		match self {
			OrderSide::Buy => "BUY",
			OrderSide::Sell => "SELL",
		}
	}

	pub fn opposite(&self) -> Self {
		match self {
			OrderSide::Buy => OrderSide::Sell,
			OrderSide::Sell => OrderSide::Buy,
		}
	}

	/// The side that opens a position in the given direction.
	pub fn opening(side: TradeSide) -> Self {
		match side {
			TradeSide::Long => OrderSide::Buy,
			TradeSide::Short => OrderSide::Sell,
		}
	}

	/// The side that closes a position in the given direction.
	pub fn closing(side: TradeSide) -> Self {
		Self::opening(side).opposite()
	}
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Balance {
	pub wallet_balance: f64,
	pub unrealized_pnl: f64,
	pub available: f64,
}

impl Balance {
	pub fn total_equity(&self) -> f64 {
		self.wallet_balance + self.unrealized_pnl
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct Position {
	pub symbol: String,
	pub side: TradeSide,
	pub quantity: f64,
	pub entry_price: f64,
	pub mark_price: f64,
	pub unrealized_pnl: f64,
	pub leverage: f64,
	pub liquidation_price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderFill {
	pub symbol: String,
	pub side: OrderSide,
	pub quantity: f64,
	pub avg_price: f64,
	pub order_id: String,
}

/// Uniform capability set over every supported venue.
#[async_trait]
pub trait Trader: Send + Sync {
	fn exchange_type(&self) -> ExchangeType;

	async fn get_balance(&self) -> Result<Balance, VenueError>;
	async fn get_positions(&self) -> Result<Vec<Position>, VenueError>;
	async fn get_market_price(&self, symbol: &str) -> Result<f64, VenueError>;

	async fn open_long(
		&self,
		symbol: &str,
		quantity: f64,
		leverage: f64,
	) -> Result<OrderFill, VenueError>;
	async fn open_short(
		&self,
		symbol: &str,
		quantity: f64,
		leverage: f64,
	) -> Result<OrderFill, VenueError>;
	async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderFill, VenueError>;
	async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderFill, VenueError>;

	/// Upsert: existing stop-loss orders for (symbol, side) are cancelled
	/// before the new one is placed.
	async fn set_stop_loss(
		&self,
		symbol: &str,
		side: TradeSide,
		quantity: f64,
		price: f64,
	) -> Result<(), VenueError>;
	async fn set_take_profit(
		&self,
		symbol: &str,
		side: TradeSide,
		quantity: f64,
		price: f64,
	) -> Result<(), VenueError>;

	async fn cancel_stop_loss_orders(&self, symbol: &str) -> Result<(), VenueError>;
	async fn cancel_take_profit_orders(&self, symbol: &str) -> Result<(), VenueError>;
	/// Remove both stop-loss and take-profit orders for the symbol.
	async fn cancel_stop_orders(&self, symbol: &str) -> Result<(), VenueError>;
	async fn cancel_all_orders(&self, symbol: &str) -> Result<(), VenueError>;

	async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<(), VenueError>;
	async fn set_margin_mode(&self, symbol: &str, is_cross: bool) -> Result<(), VenueError>;

	/// Round toward zero to the venue's step size and format at its quantity
	/// precision. Orders whose rounded quantity is zero are refused upstream.
	async fn format_quantity(&self, symbol: &str, quantity: f64) -> Result<String, VenueError>;

	/// Release any venue-side session state. Called when the agent stops.
	async fn cleanup(&self) {}

	/// The limit-order surface for the strategy machine, when the venue has
	/// one. Venues without resting limits fall back to market submissions.
	fn order_submission(&self) -> Option<&dyn OrderSubmission> {
		None
	}
}

/// Construct the adapter for a decrypted venue config.
pub fn make_trader(config: &ExchangeConfig) -> Result<Box<dyn Trader>, VenueError> {
	match config.exchange_id.as_str() {
		"binance" => Ok(Box::new(BinanceTrader::new(
			&config.api_key,
			&config.secret_key,
			config.testnet,
		))),
		"hyperliquid" => Ok(Box::new(HyperliquidTrader::new(
			&config.secret_key,
			&config.hyperliquid_main_wallet,
			config.testnet,
		)?)),
		"aster" => Ok(Box::new(AsterTrader::new(
			&config.aster_user_address,
			&config.aster_signer_address,
			&config.aster_private_key,
		)?)),
		"lighter" => Ok(Box::new(LighterTrader::new(
			&config.lighter_wallet,
			&config.lighter_api_private_key,
			config.lighter_account_index,
		))),
		other => Err(VenueError::Business(format!("unsupported exchange {other:?}"))),
	}
}
