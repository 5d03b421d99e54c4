use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
	Long,
	Short,
}

impl TradeSide {
	pub fn as_str(&self) -> &'static str {
		match self {
			TradeSide::Long => "LONG",
			TradeSide::Short => "SHORT",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"LONG" => Some(TradeSide::Long),
			"SHORT" => Some(TradeSide::Short),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
	Open,
	Close,
	PartialClose,
	EmergencyClose,
	AutoClose,
}

impl TradeAction {
	pub fn as_str(&self) -> &'static str {
		match self {
			TradeAction::Open => "OPEN",
			TradeAction::Close => "CLOSE",
			TradeAction::PartialClose => "PARTIAL_CLOSE",
			TradeAction::EmergencyClose => "EMERGENCY_CLOSE",
			TradeAction::AutoClose => "AUTO_CLOSE",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"OPEN" => Some(TradeAction::Open),
			"CLOSE" => Some(TradeAction::Close),
			"PARTIAL_CLOSE" => Some(TradeAction::PartialClose),
			"EMERGENCY_CLOSE" => Some(TradeAction::EmergencyClose),
			"AUTO_CLOSE" => Some(TradeAction::AutoClose),
			_ => None,
		}
	}

	pub fn is_close_variant(&self) -> bool {
		!matches!(self, TradeAction::Open)
	}
}

/// One fill, append-only. Realised pnl is present only on close variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
	#[serde(default)]
	pub id: i64,
	pub trader_id: String,
	pub symbol: String,
	pub side: TradeSide,
	pub action: TradeAction,
	pub quantity: f64,
	pub price: f64,
	pub timestamp: DateTime<Utc>,
	#[serde(default)]
	pub reason: String,
	#[serde(default)]
	pub stop_loss: f64,
	#[serde(default)]
	pub take_profit: f64,
	#[serde(default)]
	pub realized_pnl: Option<f64>,
}

/// Residual quantities are compared against this; venue step sizes are far
/// coarser.
const QTY_EPSILON: f64 = 1e-9;

/// An open position reconstructed from the event stream.
#[derive(Debug, Clone, Serialize)]
pub struct OpenPosition {
	pub symbol: String,
	pub side: TradeSide,
	/// Residual quantity after partial closes.
	pub quantity: f64,
	/// Entry price of the most recent unmatched OPEN.
	pub entry_price: f64,
	pub opened_at: DateTime<Utc>,
	pub stop_loss: f64,
	pub take_profit: f64,
}

impl OpenPosition {
	pub fn key(&self) -> String {
		format!("{}_{}", self.symbol, self.side.as_str())
	}
}

fn event_from_row(row: &Row) -> rusqlite::Result<TradeEvent> {
	Ok(TradeEvent {
		id: row.get(0)?,
		trader_id: row.get(1)?,
		symbol: row.get(2)?,
		side: TradeSide::parse(&row.get::<_, String>(3)?).unwrap_or(TradeSide::Long),
		action: TradeAction::parse(&row.get::<_, String>(4)?).unwrap_or(TradeAction::Open),
		quantity: row.get(5)?,
		price: row.get(6)?,
		timestamp: Store::parse_ts(&row.get::<_, String>(7)?),
		reason: row.get(8)?,
		stop_loss: row.get(9)?,
		take_profit: row.get(10)?,
		realized_pnl: row.get(11)?,
	})
}

const EVENT_COLUMNS: &str = "id, trader_id, symbol, side, action, quantity, price, timestamp, \
	reason, stop_loss, take_profit, realized_pnl";

/// Fold an ascending event stream into open positions keyed by (symbol, side).
fn fold_open_positions(events: &[TradeEvent]) -> HashMap<(String, TradeSide), OpenPosition> {
	let mut open: HashMap<(String, TradeSide), OpenPosition> = HashMap::new();

	for event in events {
		let key = (event.symbol.clone(), event.side);
		match event.action {
			TradeAction::Open => {
				let position = open.entry(key).or_insert_with(|| OpenPosition {
					symbol: event.symbol.clone(),
					side: event.side,
					quantity: 0.0,
					entry_price: event.price,
					opened_at: event.timestamp,
					stop_loss: event.stop_loss,
					take_profit: event.take_profit,
				});
				position.quantity += event.quantity;
				// The latest OPEN is the baseline for pnl on the residual
				position.entry_price = event.price;
				position.opened_at = event.timestamp;
				if event.stop_loss > 0.0 {
					position.stop_loss = event.stop_loss;
				}
				if event.take_profit > 0.0 {
					position.take_profit = event.take_profit;
				}
			},
			_ => {
				if let Some(position) = open.get_mut(&key) {
					position.quantity -= event.quantity;
					if position.quantity <= QTY_EPSILON {
						open.remove(&key);
					}
				}
			},
		}
	}
	open
}

impl Store {
	pub fn record_trade(&self, event: &TradeEvent) -> Result<()> {
		self.with_conn(|conn| {
			conn.execute(
				"INSERT INTO trade_history
					(trader_id, symbol, side, action, quantity, price, timestamp, reason,
					 stop_loss, take_profit, realized_pnl)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
				params![
					event.trader_id,
					event.symbol,
					event.side.as_str(),
					event.action.as_str(),
					event.quantity,
					event.price,
					event.timestamp.to_rfc3339(),
					event.reason,
					event.stop_loss,
					event.take_profit,
					event.realized_pnl,
				],
			)?;
			Ok(())
		})
	}

	pub fn get_trade_history(&self, trader_id: &str, limit: i64) -> Result<Vec<TradeEvent>> {
		self.with_conn(|conn| {
			let mut stmt = conn.prepare(&format!(
				"SELECT {EVENT_COLUMNS} FROM trade_history
				 WHERE trader_id = ?1 ORDER BY id DESC LIMIT ?2"
			))?;
			let events = stmt
				.query_map(params![trader_id, limit], event_from_row)?
				.collect::<rusqlite::Result<Vec<_>>>()?;
			Ok(events)
		})
	}

	fn events_ascending(&self, trader_id: &str) -> Result<Vec<TradeEvent>> {
		self.with_conn(|conn| {
			let mut stmt = conn.prepare(&format!(
				"SELECT {EVENT_COLUMNS} FROM trade_history WHERE trader_id = ?1 ORDER BY id"
			))?;
			let events = stmt
				.query_map([trader_id], event_from_row)?
				.collect::<rusqlite::Result<Vec<_>>>()?;
			Ok(events)
		})
	}

	/// All positions currently open according to the event stream. Source of
	/// truth for crash recovery.
	pub fn get_open_positions(&self, trader_id: &str) -> Result<Vec<OpenPosition>> {
		let events = self.events_ascending(trader_id)?;
		let mut positions: Vec<OpenPosition> =
			fold_open_positions(&events).into_values().collect();
		positions.sort_by(|a, b| a.key().cmp(&b.key()));
		Ok(positions)
	}

	/// Position keys (`SYMBOL_SIDE`) currently open. Convenience over
	/// [`Store::get_open_positions`] for history-driven views.
	pub fn get_open_positions_from_history(&self, trader_id: &str) -> Result<Vec<String>> {
		Ok(self.get_open_positions(trader_id)?.iter().map(|p| p.key()).collect())
	}

	/// The most recent OPEN for (symbol, side) that still has residual
	/// quantity, i.e. is not yet fully paired with close-variant events.
	pub fn get_last_open_trade(
		&self,
		trader_id: &str,
		symbol: &str,
		side: TradeSide,
	) -> Result<Option<TradeEvent>> {
		let events = self.events_ascending(trader_id)?;
		let open = fold_open_positions(&events);
		if !open.contains_key(&(symbol.to_string(), side)) {
			return Ok(None);
		}
		Ok(events
			.into_iter()
			.rev()
			.find(|e| e.symbol == symbol && e.side == side && e.action == TradeAction::Open))
	}
}
