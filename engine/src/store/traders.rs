use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Store;

/// How the adapter works a target size into orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStrategyKind {
	MarketOnly,
	ConservativeHybrid,
	LimitOnly,
}

impl OrderStrategyKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			OrderStrategyKind::MarketOnly => "market_only",
			OrderStrategyKind::ConservativeHybrid => "conservative_hybrid",
			OrderStrategyKind::LimitOnly => "limit_only",
		}
	}

	pub fn parse(s: &str) -> Self {
		match s {
			"conservative_hybrid" => OrderStrategyKind::ConservativeHybrid,
			"limit_only" => OrderStrategyKind::LimitOnly,
			_ => OrderStrategyKind::MarketOnly,
		}
	}
}

/// Persistent definition of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderRecord {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub user_id: String,
	pub name: String,
	pub ai_model_id: i64,
	pub exchange_id: i64,
	#[serde(default)]
	pub initial_balance: f64,
	#[serde(default)]
	pub scan_interval_minutes: i64,
	#[serde(default)]
	pub is_running: bool,
	#[serde(default = "default_leverage")]
	pub btc_eth_leverage: f64,
	#[serde(default = "default_leverage")]
	pub altcoin_leverage: f64,
	#[serde(default)]
	pub trading_symbols: String,
	#[serde(default)]
	pub use_coin_pool: bool,
	#[serde(default)]
	pub use_oi_top: bool,
	#[serde(default)]
	pub custom_prompt: String,
	#[serde(default)]
	pub override_base_prompt: bool,
	#[serde(default = "default_template")]
	pub system_prompt_template: String,
	#[serde(default = "default_true")]
	pub is_cross_margin: bool,
	#[serde(default)]
	pub taker_fee_rate: f64,
	#[serde(default)]
	pub maker_fee_rate: f64,
	#[serde(default = "default_strategy")]
	pub order_strategy: OrderStrategyKind,
	#[serde(default)]
	pub limit_price_offset: f64,
	#[serde(default)]
	pub limit_timeout_seconds: i64,
	#[serde(default)]
	pub timeframes: String,
	#[serde(default = "default_max_drawdown")]
	pub max_drawdown_percent: f64,
	#[serde(default = "default_max_daily_loss")]
	pub max_daily_loss_percent: f64,
	#[serde(default = "default_stop_minutes")]
	pub stop_trading_minutes: i64,
	#[serde(default = "Utc::now")]
	pub created_at: DateTime<Utc>,
}

fn default_leverage() -> f64 {
	5.0
}
fn default_template() -> String {
	"default".to_string()
}
fn default_true() -> bool {
	true
}
fn default_strategy() -> OrderStrategyKind {
	OrderStrategyKind::MarketOnly
}
fn default_max_drawdown() -> f64 {
	50.0
}
fn default_max_daily_loss() -> f64 {
	20.0
}
fn default_stop_minutes() -> i64 {
	60
}

impl TraderRecord {
	pub fn symbols(&self) -> Vec<String> {
		self.trading_symbols
			.split(',')
			.map(|s| s.trim().to_uppercase())
			.filter(|s| !s.is_empty())
			.collect()
	}

	pub fn timeframe_list(&self) -> Vec<String> {
		self.timeframes
			.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect()
	}
}

/// Fields a user may change after creation. `None` leaves the stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraderUpdate {
	pub name: Option<String>,
	pub scan_interval_minutes: Option<i64>,
	pub btc_eth_leverage: Option<f64>,
	pub altcoin_leverage: Option<f64>,
	pub trading_symbols: Option<String>,
	pub use_coin_pool: Option<bool>,
	pub use_oi_top: Option<bool>,
	pub custom_prompt: Option<String>,
	pub override_base_prompt: Option<bool>,
	pub system_prompt_template: Option<String>,
	pub is_cross_margin: Option<bool>,
	pub taker_fee_rate: Option<f64>,
	pub maker_fee_rate: Option<f64>,
	pub order_strategy: Option<OrderStrategyKind>,
	pub limit_price_offset: Option<f64>,
	pub limit_timeout_seconds: Option<i64>,
	pub timeframes: Option<String>,
	pub max_drawdown_percent: Option<f64>,
	pub max_daily_loss_percent: Option<f64>,
	pub stop_trading_minutes: Option<i64>,
}

fn trader_from_row(row: &Row) -> rusqlite::Result<TraderRecord> {
	Ok(TraderRecord {
		id: row.get(0)?,
		user_id: row.get(1)?,
		name: row.get(2)?,
		ai_model_id: row.get(3)?,
		exchange_id: row.get(4)?,
		initial_balance: row.get(5)?,
		scan_interval_minutes: row.get(6)?,
		is_running: row.get::<_, i64>(7)? != 0,
		btc_eth_leverage: row.get(8)?,
		altcoin_leverage: row.get(9)?,
		trading_symbols: row.get(10)?,
		use_coin_pool: row.get::<_, i64>(11)? != 0,
		use_oi_top: row.get::<_, i64>(12)? != 0,
		custom_prompt: row.get(13)?,
		override_base_prompt: row.get::<_, i64>(14)? != 0,
		system_prompt_template: row.get(15)?,
		is_cross_margin: row.get::<_, i64>(16)? != 0,
		taker_fee_rate: row.get(17)?,
		maker_fee_rate: row.get(18)?,
		order_strategy: OrderStrategyKind::parse(&row.get::<_, String>(19)?),
		limit_price_offset: row.get(20)?,
		limit_timeout_seconds: row.get(21)?,
		timeframes: row.get(22)?,
		max_drawdown_percent: row.get(23)?,
		max_daily_loss_percent: row.get(24)?,
		stop_trading_minutes: row.get(25)?,
		created_at: Store::parse_ts(&row.get::<_, String>(26)?),
	})
}

const TRADER_COLUMNS: &str = "id, user_id, name, ai_model_id, exchange_id, initial_balance, \
	scan_interval_minutes, is_running, btc_eth_leverage, altcoin_leverage, trading_symbols, \
	use_coin_pool, use_oi_top, custom_prompt, override_base_prompt, system_prompt_template, \
	is_cross_margin, taker_fee_rate, maker_fee_rate, order_strategy, limit_price_offset, \
	limit_timeout_seconds, timeframes, max_drawdown_percent, max_daily_loss_percent, \
	stop_trading_minutes, created_at";

impl Store {
	/// Create an agent record. The referenced model and exchange rows must
	/// exist and belong to the same user.
	pub fn create_trader(&self, user_id: &str, mut record: TraderRecord) -> Result<TraderRecord> {
		if record.id.is_empty() {
			record.id = uuid::Uuid::new_v4().to_string();
		}
		record.user_id = user_id.to_string();
		record.created_at = Utc::now();

		if self.get_ai_model_by_pk(user_id, record.ai_model_id)?.is_none() {
			bail!("ai model {} not found for user", record.ai_model_id);
		}
		if self.get_exchange_by_pk(user_id, record.exchange_id)?.is_none() {
			bail!("exchange {} not found for user", record.exchange_id);
		}

		self.with_conn(|conn| {
			conn.execute(
				&format!(
					"INSERT INTO traders ({TRADER_COLUMNS}) VALUES
					 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
					  ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)"
				),
				params![
					record.id,
					record.user_id,
					record.name,
					record.ai_model_id,
					record.exchange_id,
					record.initial_balance,
					record.scan_interval_minutes,
					record.is_running as i64,
					record.btc_eth_leverage,
					record.altcoin_leverage,
					record.trading_symbols,
					record.use_coin_pool as i64,
					record.use_oi_top as i64,
					record.custom_prompt,
					record.override_base_prompt as i64,
					record.system_prompt_template,
					record.is_cross_margin as i64,
					record.taker_fee_rate,
					record.maker_fee_rate,
					record.order_strategy.as_str(),
					record.limit_price_offset,
					record.limit_timeout_seconds,
					record.timeframes,
					record.max_drawdown_percent,
					record.max_daily_loss_percent,
					record.stop_trading_minutes,
					record.created_at.to_rfc3339(),
				],
			)?;
			Ok(())
		})?;
		Ok(record)
	}

	pub fn get_trader_config(&self, user_id: &str, id: &str) -> Result<Option<TraderRecord>> {
		self.with_conn(|conn| {
			Ok(conn
				.query_row(
					&format!(
						"SELECT {TRADER_COLUMNS} FROM traders WHERE user_id = ?1 AND id = ?2"
					),
					[user_id, id],
					trader_from_row,
				)
				.optional()?)
		})
	}

	pub fn get_traders(&self, user_id: &str) -> Result<Vec<TraderRecord>> {
		self.with_conn(|conn| {
			let mut stmt = conn.prepare(&format!(
				"SELECT {TRADER_COLUMNS} FROM traders WHERE user_id = ?1 ORDER BY created_at"
			))?;
			let traders = stmt
				.query_map([user_id], trader_from_row)?
				.collect::<rusqlite::Result<Vec<_>>>()?;
			Ok(traders)
		})
	}

	pub fn get_all_traders(&self) -> Result<Vec<TraderRecord>> {
		self.with_conn(|conn| {
			let mut stmt =
				conn.prepare(&format!("SELECT {TRADER_COLUMNS} FROM traders ORDER BY created_at"))?;
			let traders =
				stmt.query_map([], trader_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
			Ok(traders)
		})
	}

	pub fn update_trader(
		&self,
		user_id: &str,
		id: &str,
		update: &TraderUpdate,
	) -> Result<TraderRecord> {
		let Some(mut record) = self.get_trader_config(user_id, id)? else {
			bail!("trader {id} not found");
		};

		macro_rules! apply {
			($($field:ident),* $(,)?) => {
				$(if let Some(value) = &update.$field {
					record.$field = value.clone();
				})*
			};
		}
		apply!(
			name,
			scan_interval_minutes,
			btc_eth_leverage,
			altcoin_leverage,
			trading_symbols,
			use_coin_pool,
			use_oi_top,
			custom_prompt,
			override_base_prompt,
			system_prompt_template,
			is_cross_margin,
			taker_fee_rate,
			maker_fee_rate,
			order_strategy,
			limit_price_offset,
			limit_timeout_seconds,
			timeframes,
			max_drawdown_percent,
			max_daily_loss_percent,
			stop_trading_minutes,
		);

		self.with_conn(|conn| {
			conn.execute(
				"UPDATE traders SET name = ?3, scan_interval_minutes = ?4,
					btc_eth_leverage = ?5, altcoin_leverage = ?6, trading_symbols = ?7,
					use_coin_pool = ?8, use_oi_top = ?9, custom_prompt = ?10,
					override_base_prompt = ?11, system_prompt_template = ?12,
					is_cross_margin = ?13, taker_fee_rate = ?14, maker_fee_rate = ?15,
					order_strategy = ?16, limit_price_offset = ?17, limit_timeout_seconds = ?18,
					timeframes = ?19, max_drawdown_percent = ?20, max_daily_loss_percent = ?21,
					stop_trading_minutes = ?22
				 WHERE user_id = ?1 AND id = ?2",
				params![
					user_id,
					id,
					record.name,
					record.scan_interval_minutes,
					record.btc_eth_leverage,
					record.altcoin_leverage,
					record.trading_symbols,
					record.use_coin_pool as i64,
					record.use_oi_top as i64,
					record.custom_prompt,
					record.override_base_prompt as i64,
					record.system_prompt_template,
					record.is_cross_margin as i64,
					record.taker_fee_rate,
					record.maker_fee_rate,
					record.order_strategy.as_str(),
					record.limit_price_offset,
					record.limit_timeout_seconds,
					record.timeframes,
					record.max_drawdown_percent,
					record.max_daily_loss_percent,
					record.stop_trading_minutes,
				],
			)?;
			Ok(())
		})?;
		Ok(record)
	}

	/// Reset the P&L baseline. Historical decision records keep the baseline
	/// they were written with.
	pub fn update_trader_initial_balance(&self, id: &str, initial_balance: f64) -> Result<()> {
		self.with_conn(|conn| {
			conn.execute(
				"UPDATE traders SET initial_balance = ?2 WHERE id = ?1",
				params![id, initial_balance],
			)?;
			Ok(())
		})
	}

	pub fn update_trader_status(&self, id: &str, is_running: bool) -> Result<()> {
		self.with_conn(|conn| {
			conn.execute(
				"UPDATE traders SET is_running = ?2 WHERE id = ?1",
				params![id, is_running as i64],
			)?;
			Ok(())
		})
	}

	pub fn update_trader_prompt(
		&self,
		user_id: &str,
		id: &str,
		custom_prompt: &str,
		override_base_prompt: bool,
	) -> Result<()> {
		self.with_conn(|conn| {
			let updated = conn.execute(
				"UPDATE traders SET custom_prompt = ?3, override_base_prompt = ?4
				 WHERE user_id = ?1 AND id = ?2",
				params![user_id, id, custom_prompt, override_base_prompt as i64],
			)?;
			if updated == 0 {
				bail!("trader {id} not found");
			}
			Ok(())
		})
	}

	/// Remove the agent record and everything that references it. Running this
	/// on an unknown id is a no-op.
	pub fn delete_trader(&self, user_id: &str, id: &str) -> Result<()> {
		self.with_conn(|conn| {
			conn.execute_batch("BEGIN")?;
			let result = (|| -> Result<()> {
				conn.execute(
					"DELETE FROM traders WHERE user_id = ?1 AND id = ?2",
					[user_id, id],
				)?;
				conn.execute("DELETE FROM trader_states WHERE trader_id = ?1", [id])?;
				conn.execute("DELETE FROM decisions WHERE trader_id = ?1", [id])?;
				conn.execute("DELETE FROM trade_history WHERE trader_id = ?1", [id])?;
				Ok(())
			})();
			match result {
				Ok(()) => conn.execute_batch("COMMIT")?,
				Err(_) => conn.execute_batch("ROLLBACK")?,
			}
			result
		})
	}

	/// Union of timeframes configured on running agents, for WS subscriptions.
	pub fn get_all_timeframes(&self) -> Result<Vec<String>> {
		let lists: Vec<String> = self.with_conn(|conn| {
			let mut stmt =
				conn.prepare("SELECT timeframes FROM traders WHERE is_running = 1")?;
			let rows = stmt
				.query_map([], |row| row.get::<_, String>(0))?
				.collect::<rusqlite::Result<Vec<_>>>()?;
			Ok(rows)
		})?;
		let mut timeframes: Vec<String> = lists
			.iter()
			.flat_map(|l| l.split(','))
			.map(|t| t.trim().to_string())
			.filter(|t| !t.is_empty())
			.collect();
		timeframes.sort();
		timeframes.dedup();
		Ok(timeframes)
	}

	/// Distinct symbols configured across running agents.
	pub fn get_custom_coins(&self) -> Result<Vec<String>> {
		let lists: Vec<String> = self.with_conn(|conn| {
			let mut stmt =
				conn.prepare("SELECT trading_symbols FROM traders WHERE is_running = 1")?;
			let rows = stmt
				.query_map([], |row| row.get::<_, String>(0))?
				.collect::<rusqlite::Result<Vec<_>>>()?;
			Ok(rows)
		})?;
		let mut symbols: Vec<String> = lists
			.iter()
			.flat_map(|l| l.split(','))
			.map(|s| s.trim().to_uppercase())
			.filter(|s| !s.is_empty())
			.collect();
		symbols.sort();
		symbols.dedup();
		Ok(symbols)
	}
}


#[cfg(test)]
mod tests {
	use super::test_fixtures::create_fixture_trader;
	use super::*;
	use crate::store::test_utils::test_store;

	#[test]
	fn create_requires_valid_references() {
		let store = test_store();
		let result = store.create_trader(
			"default",
			TraderRecord {
				id: String::new(),
				user_id: String::new(),
				name: "broken".to_string(),
				ai_model_id: 999,
				exchange_id: 999,
				initial_balance: 0.0,
				scan_interval_minutes: 5,
				is_running: false,
				btc_eth_leverage: 5.0,
				altcoin_leverage: 5.0,
				trading_symbols: String::new(),
				use_coin_pool: false,
				use_oi_top: false,
				custom_prompt: String::new(),
				override_base_prompt: false,
				system_prompt_template: "default".to_string(),
				is_cross_margin: true,
				taker_fee_rate: 0.0,
				maker_fee_rate: 0.0,
				order_strategy: OrderStrategyKind::MarketOnly,
				limit_price_offset: 0.0,
				limit_timeout_seconds: 0,
				timeframes: String::new(),
				max_drawdown_percent: 50.0,
				max_daily_loss_percent: 20.0,
				stop_trading_minutes: 60,
				created_at: Utc::now(),
			},
		);
		assert!(result.is_err());
	}

	#[test]
	fn lifecycle_and_updates() {
		let store = test_store();
		let trader = create_fixture_trader(&store, "default");

		store.update_trader_status(&trader.id, true).unwrap();
		assert!(store.get_trader_config("default", &trader.id).unwrap().unwrap().is_running);

		let updated = store
			.update_trader(
				"default",
				&trader.id,
				&TraderUpdate {
					name: Some("renamed".to_string()),
					altcoin_leverage: Some(3.0),
					..Default::default()
				},
			)
			.unwrap();
		assert_eq!(updated.name, "renamed");
		assert_eq!(updated.altcoin_leverage, 3.0);
		// Untouched fields stay
		assert_eq!(updated.btc_eth_leverage, 10.0);

		store.update_trader_initial_balance(&trader.id, 250.0).unwrap();
		assert_eq!(
			store.get_trader_config("default", &trader.id).unwrap().unwrap().initial_balance,
			250.0
		);

		store.delete_trader("default", &trader.id).unwrap();
		assert!(store.get_trader_config("default", &trader.id).unwrap().is_none());
		// Deleting again is a no-op
		store.delete_trader("default", &trader.id).unwrap();
	}

	#[test]
	fn running_unions() {
		let store = test_store();
		let trader = create_fixture_trader(&store, "default");
		assert!(store.get_all_timeframes().unwrap().is_empty());

		store.update_trader_status(&trader.id, true).unwrap();
		assert_eq!(store.get_all_timeframes().unwrap(), vec!["15m", "1h"]);
		assert_eq!(store.get_custom_coins().unwrap(), vec!["BTCUSDT", "SOLUSDT"]);
	}

	#[test]
	fn symbol_parsing() {
		let record_symbols = "btcusdt, SOLUSDT ,,ethusdt";
		let trader = TraderRecord {
			trading_symbols: record_symbols.to_string(),
			..serde_json::from_value(serde_json::json!({
				"name": "x", "ai_model_id": 1, "exchange_id": 1
			}))
			.unwrap()
		};
		assert_eq!(trader.symbols(), vec!["BTCUSDT", "SOLUSDT", "ETHUSDT"]);
	}
}
