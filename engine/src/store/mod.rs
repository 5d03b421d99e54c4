//! Embedded config store. One SQLite database holds users, model and exchange
//! configuration, agent records, trade history, decision records and runtime
//! state. All credential fields pass through the vault on their way in and out.

mod decisions;
mod exchanges;
mod migrations;
mod models;
mod state;
mod traders;
mod trades;
mod users;

pub use decisions::{AccountSnapshot, DecisionRecord, EquityPoint};
pub use exchanges::{ExchangeConfig, SUPPORTED_EXCHANGES};
pub use models::AiModelConfig;
pub use state::AgentState;
pub use traders::{OrderStrategyKind, TraderRecord, TraderUpdate};
#[cfg(test)]
pub use traders::test_fixtures;
pub use trades::{OpenPosition, TradeAction, TradeEvent, TradeSide};
pub use users::{BetaCode, User};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::{path::Path, sync::Arc};
use tracing::{info, warn};

use crate::vault::Vault;

/// Reserved owner of the system-provided template rows.
pub const DEFAULT_USER_ID: &str = "default";

/// Cloneable handle to the store. All access serialises on the inner lock;
/// every operation is a short transaction.
#[derive(Clone)]
pub struct Store {
	conn: Arc<Mutex<Connection>>,
	vault: Arc<Vault>,
}

impl Store {
	/// Open (or create) the database, apply pragmas, run idempotent schema
	/// creation and migrations, then run the read-only integrity scan.
	pub fn open(db_file: &Path, vault: Arc<Vault>) -> Result<Self> {
		let conn = Connection::open(db_file)
			.with_context(|| format!("Could not open database at {}", db_file.display()))?;

		conn.pragma_update(None, "journal_mode", "WAL")?;
		conn.pragma_update(None, "synchronous", "FULL")?;
		conn.pragma_update(None, "foreign_keys", "ON")?;
		conn.pragma_update(None, "busy_timeout", 5000)?;

		let store = Self { conn: Arc::new(Mutex::new(conn)), vault };

		store.create_schema()?;
		migrations::run(&store.conn.lock(), db_file)?;
		store.ensure_default_user()?;
		store.report_orphans();

		Ok(store)
	}

	/// In-memory store for tests.
	#[cfg(test)]
	pub fn open_in_memory(vault: Arc<Vault>) -> Result<Self> {
		let conn = Connection::open_in_memory()?;
		conn.pragma_update(None, "foreign_keys", "ON")?;
		let store = Self { conn: Arc::new(Mutex::new(conn)), vault };
		store.create_schema()?;
		store.ensure_default_user()?;
		Ok(store)
	}

	pub(crate) fn vault(&self) -> &Vault {
		&self.vault
	}

	pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
		f(&self.conn.lock())
	}

	pub(crate) fn parse_ts(s: &str) -> chrono::DateTime<chrono::Utc> {
		s.parse().unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)
	}

	fn create_schema(&self) -> Result<()> {
		self.conn.lock().execute_batch(
			r#"
			CREATE TABLE IF NOT EXISTS users (
				id TEXT PRIMARY KEY,
				email TEXT NOT NULL UNIQUE,
				password_hash TEXT NOT NULL,
				otp_secret TEXT NOT NULL DEFAULT '',
				otp_verified INTEGER NOT NULL DEFAULT 0,
				created_at TEXT NOT NULL,
				updated_at TEXT NOT NULL
			);

			CREATE TABLE IF NOT EXISTS beta_codes (
				code TEXT PRIMARY KEY,
				used INTEGER NOT NULL DEFAULT 0,
				used_by TEXT NOT NULL DEFAULT '',
				used_at TEXT,
				created_at TEXT NOT NULL
			);

			CREATE TABLE IF NOT EXISTS ai_models (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				model_id TEXT NOT NULL,
				user_id TEXT NOT NULL REFERENCES users(id),
				name TEXT NOT NULL,
				provider TEXT NOT NULL,
				enabled INTEGER NOT NULL DEFAULT 0,
				api_key TEXT NOT NULL DEFAULT '',
				custom_api_url TEXT NOT NULL DEFAULT '',
				custom_model_name TEXT NOT NULL DEFAULT '',
				UNIQUE (user_id, model_id)
			);

			CREATE TABLE IF NOT EXISTS exchanges (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				exchange_id TEXT NOT NULL,
				user_id TEXT NOT NULL REFERENCES users(id),
				enabled INTEGER NOT NULL DEFAULT 0,
				api_key TEXT NOT NULL DEFAULT '',
				secret_key TEXT NOT NULL DEFAULT '',
				testnet INTEGER NOT NULL DEFAULT 0,
				hyperliquid_main_wallet TEXT NOT NULL DEFAULT '',
				aster_user_address TEXT NOT NULL DEFAULT '',
				aster_signer_address TEXT NOT NULL DEFAULT '',
				aster_private_key TEXT NOT NULL DEFAULT '',
				lighter_wallet TEXT NOT NULL DEFAULT '',
				lighter_api_private_key TEXT NOT NULL DEFAULT '',
				lighter_account_index INTEGER NOT NULL DEFAULT 0,
				UNIQUE (user_id, exchange_id)
			);

			CREATE TABLE IF NOT EXISTS traders (
				id TEXT PRIMARY KEY,
				user_id TEXT NOT NULL REFERENCES users(id),
				name TEXT NOT NULL,
				ai_model_id INTEGER NOT NULL REFERENCES ai_models(id),
				exchange_id INTEGER NOT NULL REFERENCES exchanges(id),
				initial_balance REAL NOT NULL DEFAULT 0,
				scan_interval_minutes INTEGER NOT NULL DEFAULT 5,
				is_running INTEGER NOT NULL DEFAULT 0,
				btc_eth_leverage REAL NOT NULL DEFAULT 5,
				altcoin_leverage REAL NOT NULL DEFAULT 5,
				trading_symbols TEXT NOT NULL DEFAULT '',
				use_coin_pool INTEGER NOT NULL DEFAULT 0,
				use_oi_top INTEGER NOT NULL DEFAULT 0,
				custom_prompt TEXT NOT NULL DEFAULT '',
				override_base_prompt INTEGER NOT NULL DEFAULT 0,
				system_prompt_template TEXT NOT NULL DEFAULT 'default',
				is_cross_margin INTEGER NOT NULL DEFAULT 1,
				taker_fee_rate REAL NOT NULL DEFAULT 0.0004,
				maker_fee_rate REAL NOT NULL DEFAULT 0.0002,
				order_strategy TEXT NOT NULL DEFAULT 'market_only',
				limit_price_offset REAL NOT NULL DEFAULT 0.0005,
				limit_timeout_seconds INTEGER NOT NULL DEFAULT 30,
				timeframes TEXT NOT NULL DEFAULT '15m,1h,4h',
				max_drawdown_percent REAL NOT NULL DEFAULT 50,
				max_daily_loss_percent REAL NOT NULL DEFAULT 20,
				stop_trading_minutes INTEGER NOT NULL DEFAULT 60,
				created_at TEXT NOT NULL
			);

			CREATE TABLE IF NOT EXISTS trade_history (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				trader_id TEXT NOT NULL,
				symbol TEXT NOT NULL,
				side TEXT NOT NULL,
				action TEXT NOT NULL,
				quantity REAL NOT NULL,
				price REAL NOT NULL,
				timestamp TEXT NOT NULL,
				reason TEXT NOT NULL DEFAULT '',
				stop_loss REAL NOT NULL DEFAULT 0,
				take_profit REAL NOT NULL DEFAULT 0,
				realized_pnl REAL
			);

			CREATE TABLE IF NOT EXISTS decisions (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				trader_id TEXT NOT NULL,
				cycle_number INTEGER NOT NULL,
				timestamp TEXT NOT NULL,
				prompt_summary TEXT NOT NULL DEFAULT '',
				raw_response TEXT NOT NULL DEFAULT '',
				actions TEXT NOT NULL DEFAULT '[]',
				wallet_balance REAL NOT NULL DEFAULT 0,
				unrealized_pnl REAL NOT NULL DEFAULT 0,
				total_equity REAL NOT NULL DEFAULT 0,
				margin_used REAL NOT NULL DEFAULT 0,
				initial_balance REAL NOT NULL DEFAULT 0,
				success INTEGER NOT NULL DEFAULT 1,
				error TEXT NOT NULL DEFAULT ''
			);

			CREATE TABLE IF NOT EXISTS trader_states (
				trader_id TEXT PRIMARY KEY,
				call_count INTEGER NOT NULL DEFAULT 0,
				peak_equity REAL NOT NULL DEFAULT 0,
				last_reset_time TEXT,
				state_json TEXT NOT NULL DEFAULT '{}'
			);

			CREATE TABLE IF NOT EXISTS system_config (
				key TEXT PRIMARY KEY,
				value TEXT NOT NULL
			);

			CREATE INDEX IF NOT EXISTS idx_trade_history_trader
				ON trade_history (trader_id, symbol, side, id);
			CREATE INDEX IF NOT EXISTS idx_decisions_trader
				ON decisions (trader_id, id);
			CREATE INDEX IF NOT EXISTS idx_traders_user ON traders (user_id);
			"#,
		)?;
		Ok(())
	}

	/// The reserved `default` user must exist before any row referencing users
	/// is inserted; template model/exchange rows hang off it.
	fn ensure_default_user(&self) -> Result<()> {
		let now = chrono::Utc::now().to_rfc3339();
		self.conn.lock().execute(
			"INSERT OR IGNORE INTO users (id, email, password_hash, created_at, updated_at)
			 VALUES (?1, ?2, '', ?3, ?3)",
			rusqlite::params![DEFAULT_USER_ID, "default@system.local", now],
		)?;
		Ok(())
	}

	/// Read-only referential integrity scan. Orphans are reported with a
	/// remediation hint and never block startup.
	fn report_orphans(&self) {
		let conn = self.conn.lock();
		let scan = |sql: &str| -> usize {
			conn.prepare(sql)
				.and_then(|mut stmt| {
					stmt.query_map([], |row| row.get::<_, String>(0))
						.map(|rows| rows.filter_map(|r| r.ok()).collect::<Vec<_>>())
				})
				.map(|ids| {
					for id in &ids {
						warn!(
							trader_id = %id,
							"Trader references a missing model or exchange row; \
							 recreate the referenced config or delete the trader"
						);
					}
					ids.len()
				})
				.unwrap_or(0)
		};

		let orphans = scan(
			"SELECT t.id FROM traders t
			 LEFT JOIN ai_models m ON m.id = t.ai_model_id AND m.user_id = t.user_id
			 WHERE m.id IS NULL",
		) + scan(
			"SELECT t.id FROM traders t
			 LEFT JOIN exchanges e ON e.id = t.exchange_id AND e.user_id = t.user_id
			 WHERE e.id IS NULL",
		);
		if orphans == 0 {
			info!("Integrity scan clean");
		}
	}

	// ===== system config =====

	pub fn get_system_config(&self, key: &str) -> Result<Option<String>> {
		use rusqlite::OptionalExtension;
		Ok(self
			.conn
			.lock()
			.query_row("SELECT value FROM system_config WHERE key = ?1", [key], |row| row.get(0))
			.optional()?)
	}

	pub fn set_system_config(&self, key: &str, value: &str) -> Result<()> {
		self.conn.lock().execute(
			"INSERT INTO system_config (key, value) VALUES (?1, ?2)
			 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
			[key, value],
		)?;
		Ok(())
	}

	/// The JWT signing secret: taken from settings when provided, otherwise
	/// generated once and persisted so restarts do not invalidate sessions.
	pub fn jwt_secret(&self, configured: Option<&str>) -> Result<String> {
		if let Some(secret) = configured {
			if !secret.is_empty() {
				return Ok(secret.to_string());
			}
		}
		if let Some(existing) = self.get_system_config("jwt_secret")? {
			return Ok(existing);
		}
		let generated = {
			use base64::Engine;
			use rand::RngCore;
			let mut bytes = [0u8; 48];
			rand::thread_rng().fill_bytes(&mut bytes);
			base64::engine::general_purpose::STANDARD.encode(bytes)
		};
		self.set_system_config("jwt_secret", &generated)?;
		info!("Generated and persisted a new JWT secret");
		Ok(generated)
	}
}

#[cfg(test)]
pub mod test_utils {
	use super::*;

	pub fn test_store() -> Store {
		let vault = Arc::new(Vault::new("0123456789abcdef0123456789abcdef-test").unwrap());
		Store::open_in_memory(vault).unwrap()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn opens_with_default_user() {
		let store = test_utils::test_store();
		let count: i64 = store
			.with_conn(|conn| {
				Ok(conn.query_row(
					"SELECT COUNT(*) FROM users WHERE id = ?1",
					[DEFAULT_USER_ID],
					|row| row.get(0),
				)?)
			})
			.unwrap();
		assert_eq!(count, 1);
	}

	#[test]
	fn jwt_secret_bootstrap_is_stable() {
		let store = test_utils::test_store();
		let first = store.jwt_secret(None).unwrap();
		let second = store.jwt_secret(None).unwrap();
		assert_eq!(first, second);
		assert_eq!(store.jwt_secret(Some("configured")).unwrap(), "configured");
		// Blank configured value falls back to the persisted secret
		assert_eq!(store.jwt_secret(Some("")).unwrap(), first);
	}
}
