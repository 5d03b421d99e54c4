use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Store;

/// Account state captured alongside every cycle. `initial_balance` is the
/// baseline in effect when the record was written, so recomputing percent-PNL
/// never back-dates later baseline changes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
	pub wallet_balance: f64,
	pub unrealized_pnl: f64,
	pub total_equity: f64,
	pub margin_used: f64,
	pub initial_balance: f64,
}

impl AccountSnapshot {
	pub fn pnl_percent(&self) -> f64 {
		if self.initial_balance <= 0.0 {
			return 0.0;
		}
		(self.total_equity - self.initial_balance) / self.initial_balance * 100.0
	}
}

/// One cycle's record, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
	#[serde(default)]
	pub id: i64,
	pub trader_id: String,
	pub cycle_number: i64,
	pub timestamp: DateTime<Utc>,
	pub prompt_summary: String,
	pub raw_response: String,
	/// Parsed actions as JSON, for the UI.
	pub actions: String,
	pub account: AccountSnapshot,
	pub success: bool,
	pub error: String,
}

/// A point on the reconstructed equity curve.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EquityPoint {
	pub timestamp: i64,
	pub total_equity: f64,
	pub pnl_percent: f64,
}

fn record_from_row(row: &Row) -> rusqlite::Result<DecisionRecord> {
	Ok(DecisionRecord {
		id: row.get(0)?,
		trader_id: row.get(1)?,
		cycle_number: row.get(2)?,
		timestamp: Store::parse_ts(&row.get::<_, String>(3)?),
		prompt_summary: row.get(4)?,
		raw_response: row.get(5)?,
		actions: row.get(6)?,
		account: AccountSnapshot {
			wallet_balance: row.get(7)?,
			unrealized_pnl: row.get(8)?,
			total_equity: row.get(9)?,
			margin_used: row.get(10)?,
			initial_balance: row.get(11)?,
		},
		success: row.get::<_, i64>(12)? != 0,
		error: row.get(13)?,
	})
}

const RECORD_COLUMNS: &str = "id, trader_id, cycle_number, timestamp, prompt_summary, \
	raw_response, actions, wallet_balance, unrealized_pnl, total_equity, margin_used, \
	initial_balance, success, error";

impl Store {
	pub fn record_decision(&self, record: &DecisionRecord) -> Result<()> {
		self.with_conn(|conn| {
			conn.execute(
				"INSERT INTO decisions
					(trader_id, cycle_number, timestamp, prompt_summary, raw_response, actions,
					 wallet_balance, unrealized_pnl, total_equity, margin_used, initial_balance,
					 success, error)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
				params![
					record.trader_id,
					record.cycle_number,
					record.timestamp.to_rfc3339(),
					record.prompt_summary,
					record.raw_response,
					record.actions,
					record.account.wallet_balance,
					record.account.unrealized_pnl,
					record.account.total_equity,
					record.account.margin_used,
					record.account.initial_balance,
					record.success as i64,
					record.error,
				],
			)?;
			Ok(())
		})
	}

	pub fn get_decisions(&self, trader_id: &str, limit: i64) -> Result<Vec<DecisionRecord>> {
		self.with_conn(|conn| {
			let mut stmt = conn.prepare(&format!(
				"SELECT {RECORD_COLUMNS} FROM decisions
				 WHERE trader_id = ?1 ORDER BY id DESC LIMIT ?2"
			))?;
			let records = stmt
				.query_map(params![trader_id, limit], record_from_row)?
				.collect::<rusqlite::Result<Vec<_>>>()?;
			Ok(records)
		})
	}

	pub fn get_latest_decision(&self, trader_id: &str) -> Result<Option<DecisionRecord>> {
		self.with_conn(|conn| {
			Ok(conn
				.query_row(
					&format!(
						"SELECT {RECORD_COLUMNS} FROM decisions
						 WHERE trader_id = ?1 ORDER BY id DESC LIMIT 1"
					),
					[trader_id],
					record_from_row,
				)
				.optional()?)
		})
	}

	pub fn next_cycle_number(&self, trader_id: &str) -> Result<i64> {
		self.with_conn(|conn| {
			let max: Option<i64> = conn.query_row(
				"SELECT MAX(cycle_number) FROM decisions WHERE trader_id = ?1",
				[trader_id],
				|row| row.get(0),
			)?;
			Ok(max.unwrap_or(0) + 1)
		})
	}

	/// Equity curve reconstructed from decision records, oldest first. Each
	/// point uses the baseline embedded in its own record.
	pub fn get_equity_history(&self, trader_id: &str, limit: i64) -> Result<Vec<EquityPoint>> {
		let mut records = self.get_decisions(trader_id, limit)?;
		records.reverse();
		Ok(records
			.iter()
			.map(|r| EquityPoint {
				timestamp: r.timestamp.timestamp(),
				total_equity: r.account.total_equity,
				pnl_percent: r.account.pnl_percent(),
			})
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_utils::test_store;

	fn record(trader: &str, cycle: i64, equity: f64, baseline: f64) -> DecisionRecord {
		DecisionRecord {
			id: 0,
			trader_id: trader.to_string(),
			cycle_number: cycle,
			timestamp: Utc::now(),
			prompt_summary: "BTCUSDT".to_string(),
			raw_response: "[]".to_string(),
			actions: "[]".to_string(),
			account: AccountSnapshot {
				wallet_balance: equity,
				unrealized_pnl: 0.0,
				total_equity: equity,
				margin_used: 0.0,
				initial_balance: baseline,
			},
			success: true,
			error: String::new(),
		}
	}

	#[test]
	fn baseline_is_immutable_per_record() {
		let store = test_store();
		store.record_decision(&record("t", 1, 110.0, 100.0)).unwrap();
		// Operator resets the baseline; later records carry the new one
		store.record_decision(&record("t", 2, 220.0, 200.0)).unwrap();

		let history = store.get_equity_history("t", 100).unwrap();
		assert_eq!(history.len(), 2);
		assert!((history[0].pnl_percent - 10.0).abs() < 1e-9);
		assert!((history[1].pnl_percent - 10.0).abs() < 1e-9);
	}

	#[test]
	fn cycle_numbers_increment() {
		let store = test_store();
		assert_eq!(store.next_cycle_number("t").unwrap(), 1);
		store.record_decision(&record("t", 1, 100.0, 100.0)).unwrap();
		assert_eq!(store.next_cycle_number("t").unwrap(), 2);
	}

	#[test]
	fn latest_decision() {
		let store = test_store();
		assert!(store.get_latest_decision("t").unwrap().is_none());
		store.record_decision(&record("t", 1, 100.0, 100.0)).unwrap();
		store.record_decision(&record("t", 2, 105.0, 100.0)).unwrap();
		assert_eq!(store.get_latest_decision("t").unwrap().unwrap().cycle_number, 2);
	}
}
