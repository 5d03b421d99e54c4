use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Store;

/// Runtime counters persisted after every cycle so a restart resumes where the
/// agent left off.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
	pub call_count: i64,
	pub peak_equity: f64,
	pub last_reset_time: Option<DateTime<Utc>>,
	/// Free-form blob for fields that do not warrant a column.
	#[serde(default)]
	pub extra: serde_json::Value,
}

impl Store {
	pub fn save_trader_state(&self, trader_id: &str, state: &AgentState) -> Result<()> {
		self.with_conn(|conn| {
			conn.execute(
				"INSERT INTO trader_states (trader_id, call_count, peak_equity, last_reset_time, state_json)
				 VALUES (?1, ?2, ?3, ?4, ?5)
				 ON CONFLICT (trader_id) DO UPDATE SET
					call_count = excluded.call_count,
					peak_equity = excluded.peak_equity,
					last_reset_time = excluded.last_reset_time,
					state_json = excluded.state_json",
				params![
					trader_id,
					state.call_count,
					state.peak_equity,
					state.last_reset_time.map(|t| t.to_rfc3339()),
					serde_json::to_string(&state.extra)?,
				],
			)?;
			Ok(())
		})
	}

	pub fn load_trader_state(&self, trader_id: &str) -> Result<Option<AgentState>> {
		self.with_conn(|conn| {
			Ok(conn
				.query_row(
					"SELECT call_count, peak_equity, last_reset_time, state_json
					 FROM trader_states WHERE trader_id = ?1",
					[trader_id],
					|row| {
						Ok(AgentState {
							call_count: row.get(0)?,
							peak_equity: row.get(1)?,
							last_reset_time: row
								.get::<_, Option<String>>(2)?
								.and_then(|s| s.parse().ok()),
							extra: serde_json::from_str(&row.get::<_, String>(3)?)
								.unwrap_or(serde_json::Value::Null),
						})
					},
				)
				.optional()?)
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_utils::test_store;

	#[test]
	fn state_round_trip() {
		let store = test_store();
		assert!(store.load_trader_state("t").unwrap().is_none());

		let state = AgentState {
			call_count: 42,
			peak_equity: 123.45,
			last_reset_time: Some(Utc::now()),
			extra: serde_json::json!({"last_symbol": "BTCUSDT"}),
		};
		store.save_trader_state("t", &state).unwrap();

		let loaded = store.load_trader_state("t").unwrap().unwrap();
		assert_eq!(loaded.call_count, 42);
		assert_eq!(loaded.peak_equity, 123.45);
		assert!(loaded.last_reset_time.is_some());
		assert_eq!(loaded.extra["last_symbol"], "BTCUSDT");

		// Upsert overwrites
		store.save_trader_state("t", &AgentState { call_count: 43, ..loaded }).unwrap();
		assert_eq!(store.load_trader_state("t").unwrap().unwrap().call_count, 43);
	}
}
