//! Pre-dispatch risk guards. Evaluated before any open is executed; closes
//! and protective updates are never blocked.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::{TradeSide, TraderRecord};

/// Rolling risk counters carried inside the persisted agent state blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskState {
	/// Highest equity ever observed.
	pub peak_equity: f64,
	/// Equity at the start of the current UTC day.
	pub day_start_equity: f64,
	/// Ordinal day `day_start_equity` belongs to.
	pub day_ordinal: i32,
	/// Opens are suppressed until this instant.
	pub paused_until: Option<DateTime<Utc>>,
}

pub enum OpenVerdict {
	Allowed,
	/// Opens suppressed; the reason is recorded on the cycle.
	Blocked(String),
}

impl RiskState {
	/// Fold the cycle's equity into the counters. Returns the guard verdict
	/// for opens this cycle.
	pub fn evaluate(&mut self, record: &TraderRecord, equity: f64, now: DateTime<Utc>) -> OpenVerdict {
		if equity > self.peak_equity {
			self.peak_equity = equity;
		}

		let today = now.date_naive().num_days_from_ce();
		if self.day_ordinal != today || self.day_start_equity <= 0.0 {
			self.day_ordinal = today;
			self.day_start_equity = equity;
		}

		if let Some(paused_until) = self.paused_until {
			if now < paused_until {
				return OpenVerdict::Blocked(format!(
					"risk pause active until {paused_until}"
				));
			}
			self.paused_until = None;
		}

		let drawdown = if self.peak_equity > 0.0 {
			(self.peak_equity - equity) / self.peak_equity * 100.0
		} else {
			0.0
		};
		let daily_loss = if self.day_start_equity > 0.0 {
			(self.day_start_equity - equity) / self.day_start_equity * 100.0
		} else {
			0.0
		};

		if drawdown > record.max_drawdown_percent || daily_loss > record.max_daily_loss_percent {
			let until = now + Duration::minutes(record.stop_trading_minutes.max(1));
			self.paused_until = Some(until);
			warn!(
				trader_id = %record.id,
				drawdown,
				daily_loss,
				until = %until,
				"Risk guard tripped, suppressing opens"
			);
			return OpenVerdict::Blocked(format!(
				"drawdown {drawdown:.1}% / daily loss {daily_loss:.1}% tripped the guard; \
				 opens paused until {until}"
			));
		}
		OpenVerdict::Allowed
	}
}

/// Same-cycle flip-flop guard: an open for a (symbol, side) that was closed
/// earlier in this cycle is skipped.
pub fn reopened_after_close(
	closed_this_cycle: &[(String, TradeSide)],
	symbol: &str,
	side: TradeSide,
) -> bool {
	closed_this_cycle.iter().any(|(s, d)| s == symbol && *d == side)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn record() -> TraderRecord {
		serde_json::from_value(json!({
			"name": "t",
			"ai_model_id": 1,
			"exchange_id": 1,
			"max_drawdown_percent": 30.0,
			"max_daily_loss_percent": 10.0,
			"stop_trading_minutes": 60,
		}))
		.unwrap()
	}

	#[test]
	fn drawdown_trips_and_recovers() {
		let record = record();
		let mut state = RiskState::default();
		let t0 = Utc::now();

		assert!(matches!(state.evaluate(&record, 100.0, t0), OpenVerdict::Allowed));
		assert_eq!(state.peak_equity, 100.0);

		// 35% below the peak trips the guard
		assert!(matches!(state.evaluate(&record, 65.0, t0), OpenVerdict::Blocked(_)));
		assert!(state.paused_until.is_some());

		// Still paused a minute later
		assert!(matches!(
			state.evaluate(&record, 95.0, t0 + Duration::minutes(1)),
			OpenVerdict::Blocked(_)
		));

		// After the pause window, equity recovered, opens resume
		assert!(matches!(
			state.evaluate(&record, 95.0, t0 + Duration::minutes(61) + Duration::days(1)),
			OpenVerdict::Allowed
		));
	}

	#[test]
	fn daily_loss_resets_at_midnight() {
		let record = record();
		let mut state = RiskState::default();
		let t0 = Utc::now();

		assert!(matches!(state.evaluate(&record, 100.0, t0), OpenVerdict::Allowed));
		// 12% intraday loss trips
		assert!(matches!(state.evaluate(&record, 88.0, t0), OpenVerdict::Blocked(_)));

		// Next day (pause elapsed) the baseline resets to current equity
		let next_day = t0 + Duration::days(1) + Duration::minutes(61);
		assert!(matches!(state.evaluate(&record, 88.0, next_day), OpenVerdict::Allowed));
		assert_eq!(state.day_start_equity, 88.0);
	}

	#[test]
	fn same_cycle_reopen_guard() {
		let closed = vec![("BTCUSDT".to_string(), TradeSide::Long)];
		assert!(reopened_after_close(&closed, "BTCUSDT", TradeSide::Long));
		assert!(!reopened_after_close(&closed, "BTCUSDT", TradeSide::Short));
		assert!(!reopened_after_close(&closed, "ETHUSDT", TradeSide::Long));
	}
}
