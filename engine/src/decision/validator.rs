//! Per-decision validation against the agent's risk/sizing rulebook.

use anyhow::{bail, Result};
use tracing::warn;

use super::{Decision, DecisionAction};
use crate::store::TraderRecord;

/// Smallest order any venue will take, in USDT.
const FLOOR_POSITION_SIZE: f64 = 12.0;
/// BTC/ETH floor at the top of the interpolation band.
const MAJOR_MAX_MIN_SIZE: f64 = 60.0;
const INTERPOLATION_LOW_EQUITY: f64 = 20.0;
const INTERPOLATION_HIGH_EQUITY: f64 = 100.0;

fn is_major(symbol: &str) -> bool {
	symbol.starts_with("BTC") || symbol.starts_with("ETH")
}

/// Minimum `position_size_usd` for an open. Altcoins take the flat floor;
/// BTC/ETH scale linearly with equity between 12 (at 20) and 60 (at 100).
pub fn calculate_min_position_size(symbol: &str, equity: f64) -> f64 {
	if !is_major(symbol) {
		return FLOOR_POSITION_SIZE;
	}
	if equity < INTERPOLATION_LOW_EQUITY {
		FLOOR_POSITION_SIZE
	} else if equity >= INTERPOLATION_HIGH_EQUITY {
		MAJOR_MAX_MIN_SIZE
	} else {
		FLOOR_POSITION_SIZE +
			(equity - INTERPOLATION_LOW_EQUITY) * (MAJOR_MAX_MIN_SIZE - FLOOR_POSITION_SIZE) /
				(INTERPOLATION_HIGH_EQUITY - INTERPOLATION_LOW_EQUITY)
	}
}

/// Validate one decision in place. Over-cap leverage is clamped with a
/// warning; everything else that fails here invalidates the decision.
pub fn validate_decision(
	decision: &mut Decision,
	record: &TraderRecord,
	equity: f64,
) -> Result<()> {
	if decision.symbol.is_empty() {
		bail!("decision has no symbol");
	}

	match decision.action {
		DecisionAction::OpenLong | DecisionAction::OpenShort => {
			if decision.leverage <= 0.0 {
				bail!("leverage must be positive, got {}", decision.leverage);
			}
			let cap = if is_major(&decision.symbol) {
				record.btc_eth_leverage
			} else {
				record.altcoin_leverage
			};
			if decision.leverage > cap {
				warn!(
					symbol = %decision.symbol,
					requested = decision.leverage,
					cap,
					"Clamping leverage to the configured cap"
				);
				decision.leverage = cap;
			}

			let min_size = calculate_min_position_size(&decision.symbol, equity);
			if decision.position_size_usd < min_size {
				bail!(
					"position_size_usd {} below minimum {min_size} for {}",
					decision.position_size_usd,
					decision.symbol
				);
			}
		},
		DecisionAction::UpdateStopLoss =>
			if decision.new_stop_loss <= 0.0 {
				bail!("update_stop_loss requires new_stop_loss > 0");
			},
		DecisionAction::UpdateTakeProfit =>
			if decision.new_take_profit <= 0.0 {
				bail!("update_take_profit requires new_take_profit > 0");
			},
		DecisionAction::PartialClose =>
			if decision.close_percentage <= 0.0 || decision.close_percentage > 100.0 {
				bail!(
					"partial_close requires 0 < close_percentage <= 100, got {}",
					decision.close_percentage
				);
			},
		DecisionAction::CloseLong | DecisionAction::CloseShort | DecisionAction::Wait => {},
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn record(btc_eth: f64, altcoin: f64) -> TraderRecord {
		serde_json::from_value(json!({
			"name": "t",
			"ai_model_id": 1,
			"exchange_id": 1,
			"btc_eth_leverage": btc_eth,
			"altcoin_leverage": altcoin,
		}))
		.unwrap()
	}

	fn open(symbol: &str, leverage: f64, size: f64) -> Decision {
		serde_json::from_value(json!({
			"symbol": symbol,
			"action": "open_long",
			"leverage": leverage,
			"position_size_usd": size,
			"stop_loss": 50.0,
			"take_profit": 200.0,
		}))
		.unwrap()
	}

	#[test]
	fn min_size_floors() {
		// Altcoins are flat regardless of equity
		assert_eq!(calculate_min_position_size("SOLUSDT", 5.0), 12.0);
		assert_eq!(calculate_min_position_size("SOLUSDT", 1_000.0), 12.0);

		// Small BTC account
		assert_eq!(calculate_min_position_size("BTCUSDT", 6.97), 12.0);
		// Interpolated mid account
		assert_eq!(calculate_min_position_size("BTCUSDT", 60.0), 36.0);
		// Saturated
		assert_eq!(calculate_min_position_size("ETHUSDT", 100.0), 60.0);
		assert_eq!(calculate_min_position_size("ETHUSDT", 5_000.0), 60.0);
	}

	#[test]
	fn min_size_is_monotone_for_majors() {
		let mut previous = 0.0;
		for equity in (0..200).map(f64::from) {
			let min = calculate_min_position_size("BTCUSDT", equity);
			assert!(min >= previous, "not monotone at equity {equity}");
			previous = min;
		}
	}

	#[test]
	fn leverage_is_clamped_not_rejected() {
		let record = record(10.0, 5.0);
		let mut decision = open("SOLUSDT", 20.0, 100.0);
		validate_decision(&mut decision, &record, 1_000.0).unwrap();
		assert_eq!(decision.leverage, 5.0);

		let mut btc = open("BTCUSDT", 20.0, 100.0);
		validate_decision(&mut btc, &record, 1_000.0).unwrap();
		assert_eq!(btc.leverage, 10.0);

		// In-cap leverage untouched
		let mut fine = open("SOLUSDT", 3.0, 100.0);
		validate_decision(&mut fine, &record, 1_000.0).unwrap();
		assert_eq!(fine.leverage, 3.0);
	}

	#[test]
	fn zero_leverage_is_rejected() {
		let record = record(10.0, 5.0);
		let mut decision = open("SOLUSDT", 0.0, 100.0);
		assert!(validate_decision(&mut decision, &record, 1_000.0).is_err());
	}

	#[test]
	fn undersized_open_is_rejected() {
		let record = record(10.0, 5.0);
		let mut decision = open("BTCUSDT", 5.0, 20.0);
		// equity 60 -> minimum 36
		assert!(validate_decision(&mut decision, &record, 60.0).is_err());
	}

	#[test]
	fn protective_updates_require_prices() {
		let record = record(10.0, 5.0);

		let mut decision: Decision = serde_json::from_value(json!({
			"symbol": "BTCUSDT", "action": "update_stop_loss"
		}))
		.unwrap();
		assert!(validate_decision(&mut decision, &record, 100.0).is_err());
		decision.new_stop_loss = 48_000.0;
		validate_decision(&mut decision, &record, 100.0).unwrap();

		let mut tp: Decision = serde_json::from_value(json!({
			"symbol": "BTCUSDT", "action": "update_take_profit", "new_take_profit": 0.0
		}))
		.unwrap();
		assert!(validate_decision(&mut tp, &record, 100.0).is_err());
	}

	#[test]
	fn partial_close_percentage_bounds() {
		let record = record(10.0, 5.0);
		for (percentage, ok) in [(0.0, false), (-5.0, false), (50.0, true), (100.0, true), (101.0, false)] {
			let mut decision: Decision = serde_json::from_value(json!({
				"symbol": "BTCUSDT", "action": "partial_close", "close_percentage": percentage
			}))
			.unwrap();
			assert_eq!(
				validate_decision(&mut decision, &record, 100.0).is_ok(),
				ok,
				"close_percentage {percentage}"
			);
		}
	}
}
