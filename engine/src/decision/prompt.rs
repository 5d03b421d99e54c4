//! Prompt assembly for one cycle.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::{
	exchange::Position,
	market::Kline,
	store::{TradeEvent, TraderRecord},
};

/// Everything the cycle gathered before asking the provider.
pub struct PromptContext<'a> {
	pub record: &'a TraderRecord,
	pub template_body: String,
	pub wallet_balance: f64,
	pub unrealized_pnl: f64,
	pub total_equity: f64,
	pub available_margin: f64,
	pub positions: &'a [Position],
	/// symbol -> timeframe -> candles, newest last.
	pub candles: &'a BTreeMap<String, BTreeMap<String, Vec<Kline>>>,
	pub recent_trades: &'a [TradeEvent],
	/// Business-level venue feedback from the previous cycle, if any.
	pub venue_feedback: Option<&'a str>,
}

/// Build (system, user) prompts. The custom prompt either replaces the
/// template body or is appended to it.
pub fn build_prompt(ctx: &PromptContext) -> (String, String) {
	let system = if ctx.record.override_base_prompt && !ctx.record.custom_prompt.is_empty() {
		ctx.record.custom_prompt.clone()
	} else if ctx.record.custom_prompt.is_empty() {
		ctx.template_body.clone()
	} else {
		format!("{}\n\n{}", ctx.template_body.trim_end(), ctx.record.custom_prompt)
	};

	let mut user = String::new();

	writeln!(user, "## Account").unwrap();
	writeln!(user, "wallet_balance: {:.2} USDT", ctx.wallet_balance).unwrap();
	writeln!(user, "unrealized_pnl: {:.2} USDT", ctx.unrealized_pnl).unwrap();
	writeln!(user, "total_equity: {:.2} USDT", ctx.total_equity).unwrap();
	writeln!(user, "available_margin: {:.2} USDT", ctx.available_margin).unwrap();
	writeln!(user, "max_leverage_btc_eth: {}", ctx.record.btc_eth_leverage).unwrap();
	writeln!(user, "max_leverage_altcoin: {}", ctx.record.altcoin_leverage).unwrap();

	writeln!(user, "\n## Open positions").unwrap();
	if ctx.positions.is_empty() {
		writeln!(user, "none").unwrap();
	}
	for position in ctx.positions {
		writeln!(
			user,
			"{} {} qty={} entry={} mark={} lev={}x upnl={:.2}",
			position.symbol,
			position.side.as_str(),
			position.quantity,
			position.entry_price,
			position.mark_price,
			position.leverage,
			position.unrealized_pnl,
		)
		.unwrap();
	}

	for (symbol, timeframes) in ctx.candles {
		writeln!(user, "\n## {symbol}").unwrap();
		for (timeframe, klines) in timeframes {
			writeln!(user, "### {timeframe} (oldest -> newest, o/h/l/c/v)").unwrap();
			for kline in klines {
				writeln!(
					user,
					"{} {} {} {} {} {}",
					kline.open_time, kline.open, kline.high, kline.low, kline.close, kline.volume,
				)
				.unwrap();
			}
		}
	}

	if !ctx.recent_trades.is_empty() {
		writeln!(user, "\n## Recent trades (for reflection)").unwrap();
		for trade in ctx.recent_trades {
			write!(
				user,
				"{} {} {} qty={} price={}",
				trade.action.as_str(),
				trade.symbol,
				trade.side.as_str(),
				trade.quantity,
				trade.price,
			)
			.unwrap();
			if let Some(pnl) = trade.realized_pnl {
				write!(user, " pnl={pnl:.2}").unwrap();
			}
			if !trade.reason.is_empty() {
				write!(user, " reason={}", trade.reason).unwrap();
			}
			writeln!(user).unwrap();
		}
	}

	if let Some(feedback) = ctx.venue_feedback {
		writeln!(user, "\n## Venue feedback from last cycle").unwrap();
		writeln!(user, "{feedback}").unwrap();
	}

	writeln!(
		user,
		"\nRespond with a JSON array of decisions for symbols: {}",
		ctx.record.trading_symbols
	)
	.unwrap();

	(system, user)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn record(custom_prompt: &str, override_base: bool) -> TraderRecord {
		serde_json::from_value(json!({
			"name": "t",
			"ai_model_id": 1,
			"exchange_id": 1,
			"trading_symbols": "BTCUSDT",
			"custom_prompt": custom_prompt,
			"override_base_prompt": override_base,
		}))
		.unwrap()
	}

	fn context<'a>(
		record: &'a TraderRecord,
		candles: &'a BTreeMap<String, BTreeMap<String, Vec<Kline>>>,
	) -> PromptContext<'a> {
		PromptContext {
			record,
			template_body: "BASE TEMPLATE".to_string(),
			wallet_balance: 100.0,
			unrealized_pnl: 5.0,
			total_equity: 105.0,
			available_margin: 88.0,
			positions: &[],
			candles,
			recent_trades: &[],
			venue_feedback: None,
		}
	}

	#[test]
	fn custom_prompt_appends() {
		let record = record("Extra instructions.", false);
		let candles = BTreeMap::new();
		let (system, user) = build_prompt(&context(&record, &candles));
		assert!(system.starts_with("BASE TEMPLATE"));
		assert!(system.ends_with("Extra instructions."));
		assert!(user.contains("available_margin: 88.00"));
	}

	#[test]
	fn custom_prompt_overrides() {
		let record = record("Only this.", true);
		let candles = BTreeMap::new();
		let (system, _) = build_prompt(&context(&record, &candles));
		assert_eq!(system, "Only this.");
	}

	#[test]
	fn candles_and_feedback_sections() {
		let record = record("", false);
		let mut candles = BTreeMap::new();
		candles.insert(
			"BTCUSDT".to_string(),
			BTreeMap::from([(
				"15m".to_string(),
				vec![Kline {
					open_time: 1,
					open: 100.0,
					high: 101.0,
					low: 99.0,
					close: 100.5,
					volume: 3.2,
					close_time: 899_999,
				}],
			)]),
		);
		let mut ctx = context(&record, &candles);
		ctx.venue_feedback = Some("insufficient margin on SOLUSDT open");
		let (_, user) = build_prompt(&ctx);
		assert!(user.contains("## BTCUSDT"));
		assert!(user.contains("### 15m"));
		assert!(user.contains("insufficient margin"));
	}
}
