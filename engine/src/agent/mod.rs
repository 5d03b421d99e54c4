//! The per-agent control loop: scan, decide, validate, execute, record.

mod risk;

pub use risk::{reopened_after_close, OpenVerdict, RiskState};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
	constants::{
		AI_REQUEST_TIMEOUT, AVAILABLE_MARGIN_FRACTION, DEFAULT_SCAN_INTERVAL, MIN_SCAN_INTERVAL,
	},
	decision::{
		build_prompt, parse_decisions, validate_decision, AiClient, Decision, DecisionAction,
		PromptContext, TemplateStore,
	},
	errors::VenueError,
	exchange::{
		execute_with_strategy, with_retry, OrderFill, OrderSide, StrategyParams, Trader,
	},
	market::{Kline, MarketDataHub},
	store::{
		AccountSnapshot, AgentState, DecisionRecord, OrderStrategyKind, Store, TradeAction,
		TradeEvent, TradeSide, TraderRecord,
	},
};

/// Cycle-fresh account view shared with the manager for fleet aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
	pub wallet_balance: f64,
	pub unrealized_pnl: f64,
	pub total_equity: f64,
	pub margin_used: f64,
	pub position_count: usize,
	pub updated_at: chrono::DateTime<Utc>,
}

pub type SharedStatus = Arc<RwLock<Option<LiveStatus>>>;

pub struct AutoTrader {
	record: TraderRecord,
	trader: Box<dyn Trader>,
	ai: AiClient,
	store: Store,
	hub: Arc<MarketDataHub>,
	templates: Arc<TemplateStore>,
	status: SharedStatus,
	state: AgentState,
	risk: RiskState,
	/// Business-level venue error from the previous cycle, surfaced to the
	/// prompt as context.
	venue_feedback: Option<String>,
}

const CANDLES_PER_TIMEFRAME: u32 = 50;
const RECENT_TRADES_FOR_REFLECTION: i64 = 10;

impl AutoTrader {
	pub fn new(
		record: TraderRecord,
		trader: Box<dyn Trader>,
		ai: AiClient,
		store: Store,
		hub: Arc<MarketDataHub>,
		templates: Arc<TemplateStore>,
		status: SharedStatus,
	) -> Self {
		let state = store
			.load_trader_state(&record.id)
			.unwrap_or_default()
			.unwrap_or_default();
		let risk = serde_json::from_value(state.extra["risk"].clone()).unwrap_or_default();
		Self {
			record,
			trader,
			ai,
			store,
			hub,
			templates,
			status,
			state,
			risk,
			venue_feedback: None,
		}
	}

	fn scan_interval(&self) -> Duration {
		effective_scan_interval(&self.record)
	}

	/// The loop. Never panics the process: every cycle failure is logged,
	/// recorded, and followed by the next tick.
	pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
		info!(trader_id = %self.record.id, name = %self.record.name, "Agent loop starting");

		// Crash recovery: the trade-history fold is the source of truth for
		// what we believe is open.
		match self.store.get_open_positions(&self.record.id) {
			Ok(open) if !open.is_empty() => {
				info!(
					trader_id = %self.record.id,
					positions = ?open.iter().map(|p| p.key()).collect::<Vec<_>>(),
					"Recovered open positions from trade history"
				);
			},
			Ok(_) => {},
			Err(error) => {
				error!(trader_id = %self.record.id, %error, "Could not rebuild position view");
			},
		}

		loop {
			self.run_cycle(&mut shutdown).await;
			self.persist_state();

			if *shutdown.borrow() {
				break;
			}
			tokio::select! {
				_ = tokio::time::sleep(self.scan_interval()) => {},
				_ = shutdown.changed() => break,
			}
		}

		self.trader.cleanup().await;
		info!(trader_id = %self.record.id, "Agent loop stopped");
	}

	fn persist_state(&mut self) {
		self.state.peak_equity = self.risk.peak_equity;
		if let Ok(risk) = serde_json::to_value(&self.risk) {
			if !self.state.extra.is_object() {
				self.state.extra = serde_json::json!({});
			}
			self.state.extra["risk"] = risk;
		}
		if let Err(error) = self.store.save_trader_state(&self.record.id, &self.state) {
			error!(trader_id = %self.record.id, %error, "Could not persist agent state");
		}
	}

	fn record_cycle(
		&self,
		cycle_number: i64,
		prompt_summary: String,
		raw_response: String,
		actions: &[Decision],
		account: AccountSnapshot,
		error: Option<String>,
	) {
		let record = DecisionRecord {
			id: 0,
			trader_id: self.record.id.clone(),
			cycle_number,
			timestamp: Utc::now(),
			prompt_summary,
			raw_response,
			actions: serde_json::to_string(actions).unwrap_or_else(|_| "[]".to_string()),
			account,
			success: error.is_none(),
			error: error.unwrap_or_default(),
		};
		if let Err(error) = self.store.record_decision(&record) {
			error!(trader_id = %self.record.id, %error, "Could not persist decision record");
		}
	}

	async fn run_cycle(&mut self, shutdown: &mut watch::Receiver<bool>) {
		let cycle_number = self.store.next_cycle_number(&self.record.id).unwrap_or(0);
		self.state.call_count += 1;

		// 1. Account state. Nothing is in flight yet, so cancellation here
		// just records the cycle and returns.
		let balance = tokio::select! {
			balance = with_retry("get_balance", || self.trader.get_balance()) => balance,
			_ = shutdown.changed() => {
				self.record_cycle(
					cycle_number,
					String::new(),
					String::new(),
					&[],
					AccountSnapshot {
						initial_balance: self.record.initial_balance,
						..Default::default()
					},
					Some("cancelled".to_string()),
				);
				return;
			},
		};
		let balance = match balance {
			Ok(balance) => balance,
			Err(error) => {
				error!(trader_id = %self.record.id, %error, "Cycle aborted at balance fetch");
				self.record_cycle(
					cycle_number,
					String::new(),
					String::new(),
					&[],
					AccountSnapshot {
						initial_balance: self.record.initial_balance,
						..Default::default()
					},
					Some(format!("balance fetch failed: {error}")),
				);
				return;
			},
		};
		let equity = balance.total_equity();

		// First successful cycle on a fresh agent captures the P&L baseline.
		if self.record.initial_balance <= 0.0 && equity > 0.0 {
			if self
				.store
				.update_trader_initial_balance(&self.record.id, equity)
				.is_ok()
			{
				info!(trader_id = %self.record.id, equity, "Captured initial balance baseline");
				self.record.initial_balance = equity;
			}
		}

		// 2. Margin reserve for fees, slippage and the liquidation buffer
		let available_margin = balance.wallet_balance * AVAILABLE_MARGIN_FRACTION;

		// 3. Positions and market snapshots
		let positions =
			match with_retry("get_positions", || self.trader.get_positions()).await {
				Ok(positions) => positions,
				Err(error) => {
					error!(trader_id = %self.record.id, %error, "Cycle aborted at position fetch");
					self.record_cycle(
						cycle_number,
						String::new(),
						String::new(),
						&[],
						self.snapshot(&balance, 0.0),
						Some(format!("position fetch failed: {error}")),
					);
					return;
				},
			};
		let margin_used: f64 = positions
			.iter()
			.map(|p| p.quantity * p.mark_price / p.leverage.max(1.0))
			.sum();

		*self.status.write() = Some(LiveStatus {
			wallet_balance: balance.wallet_balance,
			unrealized_pnl: balance.unrealized_pnl,
			total_equity: equity,
			margin_used,
			position_count: positions.len(),
			updated_at: Utc::now(),
		});

		let account = self.snapshot(&balance, margin_used);

		if equity <= 0.0 {
			warn!(trader_id = %self.record.id, equity, "Equity depleted, skipping decision");
			self.record_cycle(
				cycle_number,
				String::new(),
				String::new(),
				&[],
				account,
				Some("degraded: equity is zero or negative".to_string()),
			);
			return;
		}

		let symbols = self.symbol_universe();
		let candles = self.collect_candles(&symbols).await;

		// 4. Prompt and provider call
		let recent_trades = self
			.store
			.get_trade_history(&self.record.id, RECENT_TRADES_FOR_REFLECTION)
			.unwrap_or_default();
		let (system_prompt, user_prompt) = build_prompt(&PromptContext {
			record: &self.record,
			template_body: self.templates.body(&self.record.system_prompt_template),
			wallet_balance: balance.wallet_balance,
			unrealized_pnl: balance.unrealized_pnl,
			total_equity: equity,
			available_margin,
			positions: &positions,
			candles: &candles,
			recent_trades: &recent_trades,
			venue_feedback: self.venue_feedback.as_deref(),
		});
		self.venue_feedback = None;

		let response = tokio::select! {
			response = self.ai.chat(&system_prompt, &user_prompt, AI_REQUEST_TIMEOUT) => response,
			_ = shutdown.changed() => {
				self.record_cycle(
					cycle_number,
					symbols.join(","),
					String::new(),
					&[],
					account,
					Some("cancelled while awaiting provider".to_string()),
				);
				return;
			},
		};
		let raw_response = match response {
			Ok(raw) => raw,
			Err(error) => {
				warn!(trader_id = %self.record.id, %error, "Provider call failed");
				self.record_cycle(
					cycle_number,
					symbols.join(","),
					String::new(),
					&[],
					account,
					Some(error.to_string()),
				);
				return;
			},
		};

		// 5. Parse, validate, dispatch sequentially
		let decisions = match parse_decisions(&raw_response) {
			Ok(decisions) => decisions,
			Err(error) => {
				warn!(trader_id = %self.record.id, %error, "Rejecting decision list");
				self.record_cycle(
					cycle_number,
					symbols.join(","),
					raw_response,
					&[],
					account,
					Some(error.to_string()),
				);
				return;
			},
		};

		let open_verdict = self.risk.evaluate(&self.record, equity, Utc::now());
		let mut closed_this_cycle: Vec<(String, TradeSide)> = Vec::new();
		let mut cycle_error: Option<String> = None;

		for mut decision in decisions.clone() {
			if let Err(error) = validate_decision(&mut decision, &self.record, equity) {
				warn!(
					trader_id = %self.record.id,
					symbol = %decision.symbol,
					%error,
					"Skipping invalid decision"
				);
				continue;
			}
			match self
				.dispatch(&decision, &open_verdict, &mut closed_this_cycle)
				.await
			{
				Ok(()) => {},
				Err(VenueError::Auth(message)) => {
					// Credentials are broken; no point trying further items
					cycle_error = Some(format!("venue auth failure: {message}"));
					break;
				},
				Err(VenueError::Business(message)) => {
					self.venue_feedback = Some(format!(
						"{} {}: {message}",
						action_name(decision.action),
						decision.symbol
					));
				},
				Err(error) => {
					warn!(
						trader_id = %self.record.id,
						symbol = %decision.symbol,
						%error,
						"Dispatch failed"
					);
				},
			}

			// Stop() lands between dispatch items, never in the middle of one
			if *shutdown.borrow() {
				cycle_error = Some("cancelled mid-cycle".to_string());
				break;
			}
		}

		// 6 & 7. Record the cycle; state persists in the caller
		self.record_cycle(
			cycle_number,
			symbols.join(","),
			raw_response,
			&decisions,
			account,
			cycle_error,
		);
	}

	fn snapshot(&self, balance: &crate::exchange::Balance, margin_used: f64) -> AccountSnapshot {
		AccountSnapshot {
			wallet_balance: balance.wallet_balance,
			unrealized_pnl: balance.unrealized_pnl,
			total_equity: balance.total_equity(),
			margin_used,
			initial_balance: self.record.initial_balance,
		}
	}

	/// The agent's own symbols, unioned with the shared coin sources it
	/// subscribes to.
	fn symbol_universe(&self) -> Vec<String> {
		let mut symbols = self.record.symbols();
		if self.record.use_coin_pool || self.record.use_oi_top {
			if let Ok(extra) = self.store.get_custom_coins() {
				symbols.extend(extra);
			}
		}
		symbols.sort();
		symbols.dedup();
		symbols
	}

	async fn collect_candles(
		&self,
		symbols: &[String],
	) -> BTreeMap<String, BTreeMap<String, Vec<Kline>>> {
		let mut candles = BTreeMap::new();
		for symbol in symbols {
			let mut per_timeframe = BTreeMap::new();
			for timeframe in self.record.timeframe_list() {
				match self.hub.get_klines(symbol, &timeframe, CANDLES_PER_TIMEFRAME).await {
					Ok(klines) => {
						per_timeframe.insert(timeframe, klines);
					},
					Err(error) => {
						warn!(symbol, timeframe, %error, "Skipping candle series");
					},
				}
			}
			if !per_timeframe.is_empty() {
				candles.insert(symbol.clone(), per_timeframe);
			}
		}
		candles
	}

	async fn dispatch(
		&mut self,
		decision: &Decision,
		open_verdict: &OpenVerdict,
		closed_this_cycle: &mut Vec<(String, TradeSide)>,
	) -> Result<(), VenueError> {
		match decision.action {
			DecisionAction::Wait => Ok(()),
			DecisionAction::OpenLong =>
				self.execute_open(decision, TradeSide::Long, open_verdict, closed_this_cycle)
					.await,
			DecisionAction::OpenShort =>
				self.execute_open(decision, TradeSide::Short, open_verdict, closed_this_cycle)
					.await,
			DecisionAction::CloseLong =>
				self.execute_close(decision, TradeSide::Long, 100.0, closed_this_cycle).await,
			DecisionAction::CloseShort =>
				self.execute_close(decision, TradeSide::Short, 100.0, closed_this_cycle).await,
			DecisionAction::PartialClose => {
				// Direction comes from whichever side is open
				let side = self
					.open_side(&decision.symbol)?
					.ok_or_else(|| {
						VenueError::Business(format!(
							"partial_close: no open position on {}",
							decision.symbol
						))
					})?;
				self.execute_close(decision, side, decision.close_percentage, closed_this_cycle)
					.await
			},
			DecisionAction::UpdateStopLoss => self.execute_protective_update(decision, true).await,
			DecisionAction::UpdateTakeProfit =>
				self.execute_protective_update(decision, false).await,
		}
	}

	fn open_side(&self, symbol: &str) -> Result<Option<TradeSide>, VenueError> {
		let positions = self
			.store
			.get_open_positions(&self.record.id)
			.map_err(|e| VenueError::Retryable(e.to_string()))?;
		Ok(positions.iter().find(|p| p.symbol == symbol).map(|p| p.side))
	}

	fn residual_quantity(&self, symbol: &str, side: TradeSide) -> Result<f64, VenueError> {
		let positions = self
			.store
			.get_open_positions(&self.record.id)
			.map_err(|e| VenueError::Retryable(e.to_string()))?;
		Ok(positions
			.iter()
			.find(|p| p.symbol == symbol && p.side == side)
			.map(|p| p.quantity)
			.unwrap_or(0.0))
	}

	async fn submit(
		&self,
		symbol: &str,
		side: OrderSide,
		quantity: f64,
		reduce_only: bool,
	) -> Result<OrderFill, VenueError> {
		if self.record.order_strategy != OrderStrategyKind::MarketOnly {
			if let Some(venue) = self.trader.order_submission() {
				return execute_with_strategy(
					venue,
					symbol,
					StrategyParams {
						kind: self.record.order_strategy,
						side,
						quantity,
						limit_price_offset: self.record.limit_price_offset,
						limit_timeout: Duration::from_secs(
							self.record.limit_timeout_seconds.max(1) as u64,
						),
						reduce_only,
					},
				)
				.await;
			}
		}
		match (side, reduce_only) {
			(OrderSide::Buy, false) => self.trader.open_long(symbol, quantity, 0.0).await,
			(OrderSide::Sell, false) => self.trader.open_short(symbol, quantity, 0.0).await,
			(OrderSide::Sell, true) => self.trader.close_long(symbol, quantity).await,
			(OrderSide::Buy, true) => self.trader.close_short(symbol, quantity).await,
		}
	}

	async fn execute_open(
		&mut self,
		decision: &Decision,
		side: TradeSide,
		open_verdict: &OpenVerdict,
		closed_this_cycle: &[(String, TradeSide)],
	) -> Result<(), VenueError> {
		if let OpenVerdict::Blocked(reason) = open_verdict {
			warn!(trader_id = %self.record.id, symbol = %decision.symbol, reason, "Open blocked");
			return Ok(());
		}
		if reopened_after_close(closed_this_cycle, &decision.symbol, side) {
			warn!(
				trader_id = %self.record.id,
				symbol = %decision.symbol,
				"Skipping re-open of a position closed this cycle"
			);
			return Ok(());
		}

		let symbol = &decision.symbol;
		let price = with_retry("get_market_price", || self.trader.get_market_price(symbol))
			.await?;
		let quantity: f64 = self
			.trader
			.format_quantity(symbol, decision.position_size_usd / price)
			.await?
			.parse()
			.map_err(|_| VenueError::Business("unparseable formatted quantity".to_string()))?;

		self.trader.set_leverage(symbol, decision.leverage).await?;
		self.trader.set_margin_mode(symbol, self.record.is_cross_margin).await?;

		let fill = self.submit(symbol, OrderSide::opening(side), quantity, false).await?;
		let fill_price = if fill.avg_price > 0.0 { fill.avg_price } else { price };

		// Protective orders ride on the filled size
		if decision.stop_loss > 0.0 {
			if let Err(error) = self
				.trader
				.set_stop_loss(symbol, side, fill.quantity, decision.stop_loss)
				.await
			{
				warn!(symbol, %error, "Stop-loss placement failed after open");
			}
		}
		if decision.take_profit > 0.0 {
			if let Err(error) = self
				.trader
				.set_take_profit(symbol, side, fill.quantity, decision.take_profit)
				.await
			{
				warn!(symbol, %error, "Take-profit placement failed after open");
			}
		}

		self.append_trade(TradeEvent {
			id: 0,
			trader_id: self.record.id.clone(),
			symbol: symbol.clone(),
			side,
			action: TradeAction::Open,
			quantity: fill.quantity,
			price: fill_price,
			timestamp: Utc::now(),
			reason: decision.reasoning.clone(),
			stop_loss: decision.stop_loss,
			take_profit: decision.take_profit,
			realized_pnl: None,
		});
		info!(
			trader_id = %self.record.id,
			symbol = %symbol,
			side = side.as_str(),
			quantity = fill.quantity,
			price = fill_price,
			"Opened position"
		);
		Ok(())
	}

	async fn execute_close(
		&mut self,
		decision: &Decision,
		side: TradeSide,
		percentage: f64,
		closed_this_cycle: &mut Vec<(String, TradeSide)>,
	) -> Result<(), VenueError> {
		let symbol = &decision.symbol;
		let residual = self.residual_quantity(symbol, side)?;
		if residual <= 0.0 {
			return Err(VenueError::Business(format!(
				"no open {} position on {symbol} to close",
				side.as_str()
			)));
		}
		let entry_price = self
			.store
			.get_last_open_trade(&self.record.id, symbol, side)
			.ok()
			.flatten()
			.map(|e| e.price)
			.unwrap_or(0.0);

		let full_close = percentage >= 100.0 - f64::EPSILON;
		let target = residual * (percentage / 100.0).min(1.0);
		let quantity: f64 = self
			.trader
			.format_quantity(symbol, target)
			.await?
			.parse()
			.map_err(|_| VenueError::Business("unparseable formatted quantity".to_string()))?;

		let fill = self.submit(symbol, OrderSide::closing(side), quantity, true).await?;
		let exit_price = if fill.avg_price > 0.0 {
			fill.avg_price
		} else {
			with_retry("get_market_price", || self.trader.get_market_price(symbol)).await?
		};

		let realized = match side {
			TradeSide::Long => (exit_price - entry_price) * fill.quantity,
			TradeSide::Short => (entry_price - exit_price) * fill.quantity,
		};

		if full_close {
			if let Err(error) = self.trader.cancel_stop_orders(symbol).await {
				warn!(symbol, %error, "Could not cancel protective orders after close");
			}
		}

		self.append_trade(TradeEvent {
			id: 0,
			trader_id: self.record.id.clone(),
			symbol: symbol.clone(),
			side,
			action: if full_close { TradeAction::Close } else { TradeAction::PartialClose },
			quantity: fill.quantity,
			price: exit_price,
			timestamp: Utc::now(),
			reason: decision.reasoning.clone(),
			stop_loss: 0.0,
			take_profit: 0.0,
			realized_pnl: Some(realized),
		});
		closed_this_cycle.push((symbol.clone(), side));
		info!(
			trader_id = %self.record.id,
			symbol = %symbol,
			side = side.as_str(),
			quantity = fill.quantity,
			realized,
			"Closed position"
		);
		Ok(())
	}

	async fn execute_protective_update(
		&mut self,
		decision: &Decision,
		is_stop_loss: bool,
	) -> Result<(), VenueError> {
		let symbol = &decision.symbol;
		let Some(side) = self.open_side(symbol)? else {
			return Err(VenueError::Business(format!(
				"no open position on {symbol} for a protective update"
			)));
		};
		let residual = self.residual_quantity(symbol, side)?;

		if is_stop_loss {
			self.trader
				.set_stop_loss(symbol, side, residual, decision.new_stop_loss)
				.await?;
		} else {
			self.trader
				.set_take_profit(symbol, side, residual, decision.new_take_profit)
				.await?;
		}
		info!(
			trader_id = %self.record.id,
			symbol = %symbol,
			price = if is_stop_loss { decision.new_stop_loss } else { decision.new_take_profit },
			kind = if is_stop_loss { "stop_loss" } else { "take_profit" },
			"Updated protective order"
		);
		Ok(())
	}

	fn append_trade(&self, event: TradeEvent) {
		if let Err(error) = self.store.record_trade(&event) {
			error!(trader_id = %self.record.id, %error, "Could not persist trade event");
		}
	}
}

/// Scan interval with the documented clamping: zero or negative means the
/// default, anything below a minute is raised to a minute.
pub fn effective_scan_interval(record: &TraderRecord) -> Duration {
	if record.scan_interval_minutes <= 0 {
		return DEFAULT_SCAN_INTERVAL;
	}
	MIN_SCAN_INTERVAL.max(Duration::from_secs(record.scan_interval_minutes as u64 * 60))
}

fn action_name(action: DecisionAction) -> &'static str {
	match action {
		DecisionAction::OpenLong => "open_long",
		DecisionAction::OpenShort => "open_short",
		DecisionAction::CloseLong => "close_long",
		DecisionAction::CloseShort => "close_short",
		DecisionAction::PartialClose => "partial_close",
		DecisionAction::UpdateStopLoss => "update_stop_loss",
		DecisionAction::UpdateTakeProfit => "update_take_profit",
		DecisionAction::Wait => "wait",
	}
}
