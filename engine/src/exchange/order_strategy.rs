//! Order-strategy state machine: maps a target size onto a deterministic
//! sequence of submissions (market, post-only limit with market fallback, or
//! limit-only).

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::{OrderFill, OrderSide};
use crate::{errors::VenueError, store::OrderStrategyKind};

const FILL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The venue-level submissions the strategy machine drives. Implemented by
/// adapters that support resting limit orders.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OrderSubmission: Send + Sync {
	async fn submit_market(
		&self,
		symbol: &str,
		side: OrderSide,
		quantity: f64,
		reduce_only: bool,
	) -> Result<OrderFill, VenueError>;

	/// Returns the venue order id of the resting order.
	async fn submit_post_only_limit(
		&self,
		symbol: &str,
		side: OrderSide,
		quantity: f64,
		price: f64,
		reduce_only: bool,
	) -> Result<String, VenueError>;

	async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError>;

	/// Quantity filled so far on a resting order.
	async fn filled_quantity(&self, symbol: &str, order_id: &str)
		-> Result<f64, VenueError>;

	/// Mid price used to place the limit.
	async fn mid_price(&self, symbol: &str) -> Result<f64, VenueError>;
}

#[derive(Debug, Clone, Copy)]
pub struct StrategyParams {
	pub kind: OrderStrategyKind,
	pub side: OrderSide,
	pub quantity: f64,
	/// Relative offset applied to the mid price for the resting limit.
	pub limit_price_offset: f64,
	pub limit_timeout: Duration,
	pub reduce_only: bool,
}

/// Run the configured strategy to completion. Returns the aggregate fill;
/// `limit_only` reports an error when the order expires unfilled.
pub async fn execute_with_strategy(
	venue: &dyn OrderSubmission,
	symbol: &str,
	params: StrategyParams,
) -> Result<OrderFill, VenueError> {
	match params.kind {
		OrderStrategyKind::MarketOnly =>
			venue.submit_market(symbol, params.side, params.quantity, params.reduce_only).await,
		OrderStrategyKind::ConservativeHybrid => {
			let (filled, limit_fill) = limit_phase(venue, symbol, &params).await?;
			let residual = params.quantity - filled;
			if residual <= f64::EPSILON * params.quantity.max(1.0) {
				return Ok(limit_fill.expect("full fill implies a fill"));
			}
			info!(
				symbol,
				residual,
				"Limit phase expired, sweeping residual with a market order"
			);
			let market_fill =
				venue.submit_market(symbol, params.side, residual, params.reduce_only).await?;
			Ok(merge_fills(limit_fill, market_fill))
		},
		OrderStrategyKind::LimitOnly => {
			let (filled, limit_fill) = limit_phase(venue, symbol, &params).await?;
			if filled <= 0.0 {
				return Err(VenueError::Business(format!(
					"limit order for {symbol} expired unfilled"
				)));
			}
			let fill = limit_fill.expect("positive fill implies a fill");
			if filled < params.quantity {
				warn!(
					symbol,
					filled,
					requested = params.quantity,
					"Limit-only order partially filled before expiry"
				);
			}
			Ok(fill)
		},
	}
}

/// Place the post-only limit and poll until full fill or timeout, cancelling
/// on expiry. Returns the filled quantity and, if nonzero, the fill.
async fn limit_phase(
	venue: &dyn OrderSubmission,
	symbol: &str,
	params: &StrategyParams,
) -> Result<(f64, Option<OrderFill>), VenueError> {
	let mid = venue.mid_price(symbol).await?;
	let price = match params.side {
		OrderSide::Buy => mid * (1.0 + params.limit_price_offset),
		OrderSide::Sell => mid * (1.0 - params.limit_price_offset),
	};

	let order_id = venue
		.submit_post_only_limit(symbol, params.side, params.quantity, price, params.reduce_only)
		.await?;
	debug!(symbol, order_id, price, "Resting limit placed");

	let deadline = tokio::time::Instant::now() + params.limit_timeout;
	let mut filled = 0.0;
	loop {
		tokio::time::sleep(FILL_POLL_INTERVAL).await;
		filled = venue.filled_quantity(symbol, &order_id).await.unwrap_or(filled);
		if filled >= params.quantity - f64::EPSILON * params.quantity.max(1.0) {
			filled = params.quantity;
			break;
		}
		if tokio::time::Instant::now() >= deadline {
			if let Err(error) = venue.cancel_order(symbol, &order_id).await {
				warn!(symbol, order_id, %error, "Cancel of expired limit failed");
			}
			// One final read: the order may have filled while we cancelled
			filled = venue.filled_quantity(symbol, &order_id).await.unwrap_or(filled);
			break;
		}
	}

	let fill = (filled > 0.0).then(|| OrderFill {
		symbol: symbol.to_string(),
		side: params.side,
		quantity: filled,
		avg_price: price,
		order_id,
	});
	Ok((filled, fill))
}

fn merge_fills(limit: Option<OrderFill>, market: OrderFill) -> OrderFill {
	match limit {
		None => market,
		Some(limit) => {
			let quantity = limit.quantity + market.quantity;
			let avg_price = (limit.avg_price * limit.quantity +
				market.avg_price * market.quantity) /
				quantity;
			OrderFill { quantity, avg_price, ..market }
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn market_fill(symbol: &str, side: OrderSide, quantity: f64) -> OrderFill {
		OrderFill {
			symbol: symbol.to_string(),
			side,
			quantity,
			avg_price: 100.0,
			order_id: "market-1".to_string(),
		}
	}

	/// A venue whose resting limit reports `limit_fill` on every poll.
	fn resting_limit_venue(limit_fill: f64) -> MockOrderSubmission {
		let mut venue = MockOrderSubmission::new();
		venue.expect_mid_price().returning(|_| Ok(100.0));
		venue
			.expect_submit_post_only_limit()
			.times(1)
			.returning(|_, _, _, _, _| Ok("limit-1".to_string()));
		venue
			.expect_filled_quantity()
			.returning(move |_, _| Ok(limit_fill));
		venue
	}

	fn params(kind: OrderStrategyKind, side: OrderSide) -> StrategyParams {
		StrategyParams {
			kind,
			side,
			quantity: 2.0,
			limit_price_offset: 0.001,
			limit_timeout: Duration::from_secs(3),
			reduce_only: false,
		}
	}

	#[tokio::test]
	async fn market_only_submits_immediately() {
		// Any limit-phase call would fail the mock as unexpected
		let mut venue = MockOrderSubmission::new();
		venue
			.expect_submit_market()
			.times(1)
			.withf(|symbol, _, quantity, reduce_only| {
				symbol == "BTCUSDT" && *quantity == 2.0 && !*reduce_only
			})
			.returning(|symbol, side, quantity, _| Ok(market_fill(symbol, side, quantity)));

		let fill = execute_with_strategy(
			&venue,
			"BTCUSDT",
			params(OrderStrategyKind::MarketOnly, OrderSide::Buy),
		)
		.await
		.unwrap();
		assert_eq!(fill.quantity, 2.0);
	}

	#[tokio::test(start_paused = true)]
	async fn hybrid_falls_back_to_market_for_residual() {
		let mut venue = resting_limit_venue(0.5);
		venue
			.expect_cancel_order()
			.times(1)
			.withf(|_, order_id| order_id == "limit-1")
			.returning(|_, _| Ok(()));
		venue
			.expect_submit_market()
			.times(1)
			.withf(|_, _, quantity, _| (quantity - 1.5).abs() < 1e-9)
			.returning(|symbol, side, quantity, _| Ok(market_fill(symbol, side, quantity)));

		let fill = execute_with_strategy(
			&venue,
			"BTCUSDT",
			params(OrderStrategyKind::ConservativeHybrid, OrderSide::Buy),
		)
		.await
		.unwrap();
		assert!((fill.quantity - 2.0).abs() < 1e-9);
	}

	#[tokio::test(start_paused = true)]
	async fn limit_rests_on_the_passive_side_of_mid() {
		let mut buy_venue = MockOrderSubmission::new();
		buy_venue.expect_mid_price().returning(|_| Ok(100.0));
		buy_venue
			.expect_submit_post_only_limit()
			.times(1)
			.withf(|_, _, _, price, _| (price - 100.1).abs() < 1e-9)
			.returning(|_, _, _, _, _| Ok("limit-1".to_string()));
		buy_venue.expect_filled_quantity().returning(|_, _| Ok(2.0));
		execute_with_strategy(
			&buy_venue,
			"BTCUSDT",
			params(OrderStrategyKind::ConservativeHybrid, OrderSide::Buy),
		)
		.await
		.unwrap();

		let mut sell_venue = MockOrderSubmission::new();
		sell_venue.expect_mid_price().returning(|_| Ok(100.0));
		sell_venue
			.expect_submit_post_only_limit()
			.times(1)
			.withf(|_, _, _, price, _| (price - 99.9).abs() < 1e-9)
			.returning(|_, _, _, _, _| Ok("limit-1".to_string()));
		sell_venue.expect_filled_quantity().returning(|_, _| Ok(2.0));
		execute_with_strategy(
			&sell_venue,
			"BTCUSDT",
			params(OrderStrategyKind::ConservativeHybrid, OrderSide::Sell),
		)
		.await
		.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn hybrid_full_limit_fill_skips_market() {
		// No submit_market expectation: a market sweep would be unexpected
		let fill = execute_with_strategy(
			&resting_limit_venue(2.0),
			"BTCUSDT",
			params(OrderStrategyKind::ConservativeHybrid, OrderSide::Sell),
		)
		.await
		.unwrap();
		assert_eq!(fill.quantity, 2.0);
	}

	#[tokio::test(start_paused = true)]
	async fn limit_only_reports_unfilled() {
		let mut venue = resting_limit_venue(0.0);
		venue
			.expect_cancel_order()
			.times(1)
			.withf(|_, order_id| order_id == "limit-1")
			.returning(|_, _| Ok(()));

		let result = execute_with_strategy(
			&venue,
			"BTCUSDT",
			params(OrderStrategyKind::LimitOnly, OrderSide::Buy),
		)
		.await;
		assert!(matches!(result, Err(VenueError::Business(_))));
	}

	#[tokio::test(start_paused = true)]
	async fn limit_only_partial_fill_is_reported() {
		let mut venue = resting_limit_venue(0.7);
		venue.expect_cancel_order().returning(|_, _| Ok(()));

		let fill = execute_with_strategy(
			&venue,
			"BTCUSDT",
			params(OrderStrategyKind::LimitOnly, OrderSide::Buy),
		)
		.await
		.unwrap();
		assert!((fill.quantity - 0.7).abs() < 1e-9);
	}
}
