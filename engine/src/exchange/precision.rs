//! Per-symbol precision rules and quantity formatting.

use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::errors::VenueError;

#[derive(Debug, Clone, Copy)]
pub struct SymbolPrecision {
	pub price_precision: u32,
	pub quantity_precision: u32,
	pub tick_size: f64,
	pub step_size: f64,
}

impl Default for SymbolPrecision {
	fn default() -> Self {
		// Conservative fallback when venue metadata is unavailable
		Self { price_precision: 2, quantity_precision: 3, tick_size: 0.01, step_size: 0.001 }
	}
}

/// Symbol metadata loaded from the venue on first use. One cache per adapter.
#[derive(Default)]
pub struct PrecisionCache {
	inner: RwLock<HashMap<String, SymbolPrecision>>,
}

impl PrecisionCache {
	pub fn get(&self, symbol: &str) -> Option<SymbolPrecision> {
		self.inner.read().get(symbol).copied()
	}

	pub fn insert(&self, symbol: &str, precision: SymbolPrecision) {
		self.inner.write().insert(symbol.to_string(), precision);
	}

	pub fn is_empty(&self) -> bool {
		self.inner.read().is_empty()
	}
}

/// Round `quantity` toward zero to the step size and format it at the
/// quantity precision. The result never exceeds the input; formatting an
/// already-formatted quantity returns the same string.
pub fn format_quantity_with(
	precision: &SymbolPrecision,
	quantity: f64,
) -> Result<String, VenueError> {
	if !quantity.is_finite() || quantity < 0.0 {
		return Err(VenueError::Business(format!("invalid quantity {quantity}")));
	}
	// Binary float noise (0.003 arriving as 0.002999...) must not eat a step,
	// so both operands are normalised before dividing.
	let quantity = Decimal::from_f64_retain(quantity)
		.ok_or_else(|| VenueError::Business(format!("unrepresentable quantity {quantity}")))?
		.round_dp(12);
	let step = Decimal::from_f64_retain(precision.step_size)
		.map(|s| s.round_dp(12))
		.filter(|s| !s.is_zero())
		.ok_or_else(|| {
			VenueError::Business(format!("invalid step size {}", precision.step_size))
		})?;

	let steps = (quantity / step).trunc();
	let mut rounded = (steps * step).round_dp(precision.quantity_precision);

	if rounded.is_zero() {
		return Err(VenueError::Business(format!(
			"quantity {quantity} rounds to zero at step {step}"
		)));
	}

	rounded.rescale(precision.quantity_precision);
	Ok(rounded.to_string())
}

/// Price snapped to the tick size, half-even toward zero bias is irrelevant at
/// tick granularity; ordinary truncation keeps us inside the band.
pub fn format_price_with(precision: &SymbolPrecision, price: f64) -> Result<String, VenueError> {
	if !price.is_finite() || price <= 0.0 {
		return Err(VenueError::Business(format!("invalid price {price}")));
	}
	let price = Decimal::from_f64_retain(price)
		.ok_or_else(|| VenueError::Business(format!("unrepresentable price {price}")))?
		.round_dp(12);
	let tick = Decimal::from_f64_retain(precision.tick_size)
		.map(|t| t.round_dp(12))
		.filter(|t| !t.is_zero())
		.ok_or_else(|| {
			VenueError::Business(format!("invalid tick size {}", precision.tick_size))
		})?;

	let mut snapped = ((price / tick).trunc() * tick).round_dp(precision.price_precision);
	snapped.rescale(precision.price_precision);
	Ok(snapped.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn precision(step: f64, decimals: u32) -> SymbolPrecision {
		SymbolPrecision {
			price_precision: 2,
			quantity_precision: decimals,
			tick_size: 0.01,
			step_size: step,
		}
	}

	#[test]
	fn rounds_toward_zero() {
		let p = precision(0.001, 3);
		assert_eq!(format_quantity_with(&p, 0.0019).unwrap(), "0.001");
		assert_eq!(format_quantity_with(&p, 0.123456).unwrap(), "0.123");
		// Never rounds up
		assert_eq!(format_quantity_with(&p, 0.9999).unwrap(), "0.999");
	}

	#[test]
	fn formatting_is_idempotent() {
		let p = precision(0.001, 3);
		for quantity in [0.0019, 0.123456, 1.0, 123.4567, 0.001] {
			let once = format_quantity_with(&p, quantity).unwrap();
			let twice = format_quantity_with(&p, once.parse().unwrap()).unwrap();
			assert_eq!(once, twice, "not idempotent for {quantity}");
		}
	}

	#[test]
	fn result_never_exceeds_input() {
		let p = precision(0.001, 3);
		for quantity in [0.0019, 0.123456, 5.4321, 0.002] {
			let formatted: f64 = format_quantity_with(&p, quantity).unwrap().parse().unwrap();
			assert!(formatted <= quantity);
		}
	}

	#[test]
	fn zero_after_rounding_is_refused() {
		let p = precision(0.001, 3);
		assert!(format_quantity_with(&p, 0.0004).is_err());
		assert!(format_quantity_with(&p, 0.0).is_err());
	}

	#[test]
	fn coarse_steps() {
		// Whole-coin step sizes
		let p = SymbolPrecision {
			price_precision: 4,
			quantity_precision: 0,
			tick_size: 0.0001,
			step_size: 1.0,
		};
		assert_eq!(format_quantity_with(&p, 12.9).unwrap(), "12");
		assert_eq!(format_quantity_with(&p, 3.0).unwrap(), "3");
	}

	#[test]
	fn price_snapping() {
		let p = precision(0.001, 3);
		assert_eq!(format_price_with(&p, 123.456).unwrap(), "123.45");
		assert!(format_price_with(&p, -1.0).is_err());
	}
}
