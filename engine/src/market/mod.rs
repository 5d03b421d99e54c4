//! Market data hub: kline snapshots with failover across REST sources and a
//! websocket-fed candle cache shared by all agents.

mod hub;
mod source;
mod ws;

pub use hub::MarketDataHub;
pub use source::{BinanceKlineSource, KlineSource, OkxKlineSource};
pub use ws::{CandleCache, CandleStreamMonitor};

use serde::{Deserialize, Serialize};

/// One candle. Series are ordered by `open_time` ascending; the newest candle
/// is last and may still be forming.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
	pub open_time: i64,
	pub open: f64,
	pub high: f64,
	pub low: f64,
	pub close: f64,
	pub volume: f64,
	pub close_time: i64,
}

/// True iff the series is monotone ascending by open time.
pub fn is_ordered(klines: &[Kline]) -> bool {
	klines.windows(2).all(|w| w[0].open_time < w[1].open_time)
}

#[cfg(test)]
mod tests {
	use super::*;

	pub fn kline(open_time: i64, close: f64) -> Kline {
		Kline {
			open_time,
			open: close,
			high: close,
			low: close,
			close,
			volume: 1.0,
			close_time: open_time + 59_999,
		}
	}

	#[test]
	fn ordering_check() {
		assert!(is_ordered(&[kline(1, 1.0), kline(2, 1.0), kline(3, 1.0)]));
		assert!(!is_ordered(&[kline(2, 1.0), kline(1, 1.0)]));
		assert!(!is_ordered(&[kline(1, 1.0), kline(1, 1.0)]));
		assert!(is_ordered(&[]));
	}
}
