//! Supertrend indicator.
//!
//! ```text
//! hl2        = (high + low) / 2
//! tr[i]      = max(high - low, |high - close[i-1]|, |low - close[i-1]|)
//! atr[p]     = mean(tr[1..=p]);  atr[i] = (atr[i-1] * (p-1) + tr[i]) / p
//! upper/lower = hl2 ± multiplier * atr
//! ```
//!
//! Final bands carry forward: the lower band never falls while the previous
//! close stayed above it, the upper band never rises while the previous
//! close stayed below it. The first defined bar starts bearish. A bearish
//! series turns bullish when close ends above the upper band; a bullish one
//! turns bearish when close ends below the lower band.

use mirror_core::types::Candle;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalError {
    #[error("input length mismatch: high={high} low={low} close={close}")]
    LengthMismatch { high: usize, low: usize, close: usize },

    #[error("period must be at least 1")]
    InvalidPeriod,
}

/// Trend direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Close above the trend line (`+1`).
    Bullish,
    /// Close below the trend line (`-1`).
    Bearish,
}

impl Direction {
    pub fn value(self) -> i8 {
        match self {
            Self::Bullish => 1,
            Self::Bearish => -1,
        }
    }
}

/// Supertrend output, index-aligned with the input. Entries before
/// `period` are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Supertrend {
    pub trend: Vec<Option<f64>>,
    pub direction: Vec<Option<Direction>>,
}

impl Supertrend {
    /// `(previous, last)` direction when both are defined.
    pub fn last_pair(&self) -> Option<(Direction, Direction)> {
        match self.direction.as_slice() {
            [.., Some(prev), Some(last)] => Some((*prev, *last)),
            _ => None,
        }
    }

    /// The direction the series flipped to on its last bar, if it flipped.
    pub fn last_flip(&self) -> Option<Direction> {
        self.last_pair().filter(|(prev, last)| prev != last).map(|(_, last)| last)
    }
}

/// Wilder ATR. `atr[period]` is the mean of `tr[1..=period]`.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = close.len();
    let mut out = vec![None; n];
    if period == 0 || n <= period {
        return out;
    }
    let tr = |i: usize| {
        let range = high[i] - low[i];
        range.max((high[i] - close[i - 1]).abs()).max((low[i] - close[i - 1]).abs())
    };
    let p = period as f64;
    let mut value = (1..=period).map(tr).sum::<f64>() / p;
    out[period] = Some(value);
    for i in period + 1..n {
        value = (value * (p - 1.0) + tr(i)) / p;
        out[i] = Some(value);
    }
    out
}

pub fn supertrend(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
    multiplier: f64,
) -> Result<Supertrend, SignalError> {
    if high.len() != close.len() || low.len() != close.len() {
        return Err(SignalError::LengthMismatch { high: high.len(), low: low.len(), close: close.len() });
    }
    if period == 0 {
        return Err(SignalError::InvalidPeriod);
    }

    let n = close.len();
    let atr = atr(high, low, close, period);
    let mut out = Supertrend { trend: vec![None; n], direction: vec![None; n] };

    let mut prev: Option<(f64, f64, Direction)> = None;
    for i in 0..n {
        let Some(a) = atr[i] else { continue };
        let hl2 = (high[i] + low[i]) / 2.0;
        let mut upper = hl2 + multiplier * a;
        let mut lower = hl2 - multiplier * a;

        let direction = match prev {
            None => Direction::Bearish,
            Some((prev_upper, prev_lower, prev_dir)) => {
                if !(lower > prev_lower || close[i - 1] < prev_lower) {
                    lower = prev_lower;
                }
                if !(upper < prev_upper || close[i - 1] > prev_upper) {
                    upper = prev_upper;
                }
                match prev_dir {
                    Direction::Bearish if close[i] > upper => Direction::Bullish,
                    Direction::Bullish if close[i] < lower => Direction::Bearish,
                    d => d,
                }
            }
        };

        out.trend[i] = Some(match direction {
            Direction::Bullish => lower,
            Direction::Bearish => upper,
        });
        out.direction[i] = Some(direction);
        prev = Some((upper, lower, direction));
    }
    Ok(out)
}

/// [`supertrend`] over candles.
pub fn supertrend_candles(candles: &[Candle], period: usize, multiplier: f64) -> Result<Supertrend, SignalError> {
    let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let close: Vec<f64> = candles.iter().map(|c| c.close).collect();
    supertrend(&high, &low, &close, period, multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_then(closes: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let high = closes.iter().map(|c| c + 1.0).collect();
        let low = closes.iter().map(|c| c - 1.0).collect();
        (high, low, closes.to_vec())
    }

    #[test]
    fn length_mismatch_is_error() {
        let err = supertrend(&[1.0, 2.0], &[1.0], &[1.0, 2.0], 7, 3.0).unwrap_err();
        assert_eq!(err, SignalError::LengthMismatch { high: 2, low: 1, close: 2 });
        assert_eq!(supertrend(&[], &[], &[], 0, 3.0).unwrap_err(), SignalError::InvalidPeriod);
    }

    #[test]
    fn undefined_before_period() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + f64::from(i)).collect();
        let (h, l, c) = flat_then(&closes);
        let st = supertrend(&h, &l, &c, 7, 3.0).unwrap();
        assert!(st.direction[..7].iter().all(Option::is_none));
        assert!(st.direction[7..].iter().all(Option::is_some));
        assert_eq!(st.direction[7], Some(Direction::Bearish));

        let short = supertrend(&h[..5], &l[..5], &c[..5], 7, 3.0).unwrap();
        assert!(short.direction.iter().all(Option::is_none));
        assert_eq!(short.last_pair(), None);
    }

    #[test]
    fn atr_seed_is_mean_of_first_ranges() {
        let h = [10.0, 12.0, 13.0, 14.0];
        let l = [9.0, 10.0, 11.0, 12.0];
        let c = [9.5, 11.0, 12.0, 13.0];
        let a = atr(&h, &l, &c, 2);
        // tr[1] = max(2, 2.5, 0.5) = 2.5; tr[2] = max(2, 2, 0) = 2
        assert_eq!(a[2], Some(2.25));
        // (2.25 * 1 + 2) / 2
        assert_eq!(a[3], Some(2.125));
        assert_eq!(a[1], None);
    }

    #[test]
    fn rally_flips_bullish_and_drop_flips_back() {
        let mut closes = vec![100.0; 10];
        closes.extend((1..=10).map(|i| 100.0 + 10.0 * f64::from(i)));
        let (h, l, c) = flat_then(&closes);
        let st = supertrend(&h, &l, &c, 7, 3.0).unwrap();
        assert_eq!(st.direction.last().copied().flatten(), Some(Direction::Bullish));

        // Trend line sits below price while bullish.
        let last = c.len() - 1;
        assert!(st.trend[last].unwrap() < c[last]);

        let mut falling = closes.clone();
        falling.extend((1..=10).map(|i| 200.0 - 15.0 * f64::from(i)));
        let (h, l, c) = flat_then(&falling);
        let st = supertrend(&h, &l, &c, 7, 3.0).unwrap();
        assert_eq!(st.direction.last().copied().flatten(), Some(Direction::Bearish));
    }

    #[test]
    fn last_flip_detects_only_changes() {
        let st = Supertrend {
            trend: vec![None, Some(1.0), Some(1.0)],
            direction: vec![None, Some(Direction::Bearish), Some(Direction::Bullish)],
        };
        assert_eq!(st.last_flip(), Some(Direction::Bullish));
        let held = Supertrend {
            trend: vec![Some(1.0), Some(1.0)],
            direction: vec![Some(Direction::Bullish), Some(Direction::Bullish)],
        };
        assert_eq!(held.last_flip(), None);
        assert_eq!(Direction::Bearish.value(), -1);
    }
}
