//! Candle series owned by a chart pane.
//!
//! The series is the authoritative price history for one symbol/timeframe
//! binding. Every mutation preserves the ordering invariant: candles are
//! strictly ascending by `open_time` with no duplicates. Other components
//! only ever receive cloned snapshots.

use crate::types::Candle;
use itertools::Itertools;

/// Ordered, de-duplicated sequence of candles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a series from an arbitrary batch.
    ///
    /// The batch is sorted by `open_time`; when the feed pushes duplicate
    /// open times (partial backfills overlap), the last occurrence wins.
    pub fn from_batch(batch: Vec<Candle>) -> Self {
        let candles = batch
            .into_iter()
            .sorted_by_key(|candle| candle.open_time)
            .coalesce(|previous, current| {
                if previous.open_time == current.open_time {
                    Ok(current)
                } else {
                    Err((previous, current))
                }
            })
            .collect();

        Self { candles }
    }

    /// Replace the whole series with a new batch
    pub fn replace(&mut self, batch: Vec<Candle>) {
        *self = Self::from_batch(batch);
    }

    /// Insert or update a single candle, keeping the ordering invariant.
    ///
    /// The common case is appending to or updating the tail (live candle
    /// still forming); out-of-order arrivals are placed by binary search.
    pub fn upsert(&mut self, candle: Candle) {
        if let Some(last) = self.candles.last_mut() {
            if last.open_time == candle.open_time {
                *last = candle;
                return;
            }
            if last.open_time < candle.open_time {
                self.candles.push(candle);
                return;
            }
        } else {
            self.candles.push(candle);
            return;
        }

        match self
            .candles
            .binary_search_by_key(&candle.open_time, |c| c.open_time)
        {
            Ok(index) => self.candles[index] = candle,
            Err(index) => self.candles.insert(index, candle),
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn as_slice(&self) -> &[Candle] {
        &self.candles
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candle> {
        self.candles.iter()
    }

    /// Closing prices in series order
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|candle| candle.close).collect()
    }

    /// Price range (low, high) across the series, if non-empty
    pub fn price_range(&self) -> Option<(f64, f64)> {
        if self.candles.is_empty() {
            return None;
        }

        let mut low = f64::MAX;
        let mut high = f64::MIN;
        for candle in &self.candles {
            low = low.min(candle.low);
            high = high.max(candle.high);
        }

        Some((low, high))
    }

    /// Check the ordering invariant holds (used by tests and debug asserts)
    pub fn is_strictly_ordered(&self) -> bool {
        self.candles
            .windows(2)
            .all(|pair| pair[0].open_time < pair[1].open_time)
    }
}

impl IntoIterator for CandleSeries {
    type Item = Candle;
    type IntoIter = std::vec::IntoIter<Candle>;

    fn into_iter(self) -> Self::IntoIter {
        self.candles.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn candle(minute: u32, close: f64) -> Candle {
        let open_time = open_time(minute);
        Candle {
            open_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
        }
    }

    fn open_time(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn test_from_batch_sorts_and_dedups() {
        let series = CandleSeries::from_batch(vec![
            candle(2, 101.0),
            candle(0, 99.0),
            candle(1, 100.0),
            candle(2, 102.0), // duplicate open_time, last wins
        ]);

        assert_eq!(series.len(), 3);
        assert!(series.is_strictly_ordered());
        assert_eq!(series.last().unwrap().close, 102.0);
    }

    #[test]
    fn test_upsert_appends_and_updates_tail() {
        let mut series = CandleSeries::from_batch(vec![candle(0, 99.0), candle(1, 100.0)]);

        // Live candle still forming: same open_time updates in place
        series.upsert(candle(1, 100.5));
        assert_eq!(series.len(), 2);
        assert_eq!(series.last().unwrap().close, 100.5);

        // Newer candle appends
        series.upsert(candle(2, 101.0));
        assert_eq!(series.len(), 3);
        assert!(series.is_strictly_ordered());
    }

    #[test]
    fn test_upsert_out_of_order_keeps_invariant() {
        let mut series = CandleSeries::from_batch(vec![candle(0, 99.0), candle(3, 103.0)]);

        series.upsert(candle(1, 100.0));
        series.upsert(candle(0, 98.0));

        assert_eq!(series.len(), 3);
        assert!(series.is_strictly_ordered());
        assert_eq!(series.as_slice()[0].close, 98.0);
    }

    #[test]
    fn test_price_range() {
        let series = CandleSeries::from_batch(vec![candle(0, 99.0), candle(1, 105.0)]);
        let (low, high) = series.price_range().unwrap();
        assert_eq!(low, 98.0);
        assert_eq!(high, 106.0);

        assert_eq!(CandleSeries::new().price_range(), None);
    }
}
