//! Shadow order book: the gateway's in-memory mirror of one exchange book,
//! maintained from the snapshot-plus-delta WebSocket feed.
//!
//! Liquidity on prediction markets is sparse (rarely more than a few dozen
//! levels per side), so levels live in plain sorted vectors with linear-scan
//! updates. One RwLock guards bids, asks and the update timestamp together,
//! so readers always observe a consistent snapshot of both sides.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::types::Side;

/// A single price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Level {
    pub price: Decimal,
    pub size: Decimal,
}

struct BookState {
    bids: Vec<Level>, // sorted high -> low
    asks: Vec<Level>, // sorted low -> high
    last_updated: Instant,
    last_updated_at: DateTime<Utc>,
}

pub struct Orderbook {
    pub token_id: String,
    state: RwLock<BookState>,
}

impl Orderbook {
    pub fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            state: RwLock::new(BookState {
                bids: Vec::new(),
                asks: Vec::new(),
                last_updated: Instant::now(),
                last_updated_at: Utc::now(),
            }),
        }
    }

    /// Replace the entire book state.
    pub fn snapshot(&self, mut bids: Vec<Level>, mut asks: Vec<Level>) {
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        let mut st = self.state.write();
        st.bids = bids;
        st.asks = asks;
        st.last_updated = Instant::now();
        st.last_updated_at = Utc::now();
    }

    /// Apply one level mutation. `size == 0` removes the level.
    pub fn update(&self, side: Side, price: Decimal, size: Decimal) {
        let mut st = self.state.write();
        match side {
            Side::Buy => update_level(&mut st.bids, price, size, true),
            Side::Sell => update_level(&mut st.asks, price, size, false),
        }
        st.last_updated = Instant::now();
        st.last_updated_at = Utc::now();
    }

    /// Defensive copy of both ladders.
    pub fn copy(&self) -> (Vec<Level>, Vec<Level>) {
        let st = self.state.read();
        (st.bids.clone(), st.asks.clone())
    }

    /// Time since the last snapshot or delta.
    pub fn age(&self) -> Duration {
        self.state.read().last_updated.elapsed()
    }

    pub fn last_updated_at(&self) -> DateTime<Utc> {
        self.state.read().last_updated_at
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.state.read().bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.state.read().asks.first().map(|l| l.price)
    }

    /// Shift `last_updated` into the past to exercise staleness paths.
    pub(crate) fn backdate(&self, age: Duration) {
        let mut st = self.state.write();
        if let Some(past) = Instant::now().checked_sub(age) {
            st.last_updated = past;
        }
    }
}

fn update_level(levels: &mut Vec<Level>, price: Decimal, size: Decimal, descending: bool) {
    let idx = levels.iter().position(|l| l.price == price);

    if size.is_zero() {
        if let Some(i) = idx {
            levels.remove(i);
        }
        return;
    }

    match idx {
        Some(i) => levels[i].size = size,
        None => {
            levels.push(Level { price, size });
            if descending {
                levels.sort_by(|a, b| b.price.cmp(&a.price));
            } else {
                levels.sort_by(|a, b| a.price.cmp(&b.price));
            }
        }
    }
}
