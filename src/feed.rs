//! Exchange market-data feed.
//!
//! Maintains exactly one outbound WebSocket connection to the exchange book
//! channel and keeps the shadow books up to date. Connection state machine:
//!
//! - Disconnected: sleep `delay`, dial; dial failure doubles `delay`
//!   (capped at 30 s); success resets it to 1 s.
//! - Connected: subscribe to the union of all requested tokens, ping every
//!   15 s, and require *some* inbound frame (data or pong) within 25 s:
//!   a silent socket is a zombie and gets torn down.
//!
//! Messages arrive as JSON arrays or single objects. A `hash` field marks a
//! snapshot (replace book state); its absence marks a delta (apply per
//! level, size "0" deletes).

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::book::{Level, Orderbook};
use crate::metrics;
use crate::types::Side;

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const PING_PERIOD: Duration = Duration::from_secs(15);
const READ_DEADLINE: Duration = Duration::from_secs(25);

/// Raw price level as the feed sends it.
#[derive(Debug, Deserialize)]
struct RawLevel {
    price: String,
    size: String,
}

/// One change entry of a `price_change` event.
#[derive(Debug, Deserialize)]
struct RawChange {
    price: String,
    side: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct FeedMessage {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    asset_id: Option<String>,
    #[serde(default)]
    market: Option<String>,
    #[serde(default)]
    bids: Option<Vec<RawLevel>>,
    #[serde(default)]
    asks: Option<Vec<RawLevel>>,
    #[serde(default)]
    changes: Option<Vec<RawChange>>,
    /// Present on snapshots only.
    #[serde(default)]
    hash: Option<String>,
}

pub struct MarketFeed {
    ws_url: String,
    books: RwLock<FxHashMap<String, Arc<Orderbook>>>,
    sub_tx: mpsc::UnboundedSender<Vec<String>>,
    sub_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<String>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl MarketFeed {
    pub fn new(ws_url: impl Into<String>) -> Arc<Self> {
        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            ws_url: ws_url.into(),
            books: RwLock::new(FxHashMap::default()),
            sub_tx,
            sub_rx: Mutex::new(Some(sub_rx)),
            shutdown_tx,
        })
    }

    /// Launch the connection loop in a background task.
    pub fn start(self: &Arc<Self>) {
        let feed = self.clone();
        tokio::spawn(async move {
            feed.run_loop().await;
        });
    }

    /// Close the connection and terminate all loops.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Register interest in tokens. Unseen tokens get an empty book
    /// immediately; a live connection is told to subscribe right away.
    pub fn subscribe(&self, token_ids: &[String]) {
        let mut fresh = Vec::new();
        {
            let mut books = self.books.write();
            for id in token_ids {
                if !books.contains_key(id) {
                    books.insert(id.clone(), Arc::new(Orderbook::new(id.clone())));
                    fresh.push(id.clone());
                }
            }
        }
        if !fresh.is_empty() {
            let _ = self.sub_tx.send(fresh);
        }
    }

    pub fn book(&self, token_id: &str) -> Option<Arc<Orderbook>> {
        self.books.read().get(token_id).cloned()
    }

    pub fn subscribed_tokens(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }

    async fn run_loop(self: Arc<Self>) {
        let mut sub_rx = match self.sub_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                error!("market feed started twice");
                return;
            }
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut delay = RECONNECT_BASE_DELAY;

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let ws = match connect_async(&self.ws_url).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    warn!(error = %e, retry_in = ?delay, "market feed dial failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => return,
                    }
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    continue;
                }
            };

            info!(url = %self.ws_url, "market feed connected");
            metrics::WS_RECONNECTS.with_label_values(&["market"]).inc();
            delay = RECONNECT_BASE_DELAY;

            let (mut write, mut read) = ws.split();

            // Subscribe to the union of everything requested so far.
            let tokens = self.subscribed_tokens();
            if !tokens.is_empty() {
                if let Err(e) = write.send(subscribe_message(&tokens)).await {
                    error!(error = %e, "subscribe send failed");
                    continue;
                }
            }

            let mut ping = tokio::time::interval(PING_PERIOD);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            // Read deadline lives outside the select loop: only an inbound
            // frame (data or pong) pushes it forward. Sending a ping must
            // not, or a dead peer would never trip it.
            let mut deadline = tokio::time::Instant::now() + READ_DEADLINE;

            'session: loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                    Some(fresh) = sub_rx.recv() => {
                        if let Err(e) = write.send(subscribe_message(&fresh)).await {
                            error!(error = %e, "subscribe send failed");
                            break 'session;
                        }
                    }
                    _ = ping.tick() => {
                        if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break 'session;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!("market feed read deadline expired (zombie connection)");
                        break 'session;
                    }
                    frame = read.next() => {
                        match frame {
                            None => {
                                warn!("market feed closed by peer");
                                break 'session;
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "market feed read error");
                                break 'session;
                            }
                            Some(Ok(msg)) => {
                                // Any inbound frame, pongs included, proves
                                // the peer is alive.
                                deadline = tokio::time::Instant::now() + READ_DEADLINE;
                                if let Message::Text(text) = msg {
                                    self.handle_payload(text.as_ref());
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn handle_payload(&self, raw: &str) {
        // The feed sends arrays of events; tolerate single objects too.
        let messages: Vec<FeedMessage> = match serde_json::from_str::<Vec<FeedMessage>>(raw) {
            Ok(list) => list,
            Err(_) => match serde_json::from_str::<FeedMessage>(raw) {
                Ok(single) => vec![single],
                // Keep-alive / control payloads.
                Err(_) => return,
            },
        };

        for msg in messages {
            match msg.event_type.as_str() {
                "book" => self.apply_book(msg),
                "price_change" => self.apply_price_change(msg),
                _ => {}
            }
        }
    }

    fn apply_book(&self, msg: FeedMessage) {
        let Some(token) = msg.asset_id.or(msg.market) else {
            return;
        };
        let Some(book) = self.book(&token) else {
            return;
        };

        if msg.hash.is_some() {
            // Snapshot: replace state wholesale.
            let bids = parse_levels(msg.bids.unwrap_or_default());
            let asks = parse_levels(msg.asks.unwrap_or_default());
            debug!(token = %token, bids = bids.len(), asks = asks.len(), "book snapshot");
            book.snapshot(bids, asks);
        } else {
            // Delta: apply per level; "0" size removes.
            for lvl in msg.bids.unwrap_or_default() {
                apply_delta(&book, Side::Buy, &lvl.price, &lvl.size);
            }
            for lvl in msg.asks.unwrap_or_default() {
                apply_delta(&book, Side::Sell, &lvl.price, &lvl.size);
            }
        }
    }

    fn apply_price_change(&self, msg: FeedMessage) {
        let Some(token) = msg.asset_id.or(msg.market) else {
            return;
        };
        let Some(book) = self.book(&token) else {
            return;
        };
        for change in msg.changes.unwrap_or_default() {
            let side = match change.side.as_str() {
                "BUY" => Side::Buy,
                "SELL" => Side::Sell,
                _ => continue,
            };
            apply_delta(&book, side, &change.price, &change.size);
        }
    }
}

fn subscribe_message(tokens: &[String]) -> Message {
    let msg = serde_json::json!({
        "type": "subscribe",
        "assets_ids": tokens,
        "channel_name": "book",
    });
    Message::Text(msg.to_string().into())
}

fn parse_levels(raw: Vec<RawLevel>) -> Vec<Level> {
    raw.into_iter()
        .filter_map(|l| {
            let price = Decimal::from_str(&l.price).ok()?;
            let size = Decimal::from_str(&l.size).ok()?;
            if size.is_zero() {
                None
            } else {
                Some(Level { price, size })
            }
        })
        .collect()
}

fn apply_delta(book: &Orderbook, side: Side, price: &str, size: &str) {
    let (Ok(price), Ok(size)) = (Decimal::from_str(price), Decimal::from_str(size)) else {
        return;
    };
    book.update(side, price, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_with_token(token: &str) -> Arc<MarketFeed> {
        let feed = MarketFeed::new("wss://example.invalid/ws");
        feed.subscribe(&[token.to_string()]);
        feed
    }

    #[test]
    fn subscribe_initializes_empty_book() {
        let feed = feed_with_token("T");
        let book = feed.book("T").expect("book exists after subscribe");
        let (bids, asks) = book.copy();
        assert!(bids.is_empty() && asks.is_empty());
        assert!(feed.book("unknown").is_none());
    }

    #[test]
    fn snapshot_then_delta_matches_expected_ladder() {
        let feed = feed_with_token("T");
        let snapshot = serde_json::json!([{
            "event_type": "book",
            "asset_id": "T",
            "hash": "0xabc",
            "bids": [{"price": "0.64", "size": "100"}, {"price": "0.63", "size": "50"}],
            "asks": [{"price": "0.66", "size": "80"}],
        }]);
        feed.handle_payload(&snapshot.to_string());

        let delta = serde_json::json!([{
            "event_type": "book",
            "asset_id": "T",
            "bids": [{"price": "0.64", "size": "0"}, {"price": "0.65", "size": "30"}],
        }]);
        feed.handle_payload(&delta.to_string());

        let book = feed.book("T").unwrap();
        let (bids, asks) = book.copy();
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].price, Decimal::from_str("0.65").unwrap());
        assert_eq!(bids[0].size, Decimal::from(30));
        assert_eq!(bids[1].price, Decimal::from_str("0.63").unwrap());
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].price, Decimal::from_str("0.66").unwrap());
    }

    #[test]
    fn accepts_single_object_messages() {
        let feed = feed_with_token("T");
        let single = serde_json::json!({
            "event_type": "book",
            "asset_id": "T",
            "hash": "h",
            "bids": [{"price": "0.50", "size": "10"}],
            "asks": [],
        });
        feed.handle_payload(&single.to_string());
        assert_eq!(
            feed.book("T").unwrap().best_bid(),
            Some(Decimal::from_str("0.50").unwrap())
        );
    }

    #[test]
    fn second_snapshot_replaces_state() {
        let feed = feed_with_token("T");
        for (price, hash) in [("0.40", "h1"), ("0.60", "h2")] {
            let snap = serde_json::json!([{
                "event_type": "book",
                "asset_id": "T",
                "hash": hash,
                "bids": [{"price": price, "size": "1"}],
                "asks": [],
            }]);
            feed.handle_payload(&snap.to_string());
        }
        let (bids, _) = feed.book("T").unwrap().copy();
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].price, Decimal::from_str("0.60").unwrap());
    }

    #[test]
    fn price_change_applies_as_delta() {
        let feed = feed_with_token("T");
        let change = serde_json::json!([{
            "event_type": "price_change",
            "asset_id": "T",
            "changes": [
                {"price": "0.55", "side": "BUY", "size": "40"},
                {"price": "0.58", "side": "SELL", "size": "20"},
            ],
        }]);
        feed.handle_payload(&change.to_string());
        let book = feed.book("T").unwrap();
        assert_eq!(book.best_bid(), Some(Decimal::from_str("0.55").unwrap()));
        assert_eq!(book.best_ask(), Some(Decimal::from_str("0.58").unwrap()));
    }

    #[test]
    fn unknown_token_events_are_ignored() {
        let feed = feed_with_token("T");
        let other = serde_json::json!([{
            "event_type": "book",
            "asset_id": "OTHER",
            "hash": "h",
            "bids": [{"price": "0.99", "size": "1"}],
        }]);
        feed.handle_payload(&other.to_string());
        assert!(feed.book("OTHER").is_none());
    }

    #[test]
    fn garbage_payloads_are_tolerated() {
        let feed = feed_with_token("T");
        feed.handle_payload("PING");
        feed.handle_payload("{\"weird\": true}");
        feed.handle_payload("[]");
        assert!(feed.book("T").is_some());
    }
}
