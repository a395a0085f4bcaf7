//! Authenticated user execution stream.
//!
//! One WebSocket per credential set, subscribed to the `user` channel. The
//! handshake signs `timestamp + "GET" + "/ws/market"` with the L2 API secret
//! (HMAC-SHA256, standard base64) and is sent immediately after dial. Fills
//! are kept in a bounded most-recent-wins ring that survives reconnects.

use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine as _;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

use crate::metrics;
use crate::types::Fill;

type HmacSha256 = Hmac<Sha256>;

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const READ_DEADLINE: Duration = Duration::from_secs(25);
const PING_PERIOD: Duration = Duration::from_secs(15);

/// Most-recent-wins ring capacity.
const FILL_RING_CAPACITY: usize = 1024;

#[derive(Debug, Deserialize)]
struct UserEvent {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    market: Option<String>,
    #[serde(default)]
    asset_id: Option<String>,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    fill_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

pub struct UserStream {
    ws_url: String,
    api_key: String,
    api_secret: String,
    passphrase: String,
    fills: RwLock<VecDeque<Fill>>,
    shutdown_tx: watch::Sender<bool>,
}

impl UserStream {
    pub fn new(
        ws_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: passphrase.into(),
            fills: RwLock::new(VecDeque::with_capacity(FILL_RING_CAPACITY)),
            shutdown_tx,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let stream = self.clone();
        tokio::spawn(async move {
            stream.run_loop().await;
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Copy of the buffered fills, most recent last.
    pub fn fills(&self) -> Vec<Fill> {
        self.fills.read().iter().cloned().collect()
    }

    fn push_fill(&self, fill: Fill) {
        let mut ring = self.fills.write();
        if ring.len() == FILL_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(fill);
    }

    /// `base64(HMAC-SHA256(secret, ts + "GET" + "/ws/market"))`.
    fn auth_message(&self) -> String {
        let ts = Utc::now().timestamp().to_string();
        let payload = format!("{}GET/ws/market", ts);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        let sig = BASE64_STD.encode(mac.finalize().into_bytes());

        serde_json::json!({
            "type": "auth",
            "key": self.api_key,
            "signature": sig,
            "timestamp": ts,
            "passphrase": self.passphrase,
        })
        .to_string()
    }

    async fn run_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut delay = RECONNECT_BASE_DELAY;

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let ws = match connect_async(&self.ws_url).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    warn!(error = %e, retry_in = ?delay, "user stream dial failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => return,
                    }
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    continue;
                }
            };

            info!("user stream connected");
            metrics::WS_RECONNECTS.with_label_values(&["user"]).inc();
            delay = RECONNECT_BASE_DELAY;

            let (mut write, mut read) = ws.split();

            if write.send(Message::Text(self.auth_message().into())).await.is_err() {
                continue;
            }
            let subscribe = serde_json::json!({
                "type": "subscribe",
                "channel_name": "user",
            });
            if write.send(Message::Text(subscribe.to_string().into())).await.is_err() {
                continue;
            }

            let mut ping = tokio::time::interval(PING_PERIOD);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            // Only inbound frames (data or pong) push the read deadline
            // forward; sending a ping must not keep a dead peer alive.
            let mut deadline = tokio::time::Instant::now() + READ_DEADLINE;

            'session: loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                    _ = ping.tick() => {
                        if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break 'session;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        warn!("user stream read deadline expired (zombie connection)");
                        break 'session;
                    }
                    frame = read.next() => {
                        match frame {
                            None => break 'session,
                            Some(Err(e)) => {
                                error!(error = %e, "user stream read error");
                                break 'session;
                            }
                            Some(Ok(msg)) => {
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
        let events: Vec<UserEvent> = match serde_json::from_str::<Vec<UserEvent>>(raw) {
            Ok(list) => list,
            Err(_) => match serde_json::from_str::<UserEvent>(raw) {
                Ok(single) => vec![single],
                Err(_) => return,
            },
        };

        for ev in events {
            if ev.event_type != "fills" && ev.event_type != "trade" {
                continue;
            }
            let market = ev.asset_id.or(ev.market).unwrap_or_default();
            if market.is_empty() {
                continue;
            }
            self.push_fill(Fill {
                id: ev.fill_id.or(ev.id).unwrap_or_default(),
                market,
                price: ev.price.unwrap_or_default(),
                size: ev.size.unwrap_or_default(),
                side: ev.side.unwrap_or_default(),
                timestamp: Utc::now(),
            });
        }
    }
}
