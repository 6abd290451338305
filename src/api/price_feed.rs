//! Streaming price feed over the CLOB market WebSocket channel.
//!
//! Tokens are subscribed on BUY and dropped once their stop-loss position is
//! gone. The connection task reconnects with exponential backoff and
//! re-subscribes everything it was watching.

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashSet;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::models::TradeSide;

pub const MARKET_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

const PING_INTERVAL: Duration = Duration::from_secs(10);
const WATCHDOG_TICK: Duration = Duration::from_secs(5);
const WATCHDOG_SILENCE: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A price observation for one token.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    pub token_id: String,
    pub price: Decimal,
    pub side: Option<TradeSide>,
}

/// Push-based price source keyed by token id.
pub trait PriceFeed: Send + Sync {
    fn subscribe(&self, token_id: &str);
    fn unsubscribe(&self, token_id: &str);
    fn is_subscribed(&self, token_id: &str) -> bool;
}

#[derive(Debug)]
enum FeedCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Handle to the background WebSocket task.
pub struct WsPriceFeed {
    subscribed: Arc<DashSet<String>>,
    cmd_tx: mpsc::UnboundedSender<FeedCommand>,
}

impl WsPriceFeed {
    /// Start the connection task. Ticks for subscribed tokens go to `tick_tx`;
    /// the task exits when `shutdown` flips to true.
    pub fn spawn(
        url: &str,
        tick_tx: mpsc::Sender<PriceTick>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let subscribed = Arc::new(DashSet::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = FeedTask {
            url: url.to_string(),
            subscribed: subscribed.clone(),
            tick_tx,
        };
        let handle = tokio::spawn(task.run(cmd_rx, shutdown));

        (Self { subscribed, cmd_tx }, handle)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed.len()
    }
}

impl PriceFeed for WsPriceFeed {
    fn subscribe(&self, token_id: &str) {
        if self.subscribed.insert(token_id.to_string()) {
            let _ = self.cmd_tx.send(FeedCommand::Subscribe(token_id.to_string()));
        }
    }

    fn unsubscribe(&self, token_id: &str) {
        if self.subscribed.remove(token_id).is_some() {
            let _ = self.cmd_tx.send(FeedCommand::Unsubscribe(token_id.to_string()));
        }
    }

    fn is_subscribed(&self, token_id: &str) -> bool {
        self.subscribed.contains(token_id)
    }
}

struct FeedTask {
    url: String,
    subscribed: Arc<DashSet<String>>,
    tick_tx: mpsc::Sender<PriceTick>,
}

/// Open the socket, giving up when the handshake stalls past `limit`.
async fn connect(
    url: &str,
    limit: Duration,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let (ws, _) = tokio::time::timeout(limit, connect_async(url))
        .await
        .context("Price feed handshake timed out")?
        .context("Failed to connect price feed")?;
    Ok(ws)
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(60))
        .with_max_elapsed_time(None)
        .build()
}

impl FeedTask {
    async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<FeedCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = reconnect_backoff();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let reason = match self.session(&mut cmd_rx, &mut shutdown, &mut backoff).await {
                Ok(None) => {
                    info!("Price feed shut down");
                    return;
                }
                Ok(Some(reason)) => reason.to_string(),
                Err(e) => format!("{e:#}"),
            };

            let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
            warn!(
                reason = %reason,
                delay_ms = delay.as_millis() as u64,
                "Price feed disconnected, reconnecting"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One connection lifetime. `Ok(None)` means shutdown was requested.
    async fn session(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<FeedCommand>,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<Option<&'static str>> {
        let ws = connect(&self.url, CONNECT_TIMEOUT).await?;
        let (mut write, mut read) = ws.split();

        info!(url = %self.url, tokens = self.subscribed.len(), "Price feed connected");
        backoff.reset();

        // Commands queued while disconnected are already reflected in the set.
        while cmd_rx.try_recv().is_ok() {}

        let tokens: Vec<String> = self.subscribed.iter().map(|t| t.clone()).collect();
        if !tokens.is_empty() {
            write
                .send(Message::Text(subscribe_message(&tokens)))
                .await
                .context("Failed to subscribe tokens")?;
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut watchdog = tokio::time::interval(WATCHDOG_TICK);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_message = Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_message = Instant::now();
                        self.dispatch(&text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => last_message = Instant::now(),
                    Some(Ok(Message::Close(_))) => return Ok(Some("remote_close")),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("Price feed stream error"),
                    None => return Ok(Some("stream_ended")),
                },

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return Ok(None);
                    };
                    let text = match cmd {
                        FeedCommand::Subscribe(token) => subscribe_message(&[token]),
                        FeedCommand::Unsubscribe(token) => unsubscribe_message(&[token]),
                    };
                    write.send(Message::Text(text)).await.context("Failed to send subscription")?;
                }

                _ = ping.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return Ok(Some("ping_failed"));
                    }
                }

                _ = watchdog.tick() => {
                    if !self.subscribed.is_empty() && last_message.elapsed() >= WATCHDOG_SILENCE {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(Some("watchdog_timeout"));
                    }
                }

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        for tick in parse_ticks(text) {
            if !self.subscribed.contains(&tick.token_id) {
                continue;
            }
            if self.tick_tx.send(tick).await.is_err() {
                debug!("Tick receiver dropped");
            }
        }
    }
}

fn subscribe_message(tokens: &[String]) -> String {
    json!({ "assets_ids": tokens, "type": "market" }).to_string()
}

fn unsubscribe_message(tokens: &[String]) -> String {
    json!({ "assets_ids": tokens, "operation": "unsubscribe" }).to_string()
}

fn decimal_field(value: &Value, key: &str) -> Option<Decimal> {
    match value.get(key)? {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn side_field(value: &Value) -> Option<TradeSide> {
    value.get("side").and_then(Value::as_str).and_then(TradeSide::parse)
}

fn valid_price(price: Decimal) -> bool {
    price > Decimal::ZERO && price <= Decimal::ONE
}

/// Extract price ticks from a market channel message. Unknown events and
/// out-of-range prices yield nothing.
pub fn parse_ticks(text: &str) -> Vec<PriceTick> {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };

    let mut ticks = Vec::new();
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_ticks(item, &mut ticks)),
        other => collect_ticks(&other, &mut ticks),
    }
    ticks
}

fn collect_ticks(event: &Value, out: &mut Vec<PriceTick>) {
    let event_type = event.get("event_type").and_then(Value::as_str).unwrap_or("");
    let asset_id = event.get("asset_id").and_then(Value::as_str);

    match event_type {
        "last_trade_price" => {
            if let (Some(token), Some(price)) = (asset_id, decimal_field(event, "price")) {
                if valid_price(price) {
                    out.push(PriceTick {
                        token_id: token.to_string(),
                        price,
                        side: side_field(event),
                    });
                }
            }
        }
        "price_change" => {
            // Newer payloads carry one entry per asset; older ones nest
            // changes under a single asset_id.
            if let Some(changes) = event.get("price_changes").and_then(Value::as_array) {
                for change in changes {
                    let token = change.get("asset_id").and_then(Value::as_str).or(asset_id);
                    if let (Some(token), Some(price)) = (token, decimal_field(change, "price")) {
                        if valid_price(price) {
                            out.push(PriceTick {
                                token_id: token.to_string(),
                                price,
                                side: side_field(change),
                            });
                        }
                    }
                }
            } else if let (Some(token), Some(changes)) =
                (asset_id, event.get("changes").and_then(Value::as_array))
            {
                for change in changes {
                    let Some(price) = decimal_field(change, "price").filter(|p| valid_price(*p))
                    else {
                        continue;
                    };
                    out.push(PriceTick {
                        token_id: token.to_string(),
                        price,
                        side: side_field(change),
                    });
                }
            }
        }
        "book" => {
            // Best bid is what a stop-loss sell would hit.
            let best_bid = event
                .get("bids")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|level| decimal_field(level, "price"))
                .filter(|p| valid_price(*p))
                .max();
            if let (Some(token), Some(price)) = (asset_id, best_bid) {
                out.push(PriceTick {
                    token_id: token.to_string(),
                    price,
                    side: Some(TradeSide::Sell),
                });
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        // Accepts TCP but never answers the upgrade request.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let err = connect(&format!("ws://{addr}"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_last_trade_price() {
        let ticks = parse_ticks(
            r#"{"event_type":"last_trade_price","asset_id":"tok","price":"0.42","side":"SELL"}"#,
        );
        assert_eq!(
            ticks,
            vec![PriceTick {
                token_id: "tok".to_string(),
                price: dec!(0.42),
                side: Some(TradeSide::Sell),
            }]
        );
    }

    #[test]
    fn test_price_changes_and_arrays() {
        let text = r#"[
            {"event_type":"price_change","price_changes":[
                {"asset_id":"a","price":"0.30","side":"BUY"},
                {"asset_id":"b","price":"0.70","side":"SELL"}
            ]},
            {"event_type":"price_change","asset_id":"c","changes":[{"price":"0.55","side":"BUY"}]},
            {"event_type":"tick_size_change","asset_id":"d"}
        ]"#;
        let ticks = parse_ticks(text);
        let tokens: Vec<&str> = ticks.iter().map(|t| t.token_id.as_str()).collect();
        assert_eq!(tokens, vec!["a", "b", "c"]);
        assert_eq!(ticks[2].price, dec!(0.55));
    }

    #[test]
    fn test_book_uses_best_bid() {
        let text = r#"{"event_type":"book","asset_id":"tok",
            "bids":[{"price":"0.31","size":"10"},{"price":"0.35","size":"5"}],
            "asks":[{"price":"0.40","size":"10"}]}"#;
        let ticks = parse_ticks(text);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].price, dec!(0.35));
    }

    #[test]
    fn test_garbage_and_out_of_range() {
        assert!(parse_ticks("PONG").is_empty());
        assert!(parse_ticks(
            r#"{"event_type":"last_trade_price","asset_id":"tok","price":"1.5"}"#
        )
        .is_empty());
    }

    #[test]
    fn test_subscription_messages() {
        let sub: Value = serde_json::from_str(&subscribe_message(&["t1".to_string()])).unwrap();
        assert_eq!(sub["type"], "market");
        assert_eq!(sub["assets_ids"][0], "t1");

        let unsub: Value = serde_json::from_str(&unsubscribe_message(&["t1".to_string()])).unwrap();
        assert_eq!(unsub["operation"], "unsubscribe");
    }

    #[tokio::test]
    async fn test_subscription_set_tracks_calls() {
        let (tick_tx, _tick_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);
        let (feed, handle) = WsPriceFeed::spawn("ws://127.0.0.1:1", tick_tx, shutdown_rx);

        feed.subscribe("tok");
        feed.subscribe("tok");
        assert!(feed.is_subscribed("tok"));
        assert_eq!(feed.subscription_count(), 1);

        feed.unsubscribe("tok");
        assert!(!feed.is_subscribed("tok"));

        // Shutdown already requested, so the task exits without connecting.
        handle.await.unwrap();
    }
}
