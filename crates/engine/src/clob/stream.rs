use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use url::Url;

use common::{Error, PriceEvent, Result};

/// Push-stream client for the CLOB market channel. Subscribes to a set of
/// token IDs and republishes every price-change event on a broadcast
/// channel. Reconnects with exponential backoff and resubscribes on every
/// reconnect — the exchange does not remember subscriptions across a
/// dropped socket.
pub struct PriceStream {
    ws_url: String,
    token_ids: Vec<String>,
    price_tx: broadcast::Sender<PriceEvent>,
    connected: Arc<AtomicBool>,
}

impl PriceStream {
    pub fn new(
        ws_url: impl Into<String>,
        token_ids: Vec<String>,
        price_tx: broadcast::Sender<PriceEvent>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            token_ids,
            price_tx,
            connected,
        }
    }

    /// Run the stream loop forever, reconnecting on failure. Call inside a
    /// `tokio::spawn`.
    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(60);

        loop {
            info!(tokens = self.token_ids.len(), "connecting to CLOB price stream");
            match self.connect_once().await {
                Ok(()) => {
                    info!("CLOB price stream closed cleanly");
                    self.connected.store(false, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    self.connected.store(false, Ordering::Relaxed);
                    warn!(error = %e, backoff = ?backoff, "CLOB price stream error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let url = Url::parse(&format!("{}market", self.ws_url))
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let (mut ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let subscribe = serde_json::json!({
            "type": "market",
            "assets_ids": self.token_ids,
        });
        ws_stream
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        self.connected.store(true, Ordering::Relaxed);

        while let Some(msg) = ws_stream.next().await {
            let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;

            if let Message::Text(text) = msg {
                match parse_price_events(&text) {
                    Ok(events) => {
                        for event in events {
                            let _ = self.price_tx.send(event);
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to parse CLOB stream message"),
                }
            }
        }

        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(tag = "event_type")]
enum WireEvent {
    #[serde(rename = "price_change")]
    PriceChange {
        asset_id: String,
        price: String,
        #[serde(default)]
        market: Option<String>,
        timestamp: Option<String>,
    },
    #[serde(rename = "book")]
    Book {
        asset_id: String,
        #[serde(default)]
        market: Option<String>,
        bids: Vec<WireLevel>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireLevel {
    price: String,
}

fn parse_price_events(text: &str) -> Result<Vec<PriceEvent>> {
    // The stream sometimes batches events in a JSON array, sometimes sends
    // a single object — normalize to a slice of values first.
    let value: serde_json::Value = serde_json::from_str(text)?;
    let values: Vec<serde_json::Value> = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    let mut out = Vec::new();
    for v in values {
        let event: WireEvent = match serde_json::from_value(v) {
            Ok(e) => e,
            Err(_) => continue,
        };

        match event {
            WireEvent::PriceChange {
                asset_id,
                price,
                market,
                timestamp,
            } => {
                if let Ok(price) = price.parse::<f64>() {
                    out.push(PriceEvent {
                        market_id: market.unwrap_or_default(),
                        token_id: asset_id,
                        price,
                        timestamp: parse_timestamp(timestamp.as_deref()),
                    });
                }
            }
            WireEvent::Book { asset_id, market, bids } => {
                if let Some(best) = bids.first().and_then(|l| l.price.parse::<f64>().ok()) {
                    out.push(PriceEvent {
                        market_id: market.unwrap_or_default(),
                        token_id: asset_id,
                        price: best,
                        timestamp: Utc::now(),
                    });
                }
            }
            WireEvent::Other => {}
        }
    }

    Ok(out)
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}
