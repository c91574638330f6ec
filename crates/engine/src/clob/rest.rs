use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use common::{
    Error, ExchangeClient, ExchangeOrder, ExchangePosition, MarketInfo, OrderArgs, OrderBook,
    OrderBookLevel, Outcome, PlacedOrder, Result, TradeRecord,
};

use crate::ratelimit::ClobRateLimiter;

/// REST client for the Polymarket-style CLOB. Builds L2 (API key)
/// authenticated requests: every private request is signed with
/// HMAC-SHA256 over `timestamp + method + path + body`, using the base64
/// API secret derived from the L1 wallet signature at key-creation time.
pub struct ClobClient {
    base_url: String,
    api_key: String,
    api_secret: SecretString,
    api_passphrase: SecretString,
    wallet_address: String,
    http: Client,
    limiter: Arc<ClobRateLimiter>,
}

impl ClobClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: SecretString,
        api_passphrase: SecretString,
        wallet_address: impl Into<String>,
        limiter: Arc<ClobRateLimiter>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_secret,
            api_passphrase,
            wallet_address: wallet_address.into(),
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .expect("failed to build HTTP client"),
            limiter,
        }
    }

    fn timestamp_secs() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            .to_string()
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String> {
        type HmacSha256 = Hmac<Sha256>;
        let key = BASE64
            .decode(self.api_secret.expose_secret())
            .map_err(|e| Error::Config(format!("invalid CLOB_API_SECRET encoding: {e}")))?;
        let message = format!("{timestamp}{method}{path}{body}");
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| Error::Config(format!("invalid HMAC key: {e}")))?;
        mac.update(message.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &str,
    ) -> Result<String> {
        self.limiter.acquire().await;

        let timestamp = Self::timestamp_secs();
        let signature = self.sign(&timestamp, method.as_str(), path, body)?;
        let url = format!("{}{}", self.base_url, path);

        debug!(%method, path, "sending signed CLOB request");

        let mut req = self
            .http
            .request(method, &url)
            .header("POLY_ADDRESS", &self.wallet_address)
            .header("POLY_SIGNATURE", signature)
            .header("POLY_TIMESTAMP", timestamp)
            .header("POLY_API_KEY", &self.api_key)
            .header(
                "POLY_PASSPHRASE",
                self.api_passphrase.expose_secret().to_string(),
            );

        if !body.is_empty() {
            req = req
                .header("Content-Type", "application/json")
                .body(body.to_string());
        }

        let resp = req.send().await.map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();

        if status.as_u16() == 429 {
            let delay = self.limiter.penalize().await;
            return Err(Error::RateLimited {
                retry_after_ms: delay.as_millis() as u64,
            });
        }

        let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {text}")));
        }

        self.limiter.record_success().await;
        Ok(text)
    }

    async fn get(&self, path: &str) -> Result<String> {
        self.signed_request(reqwest::Method::GET, path, "").await
    }

    /// Adapter connectivity as inferred from recent REST call outcomes,
    /// read by the dashboard `/health` endpoint in live mode.
    pub fn is_connected(&self) -> bool {
        self.limiter.is_connected()
    }

    async fn get_public(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {text}")));
        }
        Ok(text)
    }
}

#[async_trait]
impl ExchangeClient for ClobClient {
    async fn place(&self, args: &OrderArgs) -> Result<PlacedOrder> {
        let body = serde_json::to_string(&PlaceOrderRequest {
            token_id: &args.token_id,
            side: args.side.to_string(),
            price: args.price,
            size: args.size_shares,
            order_type: args.order_type.to_string(),
        })?;

        let text = self.signed_request(reqwest::Method::POST, "/order", &body).await?;
        let resp: PlaceOrderResponse = serde_json::from_str(&text)?;

        Ok(PlacedOrder {
            exchange_order_id: resp.order_id,
            status: resp.status,
            filled_shares: resp.filled_size.unwrap_or(0.0),
            avg_fill_price: resp.avg_price.unwrap_or(args.price),
            fee_paid: resp.fee.unwrap_or(0.0),
            trade_id: resp.trade_id,
        })
    }

    async fn cancel(&self, exchange_order_id: &str) -> Result<()> {
        let path = format!("/order/{exchange_order_id}");
        self.signed_request(reqwest::Method::DELETE, &path, "").await?;
        Ok(())
    }

    async fn cancel_all(&self, market_id: Option<&str>) -> Result<()> {
        let body = match market_id {
            Some(m) => serde_json::to_string(&serde_json::json!({ "market": m }))?,
            None => String::new(),
        };
        self.signed_request(reqwest::Method::DELETE, "/orders", &body).await?;
        Ok(())
    }

    async fn open_orders(&self) -> Result<Vec<ExchangeOrder>> {
        let text = self.get("/orders").await?;
        let rows: Vec<OpenOrderResponse> = serde_json::from_str(&text)?;
        Ok(rows
            .into_iter()
            .map(|r| ExchangeOrder {
                exchange_order_id: r.order_id,
                market_id: r.market,
                token_id: r.token_id,
                side: if r.side == "BUY" {
                    common::OrderSide::Buy
                } else {
                    common::OrderSide::Sell
                },
                price: r.price,
                remaining_shares: r.size_remaining,
            })
            .collect())
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>> {
        let text = self.get("/positions").await?;
        let rows: Vec<PositionResponse> = serde_json::from_str(&text)?;
        Ok(rows
            .into_iter()
            .map(|r| ExchangePosition {
                market_id: r.market,
                token_id: r.token_id,
                outcome: if r.outcome == "NO" { Outcome::No } else { Outcome::Yes },
                shares: r.size,
                avg_price: r.avg_price,
            })
            .collect())
    }

    async fn balance_usd(&self) -> Result<f64> {
        let text = self.get("/balance").await?;
        let resp: BalanceResponse = serde_json::from_str(&text)?;
        resp.balance
            .parse::<f64>()
            .map_err(|e| Error::Exchange(e.to_string()))
    }

    async fn price(&self, token_id: &str) -> Result<f64> {
        let path = format!("/price?token_id={token_id}&side=BUY");
        let text = self.get_public(&path).await?;
        let resp: PriceResponse = serde_json::from_str(&text)?;
        resp.price
            .parse::<f64>()
            .map_err(|e| Error::Exchange(e.to_string()))
    }

    async fn orderbook(&self, token_id: &str) -> Result<OrderBook> {
        let path = format!("/book?token_id={token_id}");
        let text = self.get_public(&path).await?;
        let resp: BookResponse = serde_json::from_str(&text)?;

        let parse_levels = |levels: Vec<BookLevel>| -> Vec<OrderBookLevel> {
            levels
                .into_iter()
                .filter_map(|l| {
                    Some(OrderBookLevel {
                        price: l.price.parse().ok()?,
                        size: l.size.parse().ok()?,
                    })
                })
                .collect()
        };

        Ok(OrderBook {
            token_id: token_id.to_string(),
            bids: parse_levels(resp.bids),
            asks: parse_levels(resp.asks),
            as_of: Utc::now(),
        })
    }

    async fn market(&self, market_id: &str) -> Result<MarketInfo> {
        let path = format!("/markets/{market_id}");
        let text = self.get_public(&path).await?;
        let resp: MarketResponse = serde_json::from_str(&text)?;

        let (yes_token_id, no_token_id) = resp
            .tokens
            .iter()
            .find(|t| t.outcome.eq_ignore_ascii_case("yes"))
            .zip(resp.tokens.iter().find(|t| t.outcome.eq_ignore_ascii_case("no")))
            .map(|(yes, no)| (yes.token_id.clone(), no.token_id.clone()))
            .ok_or_else(|| Error::ProtocolInvariant(format!("market {market_id} missing Yes/No tokens")))?;

        let winning_outcome = resp.tokens.iter().find(|t| t.winner).and_then(|t| {
            if t.outcome.eq_ignore_ascii_case("yes") {
                Some(Outcome::Yes)
            } else if t.outcome.eq_ignore_ascii_case("no") {
                Some(Outcome::No)
            } else {
                None
            }
        });

        Ok(MarketInfo {
            market_id: market_id.to_string(),
            question: resp.question,
            yes_token_id,
            no_token_id,
            active: resp.active,
            closed: resp.closed,
            resolved: resp.closed && winning_outcome.is_some(),
            winning_outcome,
        })
    }

    async fn wallet_positions(&self, addr: &str) -> Result<Vec<ExchangePosition>> {
        // Public data-API endpoint; no L2 signing required to read another
        // wallet's on-chain holdings.
        let path = format!("/positions?user={addr}");
        let text = self.get_public(&path).await?;
        let rows: Vec<PositionResponse> = serde_json::from_str(&text)?;
        Ok(rows
            .into_iter()
            .map(|r| ExchangePosition {
                market_id: r.market,
                token_id: r.token_id,
                outcome: if r.outcome == "NO" { Outcome::No } else { Outcome::Yes },
                shares: r.size,
                avg_price: r.avg_price,
            })
            .collect())
    }

    async fn trades_for_order(&self, exchange_order_id: &str) -> Result<Vec<TradeRecord>> {
        let path = format!("/trades?order_id={exchange_order_id}");
        let text = self.get(&path).await?;
        let rows: Vec<TradeResponse> = serde_json::from_str(&text)?;
        Ok(rows
            .into_iter()
            .map(|r| TradeRecord {
                trade_id: r.trade_id,
                price: r.price,
                shares: r.size,
                fee: r.fee,
            })
            .collect())
    }
}

// ─── wire types ─────────────────────────────────────────────────────────────

#[derive(serde::Serialize)]
struct PlaceOrderRequest<'a> {
    token_id: &'a str,
    side: String,
    price: f64,
    size: f64,
    order_type: String,
}

#[derive(Deserialize)]
struct PlaceOrderResponse {
    #[serde(rename = "orderID")]
    order_id: String,
    status: String,
    #[serde(default)]
    filled_size: Option<f64>,
    #[serde(default)]
    avg_price: Option<f64>,
    #[serde(default)]
    fee: Option<f64>,
    #[serde(default)]
    trade_id: Option<String>,
}

#[derive(Deserialize)]
struct TradeResponse {
    trade_id: String,
    price: f64,
    size: f64,
    fee: f64,
}

#[derive(Deserialize)]
struct OpenOrderResponse {
    #[serde(rename = "orderID")]
    order_id: String,
    market: String,
    token_id: String,
    side: String,
    price: f64,
    size_remaining: f64,
}

#[derive(Deserialize)]
struct PositionResponse {
    market: String,
    token_id: String,
    outcome: String,
    size: f64,
    avg_price: f64,
}

#[derive(Deserialize)]
struct PriceResponse {
    price: String,
}

#[derive(Deserialize)]
struct BalanceResponse {
    balance: String,
}

#[derive(Deserialize)]
struct BookLevel {
    price: String,
    size: String,
}

#[derive(Deserialize)]
struct BookResponse {
    #[serde(default)]
    bids: Vec<BookLevel>,
    #[serde(default)]
    asks: Vec<BookLevel>,
}

#[derive(Deserialize)]
struct MarketToken {
    token_id: String,
    outcome: String,
    #[serde(default)]
    winner: bool,
}

#[derive(Deserialize)]
struct MarketResponse {
    question: String,
    active: bool,
    closed: bool,
    tokens: Vec<MarketToken>,
}
