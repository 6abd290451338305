//! Polymarket CLOB (Central Limit Order Book) client for order execution.
//!
//! The CLOB is Polymarket's off-chain order matching engine that settles on
//! Polygon. Orders are signed with EIP-712 typed data and submitted with the
//! API key headers. Venue rejections come back as receipts carrying the raw
//! error text so callers can classify them.

use alloy_primitives::{Address, U256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::models::TradeSide;

/// CLOB API base URL
pub const CLOB_URL: &str = "https://clob.polymarket.com";

/// Polymarket CTF Exchange contract on Polygon
pub const CTF_EXCHANGE: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Price tolerance applied to market (FOK) orders.
const MARKET_SLIPPAGE: Decimal = dec!(0.005);

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// Good-til-cancelled limit order
    Gtc,
    /// Fill-or-kill market order
    Fok,
}

/// Signature type for CLOB orders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    /// EOA signature
    Eoa = 0,
    /// Polymarket proxy wallet
    Poly = 1,
}

/// An order to place, in venue-neutral terms.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: TradeSide,

    /// Limit price; market orders re-price from the book
    pub price: Decimal,

    pub shares: Decimal,
    pub order_type: OrderType,
}

/// Outcome of an order submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderReceipt {
    pub success: bool,
    pub order_id: Option<String>,

    /// Venue error text, verbatim
    pub error: Option<String>,
}

impl OrderReceipt {
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            error: Some(error.into()),
        }
    }
}

/// Something that can place orders on the venue.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Credentials loaded and the client can trade.
    fn is_ready(&self) -> bool;

    /// Submit an order. Transport failures are `Err`; venue rejections are
    /// an unsuccessful receipt.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt>;

    /// Where a resting order stands on the venue.
    async fn order_state(&self, order_id: &str) -> Result<OrderState>;
}

/// Lifecycle of a resting order as far as stop-loss tracking cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    /// Still on the book, possibly partly matched
    Live,
    Filled,
    /// Cancelled or expired without a full match
    Cancelled,
}

/// Signed order ready for submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedOrder {
    pub salt: String,
    pub maker: String,
    pub signer: String,
    pub taker: String,
    pub token_id: String,
    pub maker_amount: String,
    pub taker_amount: String,
    pub side: String,
    pub expiration: String,
    pub nonce: String,
    pub fee_rate_bps: String,
    pub signature_type: u8,
    pub signature: String,
}

/// Order submission request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload {
    order: SignedOrder,
    owner: String,
    order_type: OrderType,
}

/// Response from order placement
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    #[serde(default, rename = "orderID", alias = "orderId")]
    order_id: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error_msg: String,
}

/// Order status response
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    original_size: String,
    #[serde(default)]
    size_matched: String,
}

impl OrderStatus {
    fn state(&self) -> OrderState {
        let status = self.status.to_uppercase();
        if matches!(status.as_str(), "MATCHED" | "FILLED") {
            return OrderState::Filled;
        }
        let fully_matched = match (
            Decimal::from_str(&self.original_size),
            Decimal::from_str(&self.size_matched),
        ) {
            (Ok(original), Ok(matched)) => original > Decimal::ZERO && matched >= original,
            _ => false,
        };
        if fully_matched {
            return OrderState::Filled;
        }
        match status.as_str() {
            "CANCELED" | "CANCELLED" | "EXPIRED" | "UNMATCHED" => OrderState::Cancelled,
            _ => OrderState::Live,
        }
    }
}

/// Order book entry
#[derive(Debug, Clone, Deserialize)]
struct BookLevel {
    price: String,
}

/// Order book response
#[derive(Debug, Clone, Deserialize)]
struct OrderBook {
    #[serde(default)]
    bids: Vec<BookLevel>,
    #[serde(default)]
    asks: Vec<BookLevel>,
}

impl OrderBook {
    /// The book lists bids ascending and asks descending; best is the last.
    fn best(levels: &[BookLevel], pick_max: bool) -> Option<Decimal> {
        let prices = levels.iter().filter_map(|l| Decimal::from_str(&l.price).ok());
        if pick_max {
            prices.max()
        } else {
            prices.min()
        }
    }

    fn best_bid(&self) -> Option<Decimal> {
        Self::best(&self.bids, true)
    }

    fn best_ask(&self) -> Option<Decimal> {
        Self::best(&self.asks, false)
    }
}

/// Fields of one order, as they go into the EIP-712 struct hash.
#[derive(Debug, Clone)]
struct OrderFields {
    salt: String,
    maker: String,
    signer: String,
    taker: String,
    token_id: String,
    maker_amount: String,
    taker_amount: String,
    expiration: String,
    nonce: String,
    fee_rate_bps: String,
    side: TradeSide,
    signature_type: SignatureType,
}

impl OrderFields {
    /// BUY: maker pays USDC for shares. SELL: maker gives shares for USDC.
    fn amounts(side: TradeSide, shares: Decimal, price: Decimal) -> (String, String) {
        let shares_units = to_base_units(shares);
        let usdc_units = to_base_units(shares * price);
        match side {
            TradeSide::Buy => (usdc_units, shares_units),
            TradeSide::Sell => (shares_units, usdc_units),
        }
    }

    fn side_index(&self) -> u8 {
        match self.side {
            TradeSide::Buy => 0,
            TradeSide::Sell => 1,
        }
    }

    /// EIP-712 order struct hash.
    fn struct_hash(&self) -> Result<[u8; 32]> {
        let type_hash = alloy_primitives::keccak256(
            b"Order(uint256 salt,address maker,address signer,address taker,uint256 tokenId,uint256 makerAmount,uint256 takerAmount,uint256 expiration,uint256 nonce,uint256 feeRateBps,uint8 side,uint8 signatureType)"
        );

        let mut encoded = Vec::with_capacity(13 * 32);
        encoded.extend_from_slice(type_hash.as_slice());
        encoded.extend_from_slice(&encode_uint256(&self.salt)?);
        encoded.extend_from_slice(&encode_address(&self.maker)?);
        encoded.extend_from_slice(&encode_address(&self.signer)?);
        encoded.extend_from_slice(&encode_address(&self.taker)?);
        encoded.extend_from_slice(&encode_uint256(&self.token_id)?);
        encoded.extend_from_slice(&encode_uint256(&self.maker_amount)?);
        encoded.extend_from_slice(&encode_uint256(&self.taker_amount)?);
        encoded.extend_from_slice(&encode_uint256(&self.expiration)?);
        encoded.extend_from_slice(&encode_uint256(&self.nonce)?);
        encoded.extend_from_slice(&encode_uint256(&self.fee_rate_bps)?);
        encoded.extend_from_slice(&encode_uint8(self.side_index()));
        encoded.extend_from_slice(&encode_uint8(self.signature_type as u8));

        Ok(alloy_primitives::keccak256(&encoded).0)
    }

    fn into_signed(self, signature: String) -> SignedOrder {
        SignedOrder {
            side: self.side.as_str().to_string(),
            signature_type: self.signature_type as u8,
            salt: self.salt,
            maker: self.maker,
            signer: self.signer,
            taker: self.taker,
            token_id: self.token_id,
            maker_amount: self.maker_amount,
            taker_amount: self.taker_amount,
            expiration: self.expiration,
            nonce: self.nonce,
            fee_rate_bps: self.fee_rate_bps,
            signature,
        }
    }
}

/// CLOB API client for executing trades on Polymarket.
pub struct ClobClient {
    http: Client,
    base_url: String,
    signer: PrivateKeySigner,

    /// Proxy wallet holding the funds, when different from the signer
    funder: Option<Address>,

    api_key: String,
    api_secret: String,
    api_passphrase: String,
    chain_id: u64,
}

impl ClobClient {
    /// Create a new CLOB client.
    ///
    /// `chain_id` is 137 for Polygon mainnet, 80002 for the Amoy testnet.
    pub fn new(
        private_key: &str,
        api_key: &str,
        api_secret: &str,
        api_passphrase: &str,
        funder: Option<&str>,
        chain_id: u64,
    ) -> Result<Self> {
        let pk = private_key.strip_prefix("0x").unwrap_or(private_key);
        let signer = PrivateKeySigner::from_str(pk).context("Invalid private key")?;

        let funder = funder
            .filter(|f| !f.trim().is_empty())
            .map(|f| Address::from_str(f.trim()))
            .transpose()
            .context("Invalid funder address")?;

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: CLOB_URL.to_string(),
            signer,
            funder,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            api_passphrase: api_passphrase.to_string(),
            chain_id,
        })
    }

    /// Create from environment variables:
    /// - POLYMARKET_PRIVATE_KEY
    /// - POLYMARKET_API_KEY
    /// - POLYMARKET_API_SECRET
    /// - POLYMARKET_API_PASSPHRASE
    /// - POLYMARKET_FUNDER_ADDRESS (optional)
    /// - POLYMARKET_CHAIN_ID (defaults to 137)
    pub fn from_env() -> Result<Self> {
        let private_key = std::env::var("POLYMARKET_PRIVATE_KEY")
            .context("POLYMARKET_PRIVATE_KEY not set")?;
        let api_key = std::env::var("POLYMARKET_API_KEY")
            .context("POLYMARKET_API_KEY not set")?;
        let api_secret = std::env::var("POLYMARKET_API_SECRET")
            .context("POLYMARKET_API_SECRET not set")?;
        let api_passphrase = std::env::var("POLYMARKET_API_PASSPHRASE")
            .context("POLYMARKET_API_PASSPHRASE not set")?;
        let funder = std::env::var("POLYMARKET_FUNDER_ADDRESS").ok();
        let chain_id: u64 = std::env::var("POLYMARKET_CHAIN_ID")
            .unwrap_or_else(|_| "137".to_string())
            .parse()
            .context("Invalid POLYMARKET_CHAIN_ID")?;

        Self::new(&private_key, &api_key, &api_secret, &api_passphrase, funder.as_deref(), chain_id)
    }

    /// Address that holds positions (funder if set, else the signer).
    pub fn address(&self) -> Address {
        self.funder.unwrap_or_else(|| self.signer.address())
    }

    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook> {
        let url = format!("{}/book?token_id={}", self.base_url, token_id);
        let resp = self.http.get(&url).send().await.context("Failed to fetch order book")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to get order book: {} - {}", status, text));
        }

        resp.json().await.context("Failed to parse order book")
    }

    /// Price for a FOK order: best opposing level with slippage tolerance.
    async fn market_price(&self, token_id: &str, side: TradeSide) -> Result<Option<Decimal>> {
        let book = self.get_order_book(token_id).await?;
        let price = match side {
            TradeSide::Buy => book
                .best_ask()
                .map(|p| (p * (Decimal::ONE + MARKET_SLIPPAGE)).min(dec!(0.99))),
            TradeSide::Sell => book
                .best_bid()
                .map(|p| (p * (Decimal::ONE - MARKET_SLIPPAGE)).max(dec!(0.01))),
        };
        Ok(price.map(|p| p.round_dp(2)))
    }

    async fn build_signed_order(
        &self,
        token_id: &str,
        side: TradeSide,
        shares: Decimal,
        price: Decimal,
    ) -> Result<SignedOrder> {
        let signer = format!("{:?}", self.signer.address());
        let maker = format!("{:?}", self.address());
        let (maker_amount, taker_amount) = OrderFields::amounts(side, shares, price);

        let expiration =
            (SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() + 3600).to_string();

        let fields = OrderFields {
            salt: random_u128(),
            maker,
            signer,
            taker: ZERO_ADDRESS.to_string(),
            token_id: token_id.to_string(),
            maker_amount,
            taker_amount,
            expiration,
            nonce: "0".to_string(),
            fee_rate_bps: "0".to_string(),
            side,
            signature_type: if self.funder.is_some() {
                SignatureType::Poly
            } else {
                SignatureType::Eoa
            },
        };

        let order_hash = fields.struct_hash()?;
        let domain_hash = self.domain_separator()?;

        // keccak256("\x19\x01" ++ domainSeparator ++ structHash)
        let mut message = vec![0x19, 0x01];
        message.extend_from_slice(&domain_hash);
        message.extend_from_slice(&order_hash);
        let digest = alloy_primitives::keccak256(&message);

        let signature = self
            .signer
            .sign_hash(&digest)
            .await
            .context("Failed to sign order")?;

        Ok(fields.into_signed(format!("0x{}", hex::encode(signature.as_bytes()))))
    }

    fn domain_separator(&self) -> Result<[u8; 32]> {
        let type_hash = alloy_primitives::keccak256(
            b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)"
        );
        let name_hash = alloy_primitives::keccak256(b"Polymarket CTF Exchange");
        let version_hash = alloy_primitives::keccak256(b"1");

        let mut encoded = Vec::with_capacity(5 * 32);
        encoded.extend_from_slice(type_hash.as_slice());
        encoded.extend_from_slice(name_hash.as_slice());
        encoded.extend_from_slice(version_hash.as_slice());
        encoded.extend_from_slice(&encode_uint256(&self.chain_id.to_string())?);
        encoded.extend_from_slice(&encode_address(CTF_EXCHANGE)?);

        Ok(alloy_primitives::keccak256(&encoded).0)
    }

    /// API key headers.
    fn auth_headers(&self) -> Result<reqwest::header::HeaderMap> {
        use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

        let timestamp = Utc::now().timestamp().to_string();
        let mut preimage = self.api_secret.as_bytes().to_vec();
        preimage.extend_from_slice(timestamp.as_bytes());
        let digest = alloy_primitives::keccak256(&preimage);

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("poly-address"),
            HeaderValue::from_str(&format!("{:?}", self.signer.address()))?,
        );
        headers.insert(
            HeaderName::from_static("poly-signature"),
            HeaderValue::from_str(&format!("0x{}", hex::encode(digest.as_slice())))?,
        );
        headers.insert(
            HeaderName::from_static("poly-timestamp"),
            HeaderValue::from_str(&timestamp)?,
        );
        headers.insert(
            HeaderName::from_static("poly-api-key"),
            HeaderValue::from_str(&self.api_key)?,
        );
        headers.insert(
            HeaderName::from_static("poly-passphrase"),
            HeaderValue::from_str(&self.api_passphrase)?,
        );

        Ok(headers)
    }
}

#[async_trait]
impl OrderExecutor for ClobClient {
    fn is_ready(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty() && !self.api_passphrase.is_empty()
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt> {
        let price = match request.order_type {
            OrderType::Fok => match self.market_price(&request.token_id, request.side).await? {
                Some(p) => p,
                None => {
                    return Ok(OrderReceipt::rejected(format!(
                        "orderbook {} does not exist or has no liquidity",
                        request.token_id
                    )))
                }
            },
            OrderType::Gtc => request.price,
        };

        debug!(
            token = %request.token_id,
            side = %request.side,
            price = %price,
            shares = %request.shares,
            order_type = ?request.order_type,
            "Submitting order"
        );

        let order = self
            .build_signed_order(&request.token_id, request.side, request.shares, price)
            .await?;

        let payload = OrderPayload {
            order,
            owner: self.api_key.clone(),
            order_type: request.order_type,
        };

        let url = format!("{}/order", self.base_url);
        let resp = self
            .http
            .post(&url)
            .headers(self.auth_headers()?)
            .json(&payload)
            .send()
            .await
            .context("Failed to submit order")?;

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Ok(OrderReceipt::rejected(text));
        }

        let body: OrderResponse = resp.json().await.context("Failed to parse order response")?;
        if !body.success || !body.error_msg.is_empty() {
            return Ok(OrderReceipt {
                success: false,
                order_id: body.order_id,
                error: Some(body.error_msg),
            });
        }

        info!(
            token = %request.token_id,
            order_id = ?body.order_id,
            "Order accepted"
        );

        Ok(OrderReceipt {
            success: true,
            order_id: body.order_id,
            error: None,
        })
    }

    async fn order_state(&self, order_id: &str) -> Result<OrderState> {
        let url = format!("{}/data/order/{}", self.base_url, order_id);
        let resp = self
            .http
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await
            .context("Failed to fetch order status")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to get order: {} - {}", status, text));
        }

        let status: OrderStatus = resp.json().await.context("Failed to parse order status")?;
        Ok(status.state())
    }
}

/// USDC and conditional tokens both use 6 decimals.
fn to_base_units(amount: Decimal) -> String {
    (amount * Decimal::from(1_000_000u64)).trunc().to_string()
}

/// Encode address to 32-byte padded format.
fn encode_address(addr: &str) -> Result<[u8; 32]> {
    let addr = Address::from_str(addr).with_context(|| format!("Invalid address {addr}"))?;
    let mut buf = [0u8; 32];
    buf[12..].copy_from_slice(addr.as_slice());
    Ok(buf)
}

/// Encode a decimal uint256 string.
fn encode_uint256(value: &str) -> Result<[u8; 32]> {
    let n = U256::from_str(value).with_context(|| format!("Invalid uint256 {value}"))?;
    Ok(n.to_be_bytes())
}

/// Encode uint8 to 32-byte padded format.
fn encode_uint8(value: u8) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[31] = value;
    buf
}

fn random_u128() -> String {
    uuid::Uuid::new_v4().as_u128().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_units() {
        assert_eq!(to_base_units(dec!(100.5)), "100500000");
        assert_eq!(to_base_units(dec!(0.0000019)), "1");
    }

    #[test]
    fn test_amounts_by_side() {
        // 10 shares at 0.65 = 6.5 USDC
        assert_eq!(
            OrderFields::amounts(TradeSide::Buy, dec!(10), dec!(0.65)),
            ("6500000".to_string(), "10000000".to_string())
        );
        assert_eq!(
            OrderFields::amounts(TradeSide::Sell, dec!(10), dec!(0.65)),
            ("10000000".to_string(), "6500000".to_string())
        );
    }

    #[test]
    fn test_encode_uint8() {
        let encoded = encode_uint8(1);
        assert_eq!(encoded[31], 1);
        assert!(encoded[..31].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_encode_rejects_garbage() {
        assert!(encode_uint256("not-a-number").is_err());
        assert!(encode_address("0x1234").is_err());
        assert!(encode_address(ZERO_ADDRESS).is_ok());
    }

    #[test]
    fn test_best_levels() {
        let book: OrderBook = serde_json::from_str(
            r#"{"bids":[{"price":"0.40"},{"price":"0.45"}],"asks":[{"price":"0.55"},{"price":"0.50"}]}"#,
        )
        .unwrap();
        assert_eq!(book.best_bid(), Some(dec!(0.45)));
        assert_eq!(book.best_ask(), Some(dec!(0.50)));
    }

    #[test]
    fn test_order_status_state() {
        let matched: OrderStatus = serde_json::from_str(r#"{"status":"MATCHED"}"#).unwrap();
        assert_eq!(matched.state(), OrderState::Filled);

        let partial: OrderStatus = serde_json::from_str(
            r#"{"status":"LIVE","original_size":"10","size_matched":"4"}"#,
        )
        .unwrap();
        assert_eq!(partial.state(), OrderState::Live);

        let cancelled: OrderStatus = serde_json::from_str(
            r#"{"status":"CANCELED","original_size":"10","size_matched":"4"}"#,
        )
        .unwrap();
        assert_eq!(cancelled.state(), OrderState::Cancelled);

        let expired: OrderStatus = serde_json::from_str(r#"{"status":"expired"}"#).unwrap();
        assert_eq!(expired.state(), OrderState::Cancelled);
    }
}
