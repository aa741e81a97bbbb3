use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::ExchangeClient;
use crate::errors::ExchangeError;
use crate::models::{ClosedOrder, OrderState, OrderStatus, Side};

const KRAKEN_API_BASE: &str = "https://api.kraken.com";

type HmacSha512 = Hmac<Sha512>;

/// Kraken REST client.
///
/// Private endpoints are signed with
/// `API-Sign = base64(HMAC-SHA512(path || SHA256(nonce || body), secret))`
/// where the secret is base64-decoded first. The nonce is kept strictly
/// monotonic across concurrent callers.
#[derive(Debug, Clone)]
pub struct KrakenClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    last_nonce: Arc<AtomicU64>,
    // pair -> allowed price decimals, from AssetPairs (queried once per pair)
    pair_decimals: Arc<Mutex<HashMap<String, u32>>>,
}

#[derive(Debug, Deserialize)]
struct KrakenResponse<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

impl<T> KrakenResponse<T> {
    fn into_result(self) -> Result<T, ExchangeError> {
        if !self.error.is_empty() {
            return Err(ExchangeError::from_kraken(&self.error));
        }
        self.result
            .ok_or_else(|| ExchangeError::Permanent("response missing result".into()))
    }
}

#[derive(Debug, Deserialize)]
struct TickerInfo {
    /// Last trade closed: [price, lot volume]
    c: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PairInfo {
    altname: String,
    pair_decimals: u32,
}

#[derive(Debug, Deserialize)]
struct OrderDescr {
    pair: String,
    #[serde(rename = "type")]
    side: String,
}

#[derive(Debug, Deserialize)]
struct OrderInfo {
    status: String,
    descr: OrderDescr,
    vol_exec: String,
    price: String,
    fee: String,
    closetm: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AddOrderResult {
    txid: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClosedOrdersResult {
    #[serde(default)]
    closed: HashMap<String, OrderInfo>,
}

impl KrakenClient {
    pub fn new(http: Client, api_key: String, api_secret: String) -> Self {
        Self {
            http,
            api_key,
            api_secret,
            base_url: KRAKEN_API_BASE.into(),
            last_nonce: Arc::new(AtomicU64::new(0)),
            pair_decimals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn next_nonce(&self) -> u64 {
        let now = Utc::now().timestamp_millis() as u64;
        let mut prev = self.last_nonce.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_nonce
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn sign(&self, path: &str, nonce: u64, body: &str) -> Result<String, ExchangeError> {
        let secret = BASE64
            .decode(&self.api_secret)
            .map_err(|e| ExchangeError::Permanent(format!("invalid API secret: {e}")))?;

        let mut hasher = Sha256::new();
        hasher.update(format!("{nonce}{body}").as_bytes());
        let digest = hasher.finalize();

        let mut mac = HmacSha512::new_from_slice(&secret)
            .map_err(|e| ExchangeError::Permanent(format!("HMAC init failed: {e}")))?;
        mac.update(path.as_bytes());
        mac.update(&digest);

        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn public_call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &str,
    ) -> Result<T, ExchangeError> {
        let url = format!("{}/0/public/{endpoint}?{query}", self.base_url);
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        let parsed: KrakenResponse<T> = resp.json().await?;
        parsed.into_result()
    }

    async fn private_call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let path = format!("/0/private/{endpoint}");
        let nonce = self.next_nonce();

        let mut body = format!("nonce={nonce}");
        for (key, value) in params {
            body.push_str(&format!("&{key}={value}"));
        }

        let signature = self.sign(&path, nonce, &body)?;

        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("API-Key", &self.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: KrakenResponse<T> = resp.json().await?;
        parsed.into_result()
    }

    /// Allowed price decimals for the pair, cached after the first lookup.
    async fn price_decimals(&self, pair: &str) -> Result<u32, ExchangeError> {
        if let Some(decimals) = self
            .pair_decimals
            .lock()
            .expect("pair decimals cache poisoned")
            .get(pair)
        {
            return Ok(*decimals);
        }

        let pairs: HashMap<String, PairInfo> = self
            .public_call("AssetPairs", &format!("pair={pair}"))
            .await?;

        let decimals = pairs
            .iter()
            .find(|(key, info)| info.altname == pair || key.as_str() == pair)
            .map(|(_, info)| info.pair_decimals)
            .unwrap_or(4);

        self.pair_decimals
            .lock()
            .expect("pair decimals cache poisoned")
            .insert(pair.to_string(), decimals);

        Ok(decimals)
    }

    async fn query_order(&self, order_id: &str) -> Result<OrderInfo, ExchangeError> {
        let mut orders: HashMap<String, OrderInfo> = self
            .private_call(
                "QueryOrders",
                &[("txid", order_id.to_string()), ("trades", "true".into())],
            )
            .await?;

        orders
            .remove(order_id)
            .ok_or_else(|| ExchangeError::Permanent(format!("unknown order {order_id}")))
    }
}

fn parse_decimal(value: &str, field: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(value)
        .map_err(|e| ExchangeError::Permanent(format!("unparseable {field} `{value}`: {e}")))
}

/// Kraken prefixes currencies with X (crypto) and Z (fiat) in some
/// responses, e.g. `XXBT`, `ZEUR`. Strip the prefix on 4-letter codes so
/// balances line up with pair-derived asset names.
fn normalize_asset(asset: &str) -> &str {
    if asset.len() == 4 && (asset.starts_with('X') || asset.starts_with('Z')) {
        &asset[1..]
    } else {
        asset
    }
}

fn order_state(status: &str) -> OrderState {
    match status {
        "closed" => OrderState::Closed,
        "canceled" | "expired" => OrderState::Cancelled,
        _ => OrderState::Open,
    }
}

impl OrderInfo {
    fn to_status(&self) -> Result<OrderStatus, ExchangeError> {
        let filled = parse_decimal(&self.vol_exec, "vol_exec")?;
        let price = parse_decimal(&self.price, "price")?;
        let fee = parse_decimal(&self.fee, "fee")?;

        Ok(OrderStatus {
            state: order_state(&self.status),
            fill_price: (price > Decimal::ZERO).then_some(price),
            filled_quantity: filled,
            fee: (fee > Decimal::ZERO).then_some(fee),
        })
    }
}

#[async_trait]
impl ExchangeClient for KrakenClient {
    async fn get_price(&self, pair: &str) -> Result<Decimal, ExchangeError> {
        let tickers: HashMap<String, TickerInfo> =
            self.public_call("Ticker", &format!("pair={pair}")).await?;

        // Kraken may key the result by the canonical pair name rather than
        // the requested altname.
        let ticker = tickers
            .get(pair)
            .or_else(|| tickers.values().next())
            .ok_or_else(|| ExchangeError::Permanent(format!("no ticker data for {pair}")))?;

        let last = ticker
            .c
            .first()
            .ok_or_else(|| ExchangeError::Permanent(format!("empty ticker for {pair}")))?;

        parse_decimal(last, "ticker price")
    }

    async fn get_balances(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let raw: HashMap<String, String> = self.private_call("Balance", &[]).await?;

        let mut balances = HashMap::with_capacity(raw.len());
        for (asset, amount) in &raw {
            let amount = parse_decimal(amount, "balance")?;
            balances.insert(normalize_asset(asset).to_string(), amount);
        }

        Ok(balances)
    }

    async fn place_market_sell(
        &self,
        pair: &str,
        quantity: Decimal,
    ) -> Result<String, ExchangeError> {
        let result: AddOrderResult = self
            .private_call(
                "AddOrder",
                &[
                    ("pair", pair.to_string()),
                    ("type", "sell".into()),
                    ("ordertype", "market".into()),
                    ("volume", quantity.normalize().to_string()),
                ],
            )
            .await?;

        result
            .txid
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Permanent("AddOrder returned no txid".into()))
    }

    async fn place_limit_sell(
        &self,
        pair: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        let decimals = self.price_decimals(pair).await?;

        let result: AddOrderResult = self
            .private_call(
                "AddOrder",
                &[
                    ("pair", pair.to_string()),
                    ("type", "sell".into()),
                    ("ordertype", "limit".into()),
                    ("volume", quantity.normalize().to_string()),
                    ("price", price.round_dp(decimals).normalize().to_string()),
                ],
            )
            .await?;

        result
            .txid
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Permanent("AddOrder returned no txid".into()))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        #[derive(Deserialize)]
        struct CancelResult {
            #[allow(dead_code)]
            count: u32,
        }

        let _: CancelResult = self
            .private_call("CancelOrder", &[("txid", order_id.to_string())])
            .await?;

        Ok(())
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, ExchangeError> {
        self.query_order(order_id).await?.to_status()
    }

    async fn closed_orders_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClosedOrder>, ExchangeError> {
        let result: ClosedOrdersResult = self
            .private_call(
                "ClosedOrders",
                &[("start", since.timestamp().to_string())],
            )
            .await?;

        let mut orders = Vec::new();
        for (txid, info) in result.closed {
            if order_state(&info.status) != OrderState::Closed {
                continue;
            }
            let Some(side) = Side::from_api_str(&info.descr.side) else {
                continue;
            };

            let closed_at = info
                .closetm
                .and_then(|t| DateTime::from_timestamp(t as i64, 0))
                .unwrap_or_else(Utc::now);

            orders.push(ClosedOrder {
                order_id: txid,
                pair: info.descr.pair.to_uppercase(),
                side,
                fill_price: parse_decimal(&info.price, "price")?,
                fill_quantity: parse_decimal(&info.vol_exec, "vol_exec")?,
                fee: parse_decimal(&info.fee, "fee")?,
                closed_at,
            });
        }

        // Oldest first so import order matches fill order.
        orders.sort_by_key(|o| o.closed_at);
        Ok(orders)
    }
}
