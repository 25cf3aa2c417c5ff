//! USD price resolution with per-asset fallback.
//!
//! Resolution never fails: a feed error, a timeout, or a price that is not a
//! positive finite number substitutes the configured fallback for that asset
//! only.

use candid::CandidType;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::host::{Clock, PriceFeed, StateStore};
use crate::types::Asset;

#[derive(Clone, Copy, Debug, PartialEq, Eq, CandidType, Deserialize, Serialize)]
pub enum QuoteSource {
    #[serde(rename = "live")]
    Live,
    #[serde(rename = "fallback")]
    Fallback,
}

#[derive(Clone, Debug, PartialEq, CandidType, Deserialize, Serialize)]
pub struct PriceQuote {
    pub asset: Asset,
    pub usd_price: f64,
    pub source: QuoteSource,
    pub timestamp_ms: u64,
}

fn usable(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

pub async fn resolve_price<H>(host: &H, asset: Asset) -> PriceQuote
where
    H: PriceFeed + Clock + StateStore,
{
    let (feed_id, fallback) = host.read(|state| {
        let chain = state.config.pricing_chain(asset);
        (chain.price_feed_id.clone(), chain.fallback_usd)
    });
    let quote = |usd_price: f64, source: QuoteSource| PriceQuote {
        asset,
        usd_price,
        source,
        timestamp_ms: host.now_ms(),
    };

    let Some(feed_id) = feed_id else {
        debug!(asset = asset.symbol(), fallback, "no live feed configured");
        return quote(fallback, QuoteSource::Fallback);
    };

    match host.fetch_usd(&feed_id).await {
        Ok(price) if usable(price) => quote(price, QuoteSource::Live),
        Ok(price) => {
            warn!(asset = asset.symbol(), price, fallback, "feed returned unusable price");
            quote(fallback, QuoteSource::Fallback)
        }
        Err(err) => {
            warn!(asset = asset.symbol(), error = %err, fallback, "price feed unavailable");
            quote(fallback, QuoteSource::Fallback)
        }
    }
}

pub async fn resolve_prices<H>(host: &H, first: Asset, second: Asset) -> (PriceQuote, PriceQuote)
where
    H: PriceFeed + Clock + StateStore,
{
    let first_quote = resolve_price(host, first).await;
    // Assets quoted at par (ETH/WETH) share one observation.
    let second_quote = if first.priced_as() == second.priced_as() {
        PriceQuote {
            asset: second,
            ..first_quote.clone()
        }
    } else {
        resolve_price(host, second).await
    };
    (first_quote, second_quote)
}

/// Parses a CoinGecko `simple/price` body: `{"ethereum":{"usd":4321.5}}`.
pub fn parse_simple_price(body: &[u8], feed_id: &str) -> Option<f64> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get(feed_id)?.get("usd")?.as_f64()
}
