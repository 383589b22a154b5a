use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::RwLock;

use atelier_store::Rate;

/// Exchange-rate source. A rate is resolved for the transaction date,
/// falling through to the most recent known rate before it; a pair with
/// no usable rate resolves to `None` and the caller rejects the write.
#[async_trait]
pub trait ExchangeRates: Send + Sync {
    async fn rate_on(&self, currency: &str, base_currency: &str, date: NaiveDate) -> Option<Rate>;
}

/// Table-backed source seeded by operators or an upstream feed.
#[derive(Default)]
pub struct FixedRates {
    table: RwLock<HashMap<(String, String), BTreeMap<NaiveDate, Rate>>>,
}

impl FixedRates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_rate(
        &self,
        currency: impl Into<String>,
        base_currency: impl Into<String>,
        date: NaiveDate,
        rate: Rate,
    ) {
        let mut table = self.table.write().await;
        table
            .entry((currency.into(), base_currency.into()))
            .or_default()
            .insert(date, rate);
    }
}

#[async_trait]
impl ExchangeRates for FixedRates {
    async fn rate_on(&self, currency: &str, base_currency: &str, date: NaiveDate) -> Option<Rate> {
        if currency == base_currency {
            return Some(Rate::one());
        }
        let table = self.table.read().await;
        let rates = table.get(&(currency.to_string(), base_currency.to_string()))?;
        rates
            .range(..=date)
            .next_back()
            .map(|(_, rate)| *rate)
    }
}
