//! Currency conversion.
//!
//! Rates come from an external collaborator behind [`RateSource`] and are
//! cached per (from, to, date): conversion always uses the rate effective
//! on the transaction date, so a cached date never goes stale.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::debug;

use keel_core::{CurrencyCode, EngineError, EngineResult, Money};

/// External FX rate lookup (`getExchangeRate(from, to, date)`).
pub trait RateSource: Send + Sync {
    fn rate(&self, from: &CurrencyCode, to: &CurrencyCode, date: NaiveDate)
    -> EngineResult<Decimal>;
}

impl<S> RateSource for Arc<S>
where
    S: RateSource + ?Sized,
{
    fn rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
    ) -> EngineResult<Decimal> {
        (**self).rate(from, to, date)
    }
}

/// Static rate table, used by tests and offline runs.
#[derive(Debug, Default)]
pub struct FixedRateSource {
    rates: RwLock<HashMap<(CurrencyCode, CurrencyCode, NaiveDate), Decimal>>,
}

impl FixedRateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, from: CurrencyCode, to: CurrencyCode, date: NaiveDate, rate: Decimal) {
        if let Ok(mut rates) = self.rates.write() {
            rates.insert((from, to, date), rate);
        }
    }
}

impl RateSource for FixedRateSource {
    fn rate(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
    ) -> EngineResult<Decimal> {
        let rates = self
            .rates
            .read()
            .map_err(|_| EngineError::infrastructure("rate table lock poisoned"))?;
        rates
            .get(&(from.clone(), to.clone(), date))
            .copied()
            .ok_or_else(|| {
                EngineError::integration(format!("no rate for {from}->{to} on {date}"))
            })
    }
}

type CacheKey = (CurrencyCode, CurrencyCode, NaiveDate);

/// Caching resolver over a [`RateSource`].
pub struct FxResolver {
    source: Arc<dyn RateSource>,
    cache: RwLock<HashMap<CacheKey, Decimal>>,
}

impl FxResolver {
    pub fn new(source: Arc<dyn RateSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Rate effective on `date`; 1 for same-currency pairs, cached per
    /// (from, to, date) otherwise.
    pub fn resolve(
        &self,
        from: &CurrencyCode,
        to: &CurrencyCode,
        date: NaiveDate,
    ) -> EngineResult<Decimal> {
        if from == to {
            return Ok(Decimal::ONE);
        }

        let key = (from.clone(), to.clone(), date);
        if let Ok(cache) = self.cache.read() {
            if let Some(rate) = cache.get(&key) {
                return Ok(*rate);
            }
        }

        let rate = self.source.rate(from, to, date)?;
        if rate <= Decimal::ZERO {
            return Err(EngineError::integration(format!(
                "rate source returned non-positive rate {rate} for {from}->{to}"
            )));
        }
        debug!(%from, %to, %date, %rate, "fetched fx rate");

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(key, rate);
        }
        Ok(rate)
    }

    /// Convert to the target currency, rounded to its precision.
    pub fn convert(&self, money: &Money, to: &CurrencyCode, date: NaiveDate) -> EngineResult<Money> {
        let rate = self.resolve(&money.currency, to, date)?;
        Ok(Money::new(money.amount * rate, to.clone()).rounded())
    }
}
