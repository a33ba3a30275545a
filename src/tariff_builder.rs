//! C3: pure function translating a price forecast into a device tariff.
//!
//! Everything here is deterministic given its inputs — no I/O, no clock
//! access beyond the `now` parameter the caller supplies. This is what
//! makes it straightforward to exercise with table-driven tests.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::domain::{
    AppliesTo, ChannelType, ForecastType, IntervalKind, PriceInterval, PricePeriodKey, RateTable,
    TariffDocument, TariffError, UserPolicy,
};

/// The most recent settled 5-minute samples for the in-progress period,
/// one per channel when available (§4.3 step 5).
#[derive(Debug, Clone, Default)]
pub struct CurrentActualInterval {
    pub general: Option<PriceInterval>,
    pub feed_in: Option<PriceInterval>,
}

/// Per-bucket diagnostic summary produced by step 9 of the algorithm.
#[derive(Debug, Clone)]
pub struct ValidationSummary {
    pub buy_min: f64,
    pub buy_max: f64,
    pub buy_avg: f64,
    pub sell_min: f64,
    pub sell_max: f64,
    pub sell_avg: f64,
    pub margin_avg: f64,
    pub violations: usize,
}

const MAX_MISSING_BUCKETS: usize = 10;
const TOTAL_BUCKETS: usize = 96; // 48 buy + 48 sell

/// Builds the regular (non-spike) tariff document. See SPEC_FULL.md §4.3.
pub fn build_tariff(
    forecast: &[PriceInterval],
    current_actual: &CurrentActualInterval,
    policy: &UserPolicy,
    device_tz: Tz,
    now: chrono::DateTime<Utc>,
) -> Result<TariffDocument, TariffError> {
    let now_local = now.with_timezone(&device_tz);
    let today = now_local.date_naive();
    let tomorrow = today + chrono::Duration::days(1);
    let current_bucket = PricePeriodKey::containing(now_local.hour(), now_local.minute());

    let buy_by_date = aggregate(forecast, ChannelType::General, policy.forecast_type, device_tz);
    let sell_by_date = aggregate(forecast, ChannelType::FeedIn, policy.forecast_type, device_tz);

    let mut adjustments = Vec::new();
    let mut buy = assemble_rolling_window(&buy_by_date, today, tomorrow, current_bucket);
    let mut sell = assemble_rolling_window(&sell_by_date, today, tomorrow, current_bucket);

    apply_current_period_override(&mut buy, &mut sell, current_actual, current_bucket, device_tz);

    clamp_device_restrictions(&mut buy, &mut sell, &mut adjustments);

    let missing = (48 - buy.rates.len()) + (48 - sell.rates.len());
    if missing > MAX_MISSING_BUCKETS {
        warn!(missing, limit = MAX_MISSING_BUCKETS, "tariff build aborted: too many buckets missing");
        return Err(TariffError::InsufficientData { missing });
    }

    let (demand, demand_applies_to) = build_demand_rates(policy);

    let summary = validate(&buy, &sell);
    info!(
        buy_min = summary.buy_min,
        buy_max = summary.buy_max,
        buy_avg = summary.buy_avg,
        sell_min = summary.sell_min,
        sell_max = summary.sell_max,
        sell_avg = summary.sell_avg,
        margin_avg = summary.margin_avg,
        violations = summary.violations,
        "tariff validation summary"
    );

    Ok(TariffDocument {
        code: "AMBER_TOU".to_string(),
        name: "Amber time-of-use sync".to_string(),
        utility: "Amber Electric".to_string(),
        currency: "AUD".to_string(),
        daily_supply_charge: policy.demand_window.as_ref().and_then(|d| d.daily_supply_charge),
        monthly_supply_charge: policy.demand_window.as_ref().and_then(|d| d.monthly_supply_charge),
        buy,
        sell,
        demand,
        demand_applies_to,
        adjustments,
    })
}

/// Step 10: the 48-bucket spike override. The current bucket and the next
/// three half-hours carry a steep sell rate; everything else is typical
/// retail. Used only by C7, never by the regular C5 path.
pub fn build_spike_tariff(
    current_wholesale_cents_per_kwh: f64,
    sell_multiplier: f64,
    typical_buy_dollars: f64,
    typical_sell_dollars: f64,
    device_tz: Tz,
    now: chrono::DateTime<Utc>,
) -> TariffDocument {
    let now_local = now.with_timezone(&device_tz);
    let current_bucket = PricePeriodKey::containing(now_local.hour(), now_local.minute());

    let spike_sell = (current_wholesale_cents_per_kwh / 100.0 * sell_multiplier).max(0.0);

    let mut spike_buckets = vec![current_bucket];
    let mut b = current_bucket;
    for _ in 0..3 {
        b = b.next();
        spike_buckets.push(b);
    }

    let mut buy = RateTable::empty();
    let mut sell = RateTable::empty();
    for key in PricePeriodKey::all() {
        buy.set(key, typical_buy_dollars);
        if spike_buckets.contains(&key) {
            sell.set(key, spike_sell);
        } else {
            sell.set(key, typical_sell_dollars.min(typical_buy_dollars));
        }
    }

    TariffDocument {
        code: "AMBER_SPIKE".to_string(),
        name: "Amber spike export".to_string(),
        utility: "Amber Electric".to_string(),
        currency: "AUD".to_string(),
        daily_supply_charge: None,
        monthly_supply_charge: None,
        buy,
        sell,
        demand: None,
        demand_applies_to: AppliesTo::Buy,
        adjustments: Vec::new(),
    }
}

/// Steps 1-3: select a price per interval, convert to dollars, and average
/// same-bucket samples into one value per `(date, bucket)`.
fn aggregate(
    forecast: &[PriceInterval],
    channel: ChannelType,
    forecast_type: ForecastType,
    device_tz: Tz,
) -> HashMap<(NaiveDate, PricePeriodKey), f64> {
    let mut buckets: HashMap<(NaiveDate, PricePeriodKey), Vec<f64>> = HashMap::new();

    for interval in forecast.iter().filter(|i| i.channel_type == channel) {
        let cents = match interval.kind {
            IntervalKind::ForecastInterval => match &interval.advanced_price {
                Some(a) => a.get(forecast_type),
                None => continue, // expected for far-future forecasts
            },
            IntervalKind::CurrentInterval => match &interval.advanced_price {
                Some(a) => a.get(forecast_type),
                None => interval.per_kwh,
            },
            IntervalKind::ActualInterval => interval.per_kwh,
        };

        let start_local = interval.start_time().with_timezone(&device_tz);
        let date = start_local.date_naive();
        let key = PricePeriodKey::containing(start_local.hour(), start_local.minute());
        let dollars = cents / 100.0;
        buckets.entry((date, key)).or_default().push(dollars);
    }

    buckets
        .into_iter()
        .map(|(k, values)| {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            (k, mean)
        })
        .collect()
}

/// Step 4: for every one of the 48 buckets, prefer tomorrow's forecast for
/// buckets strictly before `current_bucket`, else today's; fall back to
/// today's if tomorrow is absent; otherwise leave the bucket missing.
fn assemble_rolling_window(
    by_date: &HashMap<(NaiveDate, PricePeriodKey), f64>,
    today: NaiveDate,
    tomorrow: NaiveDate,
    current_bucket: PricePeriodKey,
) -> RateTable {
    let mut table = RateTable::empty();
    for key in PricePeriodKey::all() {
        let preferred_date = if key < current_bucket { tomorrow } else { today };
        let value = by_date
            .get(&(preferred_date, key))
            .or_else(|| by_date.get(&(today, key)));
        if let Some(v) = value {
            table.set(key, *v);
        }
    }
    table
}

/// Step 5: replace the current bucket's buy/sell with the observed
/// 5-minute sample, when supplied.
fn apply_current_period_override(
    buy: &mut RateTable,
    sell: &mut RateTable,
    current_actual: &CurrentActualInterval,
    current_bucket: PricePeriodKey,
    device_tz: Tz,
) {
    let _ = device_tz;
    if let Some(general) = &current_actual.general {
        let dollars = (general.per_kwh / 100.0).max(0.0);
        buy.set(current_bucket, dollars);
    }
    if let Some(feed_in) = &current_actual.feed_in {
        let dollars = (feed_in.per_kwh / 100.0).max(0.0);
        sell.set(current_bucket, dollars);
    }
}

/// Step 6: clamp buy/sell to device-legal ranges, recording each change.
fn clamp_device_restrictions(buy: &mut RateTable, sell: &mut RateTable, adjustments: &mut Vec<String>) {
    for (key, value) in buy.rates.iter_mut() {
        if *value < 0.0 {
            adjustments.push(format!("{key}: buy {value:.4} clamped to 0"));
            *value = 0.0;
        }
    }
    let keys: Vec<_> = sell.rates.keys().copied().collect();
    for key in keys {
        let sell_value = sell.rates[&key];
        if sell_value < 0.0 {
            adjustments.push(format!("{key}: sell {sell_value:.4} clamped to 0"));
            sell.rates.insert(key, 0.0);
        }
        if let Some(buy_value) = buy.get(key) {
            let sell_value = sell.rates[&key];
            if sell_value > buy_value {
                adjustments.push(format!("{key}: sell {sell_value:.4} clamped to buy {buy_value:.4}"));
                sell.rates.insert(key, buy_value);
            }
        }
    }
}

/// Step 8: peak/shoulder/off-peak demand rates over the 48-bucket grid.
fn build_demand_rates(policy: &UserPolicy) -> (Option<RateTable>, AppliesTo) {
    let Some(demand) = policy.demand_window.as_ref() else {
        return (None, AppliesTo::Buy);
    };
    if !demand.enabled {
        return (None, AppliesTo::Buy);
    }

    let mut table = RateTable::empty();
    for key in PricePeriodKey::all() {
        // Demand rates are evaluated per weekday in the builder's caller via
        // C8; the tariff document itself carries one rate per bucket
        // independent of weekday, matching the device's flat weekly grid.
        let rate = if window_contains_any_weekday(&demand.peak_window, key) {
            demand.peak_rate_per_kw
        } else if demand
            .shoulder_window
            .as_ref()
            .is_some_and(|w| window_contains_any_weekday(w, key))
        {
            demand.shoulder_rate_per_kw
        } else {
            demand.off_peak_rate_per_kw
        };
        table.set(key, rate);
    }
    (Some(table), demand.applies_to)
}

fn window_contains_any_weekday(window: &crate::domain::TimeWindow, key: PricePeriodKey) -> bool {
    use chrono::Weekday::*;
    [Mon, Tue, Wed, Thu, Fri, Sat, Sun]
        .iter()
        .any(|&d| window.contains(d, key.hour as u32, key.minute as u32))
}

/// Step 9: verify the device restriction invariant and summarize.
fn validate(buy: &RateTable, sell: &RateTable) -> ValidationSummary {
    let mut violations = 0;
    let mut buy_vals = Vec::new();
    let mut sell_vals = Vec::new();
    let mut margins = Vec::new();

    for key in PricePeriodKey::all() {
        if let (Some(b), Some(s)) = (buy.get(key), sell.get(key)) {
            if b < 0.0 || s < 0.0 || s > b {
                violations += 1;
            }
            buy_vals.push(b);
            sell_vals.push(s);
            margins.push(b - s);
        }
    }

    let avg = |v: &[f64]| if v.is_empty() { 0.0 } else { v.iter().sum::<f64>() / v.len() as f64 };
    let min = |v: &[f64]| v.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = |v: &[f64]| v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    ValidationSummary {
        buy_min: if buy_vals.is_empty() { 0.0 } else { min(&buy_vals) },
        buy_max: if buy_vals.is_empty() { 0.0 } else { max(&buy_vals) },
        buy_avg: avg(&buy_vals),
        sell_min: if sell_vals.is_empty() { 0.0 } else { min(&sell_vals) },
        sell_max: if sell_vals.is_empty() { 0.0 } else { max(&sell_vals) },
        sell_avg: avg(&sell_vals),
        margin_avg: avg(&margins),
        violations,
    }
}
