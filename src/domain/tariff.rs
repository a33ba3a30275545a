//! The device-native tariff document built by C3 and published by C2.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::price::PricePeriodKey;

/// Where a demand charge applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliesTo {
    Buy,
    Sell,
    Both,
}

/// A 48-bucket energy (buy or sell) rate table plus its TOU period windows.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    pub rates: BTreeMap<PricePeriodKey, f64>,
}

impl RateTable {
    pub fn empty() -> Self {
        Self { rates: BTreeMap::new() }
    }

    pub fn get(&self, key: PricePeriodKey) -> Option<f64> {
        self.rates.get(&key).copied()
    }

    pub fn set(&mut self, key: PricePeriodKey, value: f64) {
        self.rates.insert(key, value);
    }

    /// True once every one of the 48 buckets has a value.
    pub fn is_complete(&self) -> bool {
        self.rates.len() == 48
    }
}

/// The built tariff: 48 buy/sell/demand rates plus fixed charges and metadata.
///
/// This is the in-memory model; [`TariffDocument::to_wire`] renders the
/// bit-exact device JSON shape of the external interface.
#[derive(Debug, Clone)]
pub struct TariffDocument {
    pub code: String,
    pub name: String,
    pub utility: String,
    pub currency: String,
    pub daily_supply_charge: Option<f64>,
    pub monthly_supply_charge: Option<f64>,
    pub buy: RateTable,
    pub sell: RateTable,
    /// Demand rate ($/kW) applied per bucket, present only when the policy
    /// enables demand charges.
    pub demand: Option<RateTable>,
    pub demand_applies_to: AppliesTo,
    /// Per-bucket adjustments recorded by the device-restriction clamps
    /// (step 6 of the builder algorithm), for diagnostics.
    pub adjustments: Vec<String>,
}

impl TariffDocument {
    pub fn buckets_missing(&self) -> usize {
        let missing_buy = 48 - self.buy.rates.len();
        let missing_sell = 48 - self.sell.rates.len();
        missing_buy + missing_sell
    }

    /// Canonical key-sorted JSON used for MD5 hashing (dedup, §4.5 step 5).
    pub fn canonical_json(&self) -> serde_json::Value {
        serde_json::to_value(self.to_wire()).expect("tariff document always serializes")
    }

    pub fn hash(&self) -> String {
        let canonical = self.canonical_json().to_string();
        format!("{:x}", md5::compute(canonical.as_bytes()))
    }

    pub fn to_wire(&self) -> WireTariff {
        let energy_rates: BTreeMap<String, f64> = self
            .buy
            .rates
            .iter()
            .map(|(k, v)| (k.wire_key(), round4(*v)))
            .collect();
        let sell_rates: BTreeMap<String, f64> = self
            .sell
            .rates
            .iter()
            .map(|(k, v)| (k.wire_key(), round4(*v)))
            .collect();

        let tou_periods = tou_periods_for(self.buy.rates.keys().copied());
        let sell_tou_periods = tou_periods_for(self.sell.rates.keys().copied());

        let demand_rates: BTreeMap<String, f64> = self
            .demand
            .as_ref()
            .map(|t| t.rates.iter().map(|(k, v)| (k.wire_key(), round4(*v))).collect())
            .unwrap_or_default();

        WireTariff {
            version: 1,
            code: self.code.clone(),
            name: self.name.clone(),
            utility: self.utility.clone(),
            currency: self.currency.clone(),
            seasons: BTreeMap::new(),
            daily_charges: self.daily_supply_charge.map_or_else(
                || vec![DailyCharge { name: "Charge".to_string(), amount: None }],
                |amount| vec![DailyCharge { name: "Daily Supply Charge".to_string(), amount: Some(amount) }],
            ),
            demand_charges: SeasonMap {
                all: RatesSection { rates: if demand_rates.is_empty() { zero_all() } else { BTreeMap::new() } },
                summer: Season {
                    from_month: 1,
                    to_month: 12,
                    from_day: 1,
                    to_day: 31,
                    rates: demand_rates.clone(),
                    tou_periods: BTreeMap::new(),
                },
                winter: Season::empty(),
            },
            energy_charges: SeasonMap {
                all: RatesSection { rates: zero_all() },
                summer: Season {
                    from_month: 1,
                    to_month: 12,
                    from_day: 1,
                    to_day: 31,
                    rates: energy_rates,
                    tou_periods,
                },
                winter: Season::empty(),
            },
            sell_tariff: SellTariff {
                energy_charges: SeasonMap {
                    all: RatesSection { rates: zero_all() },
                    summer: Season {
                        from_month: 1,
                        to_month: 12,
                        from_day: 1,
                        to_day: 31,
                        rates: sell_rates,
                        tou_periods: sell_tou_periods,
                    },
                    winter: Season::empty(),
                },
            },
        }
    }
}

fn zero_all() -> BTreeMap<String, f64> {
    let mut m = BTreeMap::new();
    m.insert("ALL".to_string(), 0.0);
    m
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// One `tou_periods[PERIOD_HH_MM]` entry: a single half-hour-wide window,
/// `toDayOfWeek:6` fixed, with only the non-zero hour/minute fields present.
fn tou_periods_for(keys: impl Iterator<Item = PricePeriodKey>) -> BTreeMap<String, TouPeriodEntry> {
    let mut out = BTreeMap::new();
    for key in keys {
        let end = key.next();
        out.insert(
            key.wire_key(),
            TouPeriodEntry {
                periods: vec![TouWindow {
                    to_day_of_week: 6,
                    from_hour: non_zero(key.hour),
                    from_minute: non_zero(key.minute),
                    to_hour: non_zero(end.hour),
                    to_minute: non_zero(end.minute),
                }],
            },
        );
    }
    out
}

fn non_zero(v: u8) -> Option<u8> {
    if v == 0 {
        None
    } else {
        Some(v)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTariff {
    pub version: u32,
    pub code: String,
    pub name: String,
    pub utility: String,
    pub currency: String,
    pub daily_charges: Vec<DailyCharge>,
    pub demand_charges: SeasonMap,
    pub energy_charges: SeasonMap,
    pub seasons: SeasonsPlaceholder,
    pub sell_tariff: SellTariff,
}

// `seasons` is emitted as an empty map placeholder; the actual season bounds
// and tou_periods live alongside each SeasonMap's `summer`/`winter` entries,
// matching the source's flattened wire layout.
pub type SeasonsPlaceholder = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCharge {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonMap {
    #[serde(rename = "ALL")]
    pub all: RatesSection,
    #[serde(rename = "Summer")]
    pub summer: Season,
    #[serde(rename = "Winter")]
    pub winter: Season,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatesSection {
    pub rates: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Season {
    #[serde(rename = "fromMonth")]
    pub from_month: u32,
    #[serde(rename = "toMonth")]
    pub to_month: u32,
    #[serde(rename = "fromDay")]
    pub from_day: u32,
    #[serde(rename = "toDay")]
    pub to_day: u32,
    pub rates: BTreeMap<String, f64>,
    pub tou_periods: BTreeMap<String, TouPeriodEntry>,
}

impl Season {
    fn empty() -> Self {
        Self {
            from_month: 0,
            to_month: 0,
            from_day: 0,
            to_day: 0,
            rates: BTreeMap::new(),
            tou_periods: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouPeriodEntry {
    pub periods: Vec<TouWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouWindow {
    #[serde(rename = "toDayOfWeek")]
    pub to_day_of_week: u8,
    #[serde(rename = "fromHour", skip_serializing_if = "Option::is_none")]
    pub from_hour: Option<u8>,
    #[serde(rename = "fromMinute", skip_serializing_if = "Option::is_none")]
    pub from_minute: Option<u8>,
    #[serde(rename = "toHour", skip_serializing_if = "Option::is_none")]
    pub to_hour: Option<u8>,
    #[serde(rename = "toMinute", skip_serializing_if = "Option::is_none")]
    pub to_minute: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellTariff {
    pub energy_charges: SeasonMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_table(value: f64) -> RateTable {
        let mut t = RateTable::empty();
        for k in PricePeriodKey::all() {
            t.set(k, value);
        }
        t
    }

    #[test]
    fn wire_tariff_has_48_rate_keys() {
        let doc = TariffDocument {
            code: "AMBER".into(),
            name: "Amber sync".into(),
            utility: "Amber Electric".into(),
            currency: "AUD".into(),
            daily_supply_charge: Some(1.1),
            monthly_supply_charge: None,
            buy: full_table(0.30),
            sell: full_table(0.08),
            demand: None,
            demand_applies_to: AppliesTo::Buy,
            adjustments: vec![],
        };
        let wire = doc.to_wire();
        assert_eq!(wire.energy_charges.summer.rates.len(), 48);
        assert_eq!(wire.energy_charges.summer.tou_periods.len(), 48);
        assert_eq!(wire.sell_tariff.energy_charges.summer.rates.len(), 48);
    }

    #[test]
    fn hash_is_stable_for_identical_documents() {
        let doc = TariffDocument {
            code: "A".into(),
            name: "A".into(),
            utility: "A".into(),
            currency: "AUD".into(),
            daily_supply_charge: None,
            monthly_supply_charge: None,
            buy: full_table(0.3),
            sell: full_table(0.1),
            demand: None,
            demand_applies_to: AppliesTo::Buy,
            adjustments: vec![],
        };
        assert_eq!(doc.hash(), doc.clone().hash());
    }

    #[test]
    fn missing_buckets_counts_both_sides() {
        let doc = TariffDocument {
            code: "A".into(),
            name: "A".into(),
            utility: "A".into(),
            currency: "AUD".into(),
            daily_supply_charge: None,
            monthly_supply_charge: None,
            buy: RateTable::empty(),
            sell: RateTable::empty(),
            demand: None,
            demand_applies_to: AppliesTo::Buy,
            adjustments: vec![],
        };
        assert_eq!(doc.buckets_missing(), 96);
    }
}
