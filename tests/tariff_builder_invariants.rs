//! Property tests for the universal invariants of a built tariff (§8):
//! full 48-bucket coverage and the buy/sell device restriction hold for
//! any well-formed forecast, not just the hand-picked unit-test fixtures.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use open_energy_controller::domain::{
    ChannelType, ForecastType, IntervalKind, PriceInterval, UserPolicy,
};
use open_energy_controller::tariff_builder::{build_tariff, CurrentActualInterval};
use proptest::prelude::*;

fn base_policy() -> UserPolicy {
    UserPolicy {
        user_id: uuid::Uuid::nil(),
        site_id: "site".into(),
        forecast_type: ForecastType::Predicted,
        sync_enabled: true,
        last_tariff_hash: None,
        last_update_time: None,
        last_update_status: None,
        solar_curtailment_enabled: false,
        curtailment_threshold_cents: 1.0,
        current_export_rule: None,
        current_export_rule_updated_at: None,
        spike_enabled: false,
        spike_region: "NSW1".into(),
        spike_threshold_per_mwh: 300.0,
        spike_sell_multiplier: 3.0,
        spike_test_mode: false,
        in_spike_mode: false,
        spike_start_time: None,
        saved_tariff_id: None,
        pre_spike_operation_mode: None,
        aemo_last_check: None,
        aemo_last_price: None,
        demand_window: None,
        grid_charging_disabled_for_demand: false,
    }
}

/// A full 48-bucket forecast for one day, every half-hour slot present for
/// both channels, with caller-supplied buy/sell cent values. Uses
/// `ActualInterval` so `aggregate()` reads `per_kwh` directly rather than
/// requiring an `AdvancedPrice` triple. `buy_values`/`sell_values` must each
/// have length 48.
fn full_day_forecast(
    day_start: DateTime<FixedOffset>,
    buy_values: &[f64],
    sell_values: &[f64],
) -> Vec<PriceInterval> {
    let mut out = Vec::with_capacity(96);
    for bucket in 0..48 {
        let end = day_start + chrono::Duration::minutes(30 * (bucket as i64 + 1));
        out.push(PriceInterval::ingest(
            end,
            30,
            ChannelType::General,
            IntervalKind::ActualInterval,
            buy_values[bucket],
            None,
        ));
        out.push(PriceInterval::ingest(
            end,
            30,
            ChannelType::FeedIn,
            IntervalKind::ActualInterval,
            -sell_values[bucket],
            None,
        ));
    }
    out
}

fn bucket_values() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.0f64..100.0, 48)
}

proptest! {
    /// Any forecast covering every bucket for today and tomorrow with
    /// non-negative buy/sell cents yields a tariff satisfying bucket
    /// coverage and the device restriction (sell <= buy, both >= 0).
    #[test]
    fn full_coverage_forecast_always_yields_valid_tariff(
        buy_today in bucket_values(),
        sell_today in bucket_values(),
        buy_tomorrow in bucket_values(),
        sell_tomorrow in bucket_values(),
    ) {
        let tz = chrono_tz::Australia::Sydney;
        let now: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 6, 10, 5, 7, 0).unwrap();
        let now_local = now.with_timezone(&tz);
        let today_midnight: DateTime<FixedOffset> = now_local
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_local_timezone(tz)
            .unwrap()
            .fixed_offset();
        let tomorrow_midnight = today_midnight + chrono::Duration::days(1);

        let mut forecast = full_day_forecast(today_midnight, &buy_today, &sell_today);
        forecast.extend(full_day_forecast(tomorrow_midnight, &buy_tomorrow, &sell_tomorrow));

        let policy = base_policy();
        let current = CurrentActualInterval::default();

        let tariff = build_tariff(&forecast, &current, &policy, tz, now)
            .expect("full-coverage forecast must build");

        prop_assert_eq!(tariff.buy.rates.len(), 48);
        prop_assert_eq!(tariff.sell.rates.len(), 48);
        for (key, buy) in tariff.buy.rates.iter() {
            prop_assert!(*buy >= 0.0, "buy[{key}] = {buy} must be non-negative");
            let sell = tariff.sell.get(*key).expect("matching sell bucket must exist");
            prop_assert!(sell >= 0.0, "sell[{key}] = {sell} must be non-negative");
            prop_assert!(sell <= *buy, "sell[{key}] = {sell} must not exceed buy[{key}] = {buy}");
        }
    }
}
