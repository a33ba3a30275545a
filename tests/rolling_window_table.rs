//! Table-driven coverage of the rolling-window split (§4.3 step 4): for a
//! given wall-clock time, every bucket strictly before the current bucket
//! must be filled from tomorrow's forecast, and every bucket at or after it
//! from today's — across several distinct times of day, not just the one
//! case the inline unit tests in `tariff_builder.rs` already cover.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use open_energy_controller::domain::{
    AdvancedPrice, ChannelType, ForecastType, IntervalKind, PriceInterval, PricePeriodKey,
    UserPolicy,
};
use open_energy_controller::tariff_builder::{build_tariff, CurrentActualInterval};
use rstest::rstest;

fn policy() -> UserPolicy {
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

/// Full 48-bucket forecasts for two consecutive days, each day a flat price
/// distinguishable from the other, so the winning date is identifiable.
fn two_day_forecast(day1_start: DateTime<FixedOffset>, day1_price: f64, day2_price: f64) -> Vec<PriceInterval> {
    let day2_start = day1_start + chrono::Duration::days(1);
    let mut out = Vec::new();
    for (start, price) in [(day1_start, day1_price), (day2_start, day2_price)] {
        for i in 0..48 {
            let end = start + chrono::Duration::minutes(30 * i);
            out.push(PriceInterval::ingest(
                end,
                30,
                ChannelType::General,
                IntervalKind::ForecastInterval,
                0.0,
                Some(AdvancedPrice { predicted: price, low: price, high: price }),
            ));
            out.push(PriceInterval::ingest(
                end,
                30,
                ChannelType::FeedIn,
                IntervalKind::ForecastInterval,
                0.0,
                Some(AdvancedPrice { predicted: -1.0, low: -1.0, high: -1.0 }),
            ));
        }
    }
    out
}

#[rstest]
#[case(0, 0)]
#[case(0, 30)]
#[case(9, 30)]
#[case(12, 0)]
#[case(15, 7)] // mid-bucket minute, same bucket as the existing inline unit test
#[case(23, 30)]
fn bucket_before_current_pulls_tomorrow_rest_pulls_today(#[case] hour: u32, #[case] minute: u32) {
    let tz = chrono_tz::Australia::Sydney;
    let day1_start: DateTime<FixedOffset> = "2024-06-10T00:30:00+10:00".parse().unwrap();
    let forecast = two_day_forecast(day1_start, 10.0, 99.0);

    let now_local = tz
        .with_ymd_and_hms(2024, 6, 10, hour, minute, 0)
        .unwrap();
    let now: DateTime<Utc> = now_local.with_timezone(&Utc);
    let current_bucket = PricePeriodKey::containing(hour, minute);

    let doc = build_tariff(&forecast, &CurrentActualInterval::default(), &policy(), tz, now).unwrap();

    let all: Vec<_> = PricePeriodKey::all().collect();
    let current_index = all.iter().position(|k| *k == current_bucket).unwrap();

    // The current bucket itself is never "before" it, so it must come from today.
    assert_eq!(doc.buy.get(current_bucket).unwrap(), 0.10, "current bucket {current_bucket} should use today's price");

    if current_index > 0 {
        let prev = all[current_index - 1];
        assert_eq!(doc.buy.get(prev).unwrap(), 0.99, "bucket {prev} before current {current_bucket} should use tomorrow's price");
    }

    if current_index + 1 < all.len() {
        let next = all[current_index + 1];
        assert_eq!(doc.buy.get(next).unwrap(), 0.10, "bucket {next} at/after current {current_bucket} should use today's price");
    }
}
