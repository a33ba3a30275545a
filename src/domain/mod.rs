pub mod error;
pub mod policy;
pub mod price;
pub mod tariff;

pub use error::{DeviceError, PriceSourceError, TariffError};
pub use policy::{
    DemandWindowPolicy, ExportRule, OperationMode, SavedTariff, TimeWindow, UserPolicy, WeekdayMask,
};
pub use price::{AdvancedPrice, ChannelType, ForecastType, IntervalKind, PriceInterval, PricePeriodKey};
pub use tariff::{AppliesTo, RateTable, TariffDocument, WireTariff};
