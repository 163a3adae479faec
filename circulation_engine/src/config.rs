use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Circulation rules applied by the engine components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CirculationPolicy {
    /// How long a reservation stays in the queue before the sweeper expires it
    #[serde(default = "CirculationPolicy::default_hold_period_days")]
    pub hold_period_days: i64,
    #[serde(default = "CirculationPolicy::default_loan_period_days")]
    pub loan_period_days: i64,
    /// Time the patron has to collect a copy when auto-issue falls back
    #[serde(default = "CirculationPolicy::default_collection_window_hours")]
    pub collection_window_hours: i64,
    #[serde(default = "CirculationPolicy::default_fine_rate_per_day")]
    pub fine_rate_per_day: Decimal,
}

impl CirculationPolicy {
    fn default_hold_period_days() -> i64 {
        7
    }

    fn default_loan_period_days() -> i64 {
        14
    }

    fn default_collection_window_hours() -> i64 {
        24
    }

    fn default_fine_rate_per_day() -> Decimal {
        Decimal::from(100)
    }

    pub fn hold_period(&self) -> Duration {
        Duration::days(self.hold_period_days)
    }

    pub fn loan_period(&self) -> Duration {
        Duration::days(self.loan_period_days)
    }

    pub fn collection_window(&self) -> Duration {
        Duration::hours(self.collection_window_hours)
    }
}

impl Default for CirculationPolicy {
    fn default() -> Self {
        Self {
            hold_period_days: Self::default_hold_period_days(),
            loan_period_days: Self::default_loan_period_days(),
            collection_window_hours: Self::default_collection_window_hours(),
            fine_rate_per_day: Self::default_fine_rate_per_day(),
        }
    }
}
