use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Subscription tier of a portal user, which selects the workstation pool the
/// session draws from and the monthly usage quota.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[derive(strum_macros::Display, strum_macros::EnumString, strum_macros::EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PlanTier {
    Freemium,
    Starter,
    Pro,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Freemium
    }
}

impl PlanTier {
    /// Default monthly quota in minutes, `-1` meaning unlimited.
    pub fn default_quota_minutes(&self) -> i64 {
        match self {
            Self::Freemium => 300,
            Self::Starter => 900,
            Self::Pro => -1,
        }
    }

    /// Default idle warning threshold.
    pub fn default_idle_warning(&self) -> Duration {
        match self {
            Self::Freemium => Duration::from_secs(15 * 60),
            Self::Starter => Duration::from_secs(20 * 60),
            Self::Pro => Duration::from_secs(30 * 60),
        }
    }

    /// Default idle termination threshold.
    pub fn default_idle_termination(&self) -> Duration {
        match self {
            Self::Freemium => Duration::from_secs(30 * 60),
            Self::Starter => Duration::from_secs(40 * 60),
            Self::Pro => Duration::from_secs(60 * 60),
        }
    }

    /// Pool records written before tiering was introduced have no plan; they
    /// belong to the pro pool.
    pub fn legacy_default() -> Self {
        Self::Pro
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn plan_round_trips_as_lowercase() {
        assert_eq!(serde_json::to_string(&PlanTier::Pro).unwrap(), "\"pro\"");
        let plan: PlanTier = serde_json::from_str("\"starter\"").unwrap();
        assert_eq!(plan, PlanTier::Starter);
        assert_eq!(PlanTier::from_str("freemium").unwrap(), PlanTier::Freemium);
    }

    #[test]
    fn unlimited_quota_is_minus_one() {
        assert_eq!(PlanTier::Pro.default_quota_minutes(), -1);
        assert_eq!(PlanTier::Freemium.default_quota_minutes(), 300);
    }
}
