//! Data freshness tiers
//!
//! The age of the freshest trusted price/balance refresh decides how much
//! confidence the engine puts in quoted figures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SpendConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessStatus {
    Fresh,
    Stale,
    Degraded,
}

impl FreshnessStatus {
    /// Classify by age since the last refresh. Never refreshed is degraded.
    pub fn classify(
        last_refreshed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        config: &SpendConfig,
    ) -> Self {
        let Some(at) = last_refreshed_at else {
            return FreshnessStatus::Degraded;
        };
        let age = (now - at).num_seconds().max(0);
        if age <= config.fresh_max_age_secs {
            FreshnessStatus::Fresh
        } else if age <= config.stale_max_age_secs {
            FreshnessStatus::Stale
        } else {
            FreshnessStatus::Degraded
        }
    }

    /// Degradation deduction for this tier, in basis points
    pub fn buffer_bps(&self, config: &SpendConfig) -> i64 {
        match self {
            FreshnessStatus::Fresh => 0,
            FreshnessStatus::Stale => config.stale_buffer_bps,
            FreshnessStatus::Degraded => config.degraded_buffer_bps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_tiers() {
        let config = SpendConfig::default();
        let now = Utc::now();
        assert_eq!(
            FreshnessStatus::classify(Some(now - Duration::seconds(10)), now, &config),
            FreshnessStatus::Fresh
        );
        assert_eq!(
            FreshnessStatus::classify(Some(now - Duration::seconds(600)), now, &config),
            FreshnessStatus::Stale
        );
        assert_eq!(
            FreshnessStatus::classify(Some(now - Duration::hours(2)), now, &config),
            FreshnessStatus::Degraded
        );
        assert_eq!(
            FreshnessStatus::classify(None, now, &config),
            FreshnessStatus::Degraded
        );
    }

    #[test]
    fn test_buffer_grows_with_staleness() {
        let config = SpendConfig::default();
        let fresh = FreshnessStatus::Fresh.buffer_bps(&config);
        let stale = FreshnessStatus::Stale.buffer_bps(&config);
        let degraded = FreshnessStatus::Degraded.buffer_bps(&config);
        assert_eq!(fresh, 0);
        assert!(stale > fresh);
        assert!(degraded > stale);
    }
}
