//! Holding selection order

use serde::{Deserialize, Serialize};

use crate::providers::Holding;

/// Order in which holdings are sold to cover a shortfall
///
/// Both orderings fall through to the other key and finally the holding id,
/// so the order is total and repeatable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationOrdering {
    /// Lowest liquidity rank first, oldest acquisition breaks ties
    #[default]
    MostLiquidFirst,
    /// Oldest acquisition first, liquidity rank breaks ties
    OldestFirst,
}

impl LiquidationOrdering {
    pub fn sort(&self, holdings: &mut [Holding]) {
        match self {
            LiquidationOrdering::MostLiquidFirst => holdings.sort_by(|a, b| {
                a.liquidity_rank
                    .cmp(&b.liquidity_rank)
                    .then(a.acquired_at.cmp(&b.acquired_at))
                    .then_with(|| a.holding_id.cmp(&b.holding_id))
            }),
            LiquidationOrdering::OldestFirst => holdings.sort_by(|a, b| {
                a.acquired_at
                    .cmp(&b.acquired_at)
                    .then(a.liquidity_rank.cmp(&b.liquidity_rank))
                    .then_with(|| a.holding_id.cmp(&b.holding_id))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    fn holding(id: &str, rank: u8, age_days: i64) -> Holding {
        Holding {
            holding_id: id.into(),
            symbol: "X".into(),
            quantity: Decimal::ONE,
            liquidity_rank: rank,
            acquired_at: Utc::now() - Duration::days(age_days),
        }
    }

    fn ids(holdings: &[Holding]) -> Vec<&str> {
        holdings.iter().map(|h| h.holding_id.as_str()).collect()
    }

    #[test]
    fn test_most_liquid_first_with_age_tiebreak() {
        let mut hs = vec![
            holding("illiquid-old", 3, 100),
            holding("liquid-new", 0, 1),
            holding("liquid-old", 0, 50),
            holding("mid", 1, 10),
        ];
        LiquidationOrdering::MostLiquidFirst.sort(&mut hs);
        assert_eq!(ids(&hs), vec!["liquid-old", "liquid-new", "mid", "illiquid-old"]);
    }

    #[test]
    fn test_oldest_first() {
        let mut hs = vec![
            holding("liquid-new", 0, 1),
            holding("illiquid-old", 3, 100),
            holding("mid", 1, 10),
        ];
        LiquidationOrdering::OldestFirst.sort(&mut hs);
        assert_eq!(ids(&hs), vec!["illiquid-old", "mid", "liquid-new"]);
    }

    #[test]
    fn test_full_tie_uses_id() {
        let at = Utc::now();
        let mut hs: Vec<Holding> = ["b", "a", "c"]
            .iter()
            .map(|id| Holding {
                acquired_at: at,
                ..holding(id, 0, 0)
            })
            .collect();
        LiquidationOrdering::MostLiquidFirst.sort(&mut hs);
        assert_eq!(ids(&hs), vec!["a", "b", "c"]);
    }
}
