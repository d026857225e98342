use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Distance kind for vector similarity search.
///
/// Every distance in the index is "smaller is closer". The inner-product
/// variant is negated so that convention holds for it too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceKind {
    /// Squared Euclidean distance, `Σ (aᵢ − bᵢ)²`. Never negative.
    L2,
    /// Negated inner product, `−Σ aᵢ · bᵢ`.
    NegDot,
}

impl DistanceKind {
    /// Returns the canonical lowercase string used in sidecar metadata.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::L2 => "l2",
            Self::NegDot => "negdot",
        }
    }
}

impl Default for DistanceKind {
    fn default() -> Self {
        Self::L2
    }
}

impl FromStr for DistanceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l2" => Ok(Self::L2),
            "negdot" => Ok(Self::NegDot),
            _ => Err(()),
        }
    }
}
