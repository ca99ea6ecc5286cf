//! Budget tiers.

use crate::config::{BudgetConfig, ResourceBudget};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named resource-budget class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Critical,
    #[default]
    Standard,
    Intensive,
    Report,
}

impl Tier {
    /// Lenient lookup: unknown names resolve to `Standard`.
    pub fn from_name(name: &str) -> Tier {
        match name.trim().to_ascii_lowercase().as_str() {
            "critical" => Tier::Critical,
            "intensive" => Tier::Intensive,
            "report" => Tier::Report,
            _ => Tier::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Critical => "critical",
            Tier::Standard => "standard",
            Tier::Intensive => "intensive",
            Tier::Report => "report",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BudgetConfig {
    pub fn for_tier(&self, tier: Tier) -> ResourceBudget {
        match tier {
            Tier::Critical => self.critical,
            Tier::Standard => self.standard,
            Tier::Intensive => self.intensive,
            Tier::Report => self.report,
        }
    }
}
