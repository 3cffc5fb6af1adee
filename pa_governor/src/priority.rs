use serde::Deserialize;
use serde::Serialize;

/// Business priority of an upstream request
///
/// Lower discriminant means higher precedence; the derived `Ord` follows
/// declaration order so `UserTriggered < ActiveWatch < ... < Analytics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// A user is waiting on the answer
    UserTriggered = 0,
    /// Price checks for actively watched items
    ActiveWatch = 1,
    /// Background enrichment of cached product data
    BackgroundEnrichment = 2,
    /// Reporting and analytics jobs
    Analytics = 3,
}

impl Priority {
    /// All levels, highest precedence first
    pub const ALL: [Priority; 4] = [Priority::UserTriggered, Priority::ActiveWatch, Priority::BackgroundEnrichment, Priority::Analytics];

    pub const COUNT: usize = Self::ALL.len();

    /// Multiplier applied to the upstream sustained spacing
    ///
    /// Higher priorities wait less between permits, lower ones more.
    pub fn spacing_factor(self) -> f64 {
        match self {
            Priority::UserTriggered => 0.8,
            Priority::ActiveWatch => 1.0,
            Priority::BackgroundEnrichment => 1.25,
            Priority::Analytics => 1.5,
        }
    }

    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::UserTriggered => "user_triggered",
            Priority::ActiveWatch => "active_watch",
            Priority::BackgroundEnrichment => "background_enrichment",
            Priority::Analytics => "analytics",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
