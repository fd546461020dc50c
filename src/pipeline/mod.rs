pub mod answer;
pub mod image_encode;
pub mod messages;
pub mod orchestrator;
pub mod prompts;
pub mod runlog;
pub mod vision;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Rating,
    Tagging,
    Export,
    Treatment,
    Full,
}

impl OperationMode {
    /// Order `Full` walks through; export goes last so it sees the
    /// ratings and tags applied before it.
    pub const FULL_PIPELINE_ORDER: [Self; 4] =
        [Self::Rating, Self::Tagging, Self::Treatment, Self::Export];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rating => "rating",
            Self::Tagging => "tagging",
            Self::Export => "export",
            Self::Treatment => "treatment",
            Self::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rating" => Some(Self::Rating),
            "tagging" => Some(Self::Tagging),
            "export" => Some(Self::Export),
            "treatment" | "tratamento" => Some(Self::Treatment),
            "full" => Some(Self::Full),
            _ => None,
        }
    }

    pub fn is_composite(self) -> bool {
        self == Self::Full
    }
}
