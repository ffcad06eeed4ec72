use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::compile;

const DEFAULT_GRADE: u32 = 8;

static FIRST_INTEGER: LazyLock<Regex> = LazyLock::new(|| compile(r"\d+"));
static KINDERGARTEN: LazyLock<Regex> = LazyLock::new(|| compile(r"(?i)^\s*(?:k|kg|kinder|kindergarten|pre-?k)\b"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum GradeBand {
    #[serde(rename = "K-2")]
    KToTwo,
    #[serde(rename = "3-5")]
    ThreeToFive,
    #[serde(rename = "6-8")]
    SixToEight,
    #[serde(rename = "9-12")]
    NineToTwelve,
}

impl GradeBand {
    /// Maps a free-form grade label onto its band. Total: malformed labels land in 6-8.
    pub fn classify(grade: &str) -> Self {
        Self::from_grade(grade_number(grade))
    }

    pub fn from_grade(grade: u32) -> Self {
        match grade.min(12) {
            0..=2 => GradeBand::KToTwo,
            3..=5 => GradeBand::ThreeToFive,
            6..=8 => GradeBand::SixToEight,
            _ => GradeBand::NineToTwelve,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GradeBand::KToTwo => "K-2",
            GradeBand::ThreeToFive => "3-5",
            GradeBand::SixToEight => "6-8",
            GradeBand::NineToTwelve => "9-12",
        }
    }

    /// Sentence cap enforced on every rewritten reply.
    pub fn max_sentences(self) -> usize {
        match self {
            GradeBand::KToTwo => 3,
            _ => 4,
        }
    }

    pub fn is_early(self) -> bool {
        matches!(self, GradeBand::KToTwo)
    }
}

impl fmt::Display for GradeBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convenience wrapper returning the band label directly.
pub fn band(grade: &str) -> &'static str {
    GradeBand::classify(grade).as_str()
}

fn grade_number(grade: &str) -> u32 {
    if let Some(found) = FIRST_INTEGER.find(grade) {
        // Anything too long to parse is far above 12 anyway.
        return found.as_str().parse::<u32>().unwrap_or(12).min(12);
    }

    if KINDERGARTEN.is_match(grade) {
        return 0;
    }

    DEFAULT_GRADE
}
