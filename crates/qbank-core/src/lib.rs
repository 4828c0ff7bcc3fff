//! Core domain model for qbank: snapshot windows, timeframe tags and the persisted entities.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "qbank-core";

/// Historical observation period covered by one company snapshot file.
///
/// Variants are declared in merge order, so `Ord` follows the order in which
/// a company's files are folded together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Window {
    All,
    MoreThanSix,
    SixMonths,
    ThreeMonths,
    ThirtyDays,
}

impl Window {
    pub const MERGE_ORDER: [Window; 5] = [
        Window::All,
        Window::MoreThanSix,
        Window::SixMonths,
        Window::ThreeMonths,
        Window::ThirtyDays,
    ];

    /// Provenance label persisted in `company_problems.source_file`.
    pub fn label(self) -> &'static str {
        match self {
            Window::All => "all",
            Window::MoreThanSix => "more-than-six",
            Window::SixMonths => "six-months",
            Window::ThreeMonths => "three-months",
            Window::ThirtyDays => "thirty-days",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Window::All => "all.csv",
            Window::MoreThanSix => "more-than-six-months.csv",
            Window::SixMonths => "six-months.csv",
            Window::ThreeMonths => "three-months.csv",
            Window::ThirtyDays => "thirty-days.csv",
        }
    }

    /// The freshness tag this window contributes, if any. `all` and
    /// `more-than-six` never tag an association.
    pub fn timeframe(self) -> Option<TimeframeTag> {
        match self {
            Window::All | Window::MoreThanSix => None,
            Window::SixMonths => Some(TimeframeTag::SixMonths),
            Window::ThreeMonths => Some(TimeframeTag::ThreeMonths),
            Window::ThirtyDays => Some(TimeframeTag::ThirtyDays),
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Most recent window an association was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeframeTag {
    ThirtyDays,
    ThreeMonths,
    SixMonths,
}

impl TimeframeTag {
    /// Resolution order, narrowest window first.
    pub const PRIORITY: [TimeframeTag; 3] = [
        TimeframeTag::ThirtyDays,
        TimeframeTag::ThreeMonths,
        TimeframeTag::SixMonths,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TimeframeTag::ThirtyDays => "thirty-days",
            TimeframeTag::ThreeMonths => "three-months",
            TimeframeTag::SixMonths => "six-months",
        }
    }
}

impl fmt::Display for TimeframeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed snapshot row, before it is merged or persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemRecord {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub difficulty: String,
    pub acceptance: Option<f64>,
    pub frequency: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Company {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Problem {
    pub id: i64,
    pub url: Option<String>,
    pub title: Option<String>,
    pub difficulty: Option<String>,
    pub acceptance: Option<f64>,
    pub frequency: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ProblemTag {
    pub problem_id: i64,
    pub tag: String,
    pub added_at: DateTime<Utc>,
}

/// "Company X has been observed to ask problem Y". `timeframe_tag` is kept as
/// the raw stored text so rows survive replication unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct CompanyProblem {
    pub company_id: i64,
    pub problem_id: i64,
    pub source_file: Option<String>,
    pub timeframe_tag: Option<String>,
    pub last_seen: DateTime<Utc>,
}
