use super::{BackupError, Result};
use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How long a backup is kept before cleanup removes it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RetentionTier {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RetentionTier {
    /// Classification order; the first matching tier wins.
    pub const PRIORITY: [RetentionTier; 4] = [Self::Yearly, Self::Monthly, Self::Weekly, Self::Daily];

    pub fn retention_days(&self) -> i64 {
        match self {
            Self::Daily => 30,
            Self::Weekly => 84,
            Self::Monthly => 365,
            Self::Yearly => 2555,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl fmt::Display for RetentionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetentionTier {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        Self::PRIORITY
            .into_iter()
            .find(|tier| tier.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| BackupError::config(format!("Unknown retention tier: {s}")))
    }
}

/// Maps backup timestamps to tiers. Dates are taken in UTC.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub weekly_anchor: Weekday,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            weekly_anchor: Weekday::Sun,
        }
    }
}

impl RetentionPolicy {
    pub fn new(weekly_anchor: Weekday) -> Self {
        Self { weekly_anchor }
    }

    pub fn classify(&self, timestamp: DateTime<Utc>) -> RetentionTier {
        RetentionTier::PRIORITY
            .into_iter()
            .find(|tier| self.matches(*tier, timestamp))
            .unwrap_or(RetentionTier::Daily)
    }

    pub fn expiration_of(&self, timestamp: DateTime<Utc>, tier: RetentionTier) -> DateTime<Utc> {
        timestamp + Duration::days(tier.retention_days())
    }

    fn matches(&self, tier: RetentionTier, timestamp: DateTime<Utc>) -> bool {
        match tier {
            RetentionTier::Yearly => timestamp.ordinal() == 1,
            RetentionTier::Monthly => timestamp.day() == 1,
            RetentionTier::Weekly => timestamp.weekday() == self.weekly_anchor,
            RetentionTier::Daily => true,
        }
    }
}
