use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

pub const GENERATION_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdKind {
    Donor,
    Specimen,
    Sample,
    File,
}

impl IdKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdKind::Donor => "donor",
            IdKind::Specimen => "specimen",
            IdKind::Sample => "sample",
            IdKind::File => "file",
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a submitted id is matched against the identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResolveMode {
    #[default]
    Direct,
    /// The archive submits legacy barcodes and UUIDs to different namespaces.
    TranslateBarcode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentMode {
    ReadOnly,
    #[default]
    Authoritative,
}

impl AssignmentMode {
    pub fn can_create(self) -> bool {
        matches!(self, AssignmentMode::Authoritative)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(String);

impl StableId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Open,
    Controlled,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Open => write!(f, "open"),
            Access::Controlled => write!(f, "controlled"),
        }
    }
}

/// Classification of an archive, used for publication eligibility and combine priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvenanceClass {
    /// The harmonization-study archive.
    Harmonized,
    /// Fully-open controlled-access release archive.
    OpenRelease,
    Unclassified,
    /// Object-store mirrors receiving copies ahead of formal sign-off.
    PreRelease,
}

impl ProvenanceClass {
    pub fn is_formally_released(self) -> bool {
        matches!(self, ProvenanceClass::Harmonized | ProvenanceClass::OpenRelease)
    }

    /// Position in the fixed completeness order used when combining.
    pub fn priority(self) -> u8 {
        match self {
            ProvenanceClass::Harmonized => 0,
            ProvenanceClass::OpenRelease => 1,
            ProvenanceClass::Unclassified => 2,
            ProvenanceClass::PreRelease => 3,
        }
    }
}

impl fmt::Display for ProvenanceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvenanceClass::Harmonized => write!(f, "harmonized"),
            ProvenanceClass::OpenRelease => write!(f, "open-release"),
            ProvenanceClass::Unclassified => write!(f, "unclassified"),
            ProvenanceClass::PreRelease => write!(f, "pre-release"),
        }
    }
}

impl FromStr for ProvenanceClass {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "harmonized" => Ok(ProvenanceClass::Harmonized),
            "open-release" => Ok(ProvenanceClass::OpenRelease),
            "unclassified" => Ok(ProvenanceClass::Unclassified),
            "pre-release" => Ok(ProvenanceClass::PreRelease),
            _ => Err(KiraError::InvalidProvenance(value.to_string())),
        }
    }
}

/// One generation of the search index: `<alias>-<yyyymmdd_HHMMSS>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationName {
    alias: String,
    timestamp: NaiveDateTime,
}

impl GenerationName {
    pub fn new(alias: &str, at: DateTime<Utc>) -> Self {
        let naive = at.naive_utc();
        // second precision, matching the rendered name
        let timestamp = naive.with_nanosecond(0).unwrap_or(naive);
        Self {
            alias: alias.to_string(),
            timestamp,
        }
    }

    /// Parses `name` as a generation of `alias`; anything else is rejected.
    pub fn parse(alias: &str, name: &str) -> Result<Self, KiraError> {
        let pattern = Regex::new(&format!(r"^{}-(\d{{8}}_\d{{6}})$", regex::escape(alias)))
            .map_err(|err| KiraError::InvalidGeneration(err.to_string()))?;
        let suffix = pattern
            .captures(name)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| KiraError::InvalidGeneration(name.to_string()))?;
        let timestamp = NaiveDateTime::parse_from_str(suffix, GENERATION_TIMESTAMP_FORMAT)
            .map_err(|_| KiraError::InvalidGeneration(name.to_string()))?;
        Ok(Self {
            alias: alias.to_string(),
            timestamp,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }
}

impl fmt::Display for GenerationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.alias,
            self.timestamp.format(GENERATION_TIMESTAMP_FORMAT)
        )
    }
}
