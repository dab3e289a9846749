use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{AssignmentMode, ProvenanceClass};
use crate::error::KiraError;
use crate::filter::ProvenancePolicy;
use crate::source::{RepositoryInfo, SourceFormat, SourceLocation, SourceSpec};

pub const CONFIG_FILE: &str = "kira-repo.json";
pub const DEFAULT_ALIAS: &str = "repository";
pub const DEFAULT_RETAIN: usize = 3;
pub const DEFAULT_BULK_ACTIONS: usize = 1000;
pub const DEFAULT_BULK_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_HARMONIZED_STUDY: &str = "PCAWG";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub index: IndexSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub notify: NotifySection,
    #[serde(default)]
    pub report: ReportSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IndexSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub retain: Option<usize>,
    #[serde(default)]
    pub bulk_actions: Option<usize>,
    #[serde(default)]
    pub bulk_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IdentitySection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub barcode_url: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    /// Projects whose archives submit legacy barcodes instead of UUIDs.
    #[serde(default)]
    pub barcode_projects: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PolicySection {
    #[serde(default)]
    pub harmonized_study: Option<String>,
    /// `repo_code` to provenance class name.
    #[serde(default)]
    pub repositories: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Shorthand(String),
    Detailed(SourceEntryObject),
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SourceEntryObject {
    pub code: String,
    pub location: String,
    #[serde(default)]
    pub format: Option<SourceFormat>,
    #[serde(default)]
    pub gzip: Option<bool>,
    #[serde(default)]
    pub repository: RepositoryInfo,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NotifySection {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ReportSection {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub url: String,
    pub alias: String,
    pub retain: usize,
    pub bulk_actions: usize,
    pub bulk_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub url: Option<String>,
    pub barcode_url: Option<String>,
    pub token: Option<String>,
    pub mode: AssignmentMode,
    pub barcode_projects: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub index: IndexSettings,
    pub identity: IdentitySettings,
    pub policy: ProvenancePolicy,
    pub sources: Vec<SourceSpec>,
    pub webhook_url: Option<String>,
    pub report_path: Option<Utf8PathBuf>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => Self::default_path().ok_or(KiraError::MissingConfig)?,
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        let mut resolved = Self::resolve_config(config)?;
        Self::apply_env(&mut resolved);
        Ok(resolved)
    }

    /// `kira-repo.json` in the working directory, else the per-user config directory.
    pub fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("org", "kira", "kira-repo")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let alias = config
            .index
            .alias
            .unwrap_or_else(|| DEFAULT_ALIAS.to_string());
        if alias.trim().is_empty() || alias.chars().any(|ch| ch.is_ascii_uppercase()) {
            return Err(KiraError::InvalidConfig(format!(
                "index alias must be non-empty lowercase: {alias:?}"
            )));
        }
        let retain = config.index.retain.unwrap_or(DEFAULT_RETAIN);
        if retain == 0 {
            return Err(KiraError::InvalidConfig(
                "index.retain must keep at least one generation".to_string(),
            ));
        }
        let index = IndexSettings {
            url: config
                .index
                .url
                .unwrap_or_else(|| "http://localhost:9200".to_string()),
            alias,
            retain,
            bulk_actions: config.index.bulk_actions.unwrap_or(DEFAULT_BULK_ACTIONS).max(1),
            bulk_bytes: config.index.bulk_bytes.unwrap_or(DEFAULT_BULK_BYTES).max(1),
        };

        let identity = IdentitySettings {
            url: config.identity.url,
            barcode_url: config.identity.barcode_url,
            token: None,
            mode: if config.identity.read_only {
                AssignmentMode::ReadOnly
            } else {
                AssignmentMode::Authoritative
            },
            barcode_projects: config.identity.barcode_projects,
        };

        let repositories = config
            .policy
            .repositories
            .into_iter()
            .map(|(code, class)| Ok((code, class.parse::<ProvenanceClass>()?)))
            .collect::<Result<BTreeMap<_, _>, KiraError>>()?;
        let policy = ProvenancePolicy::new(
            config
                .policy
                .harmonized_study
                .unwrap_or_else(|| DEFAULT_HARMONIZED_STUDY.to_string()),
            repositories,
        );

        let sources = config
            .sources
            .into_iter()
            .map(|entry| match entry {
                SourceEntry::Shorthand(value) => Ok(SourceSpec {
                    code: default_source_code(&value)?,
                    location: SourceLocation::parse(&value),
                    format: SourceFormat::infer(&value),
                    gzip: value.ends_with(".gz"),
                    repository: RepositoryInfo::default(),
                }),
                SourceEntry::Detailed(obj) => {
                    if obj.code.trim().is_empty() {
                        return Err(KiraError::InvalidConfig(
                            "source code must not be empty".to_string(),
                        ));
                    }
                    Ok(SourceSpec {
                        format: obj
                            .format
                            .unwrap_or_else(|| SourceFormat::infer(&obj.location)),
                        gzip: obj.gzip.unwrap_or_else(|| obj.location.ends_with(".gz")),
                        location: SourceLocation::parse(&obj.location),
                        code: obj.code,
                        repository: obj.repository,
                    })
                }
            })
            .collect::<Result<Vec<_>, KiraError>>()?;

        let mut seen = std::collections::HashSet::new();
        for source in &sources {
            if !seen.insert(source.code.as_str()) {
                return Err(KiraError::InvalidConfig(format!(
                    "duplicate source code: {}",
                    source.code
                )));
            }
        }

        Ok(ResolvedConfig {
            schema_version,
            index,
            identity,
            policy,
            sources,
            webhook_url: config.notify.webhook_url,
            report_path: config.report.path.map(Utf8PathBuf::from),
        })
    }

    fn apply_env(resolved: &mut ResolvedConfig) {
        if let Ok(url) = std::env::var("KIRA_REPO_INDEX_URL") {
            if !url.trim().is_empty() {
                resolved.index.url = url.trim().to_string();
            }
        }
        if let Ok(token) = std::env::var("KIRA_REPO_ID_TOKEN") {
            if !token.trim().is_empty() {
                resolved.identity.token = Some(token.trim().to_string());
            }
        }
    }
}

/// Shorthand sources are named after their file stem: `data/collab.ndjson.gz` is `collab`.
fn default_source_code(location: &str) -> Result<String, KiraError> {
    let name = location
        .rsplit('/')
        .next()
        .and_then(|file| file.split('.').next())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| KiraError::InvalidConfig(format!("cannot name source {location}")))?;
    Ok(name.to_string())
}
