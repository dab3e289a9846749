use std::fmt;
use std::fs;
use std::io::Read;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use flate2::read::GzDecoder;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::KiraError;
use crate::record::{FileCopy, FileRecord};

/// Maps one archive's raw payload into records carrying the canonical field set.
pub trait SourceFileProcessor: Send + Sync {
    fn map_to_records(&self, raw: &[u8]) -> Result<Vec<FileRecord>, KiraError>;
}

/// Reads the raw payload behind a source location.
pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, location: &SourceLocation) -> Result<Vec<u8>, KiraError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// One JSON array of records.
    Json,
    /// One record per line.
    Ndjson,
}

impl SourceFormat {
    pub fn infer(location: &str) -> Self {
        let location = location.trim_end_matches(".gz");
        if location.ends_with(".ndjson") || location.ends_with(".jsonl") {
            SourceFormat::Ndjson
        } else {
            SourceFormat::Json
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Path(Utf8PathBuf),
    Url(String),
}

impl SourceLocation {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.starts_with("http://") || value.starts_with("https://") {
            SourceLocation::Url(value.to_string())
        } else {
            SourceLocation::Path(Utf8PathBuf::from(value))
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Path(path) => write!(f, "{path}"),
            SourceLocation::Url(url) => write!(f, "{url}"),
        }
    }
}

/// Archive identity stamped onto copies that do not carry their own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    #[serde(default)]
    pub repo_type: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub data_path: Option<String>,
    #[serde(default)]
    pub metadata_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub code: String,
    pub location: SourceLocation,
    pub format: SourceFormat,
    pub gzip: bool,
    pub repository: RepositoryInfo,
}

/// A configured archive: where its payload lives and how it maps to records.
pub struct Archive {
    pub code: String,
    pub location: SourceLocation,
    pub processor: Box<dyn SourceFileProcessor>,
}

impl Archive {
    pub fn new(
        code: impl Into<String>,
        location: SourceLocation,
        processor: Box<dyn SourceFileProcessor>,
    ) -> Self {
        Self {
            code: code.into(),
            location,
            processor,
        }
    }

    /// Archive reading an already-mapped manifest.
    pub fn manifest(spec: &SourceSpec) -> Self {
        Self::new(
            spec.code.clone(),
            spec.location.clone(),
            Box::new(ManifestProcessor::from_spec(spec)),
        )
    }
}

/// Reads records already in the canonical shape, as JSON or NDJSON, optionally gzipped.
#[derive(Debug, Clone)]
pub struct ManifestProcessor {
    code: String,
    format: SourceFormat,
    gzip: bool,
    repository: RepositoryInfo,
}

impl ManifestProcessor {
    pub fn new(code: impl Into<String>, format: SourceFormat) -> Self {
        Self {
            code: code.into(),
            format,
            gzip: false,
            repository: RepositoryInfo::default(),
        }
    }

    pub fn from_spec(spec: &SourceSpec) -> Self {
        Self {
            code: spec.code.clone(),
            format: spec.format,
            gzip: spec.gzip,
            repository: spec.repository.clone(),
        }
    }

    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn with_repository(mut self, repository: RepositoryInfo) -> Self {
        self.repository = repository;
        self
    }

    fn decode(&self, raw: &[u8]) -> Result<String, KiraError> {
        if !self.gzip {
            return String::from_utf8(raw.to_vec())
                .map_err(|err| KiraError::SourceParse(err.to_string()));
        }
        let mut decoder = GzDecoder::new(raw);
        let mut text = String::new();
        decoder
            .read_to_string(&mut text)
            .map_err(|err| KiraError::SourceParse(err.to_string()))?;
        Ok(text)
    }

    fn stamp(&self, copy: FileCopy) -> FileCopy {
        let repo = &self.repository;
        FileCopy {
            repo_code: copy
                .repo_code
                .filter(|code| !code.is_empty())
                .or_else(|| Some(self.code.clone())),
            repo_type: copy.repo_type.or_else(|| repo.repo_type.clone()),
            repo_org: copy.repo_org.or_else(|| repo.org.clone()),
            repo_name: copy.repo_name.or_else(|| repo.name.clone()),
            repo_country: copy.repo_country.or_else(|| repo.country.clone()),
            repo_base_url: copy.repo_base_url.or_else(|| repo.base_url.clone()),
            repo_data_path: copy.repo_data_path.or_else(|| repo.data_path.clone()),
            repo_metadata_path: copy
                .repo_metadata_path
                .or_else(|| repo.metadata_path.clone()),
            ..copy
        }
    }
}

impl SourceFileProcessor for ManifestProcessor {
    fn map_to_records(&self, raw: &[u8]) -> Result<Vec<FileRecord>, KiraError> {
        let text = self.decode(raw)?;
        let records: Vec<FileRecord> = match self.format {
            SourceFormat::Json => serde_json::from_str(&text)
                .map_err(|err| KiraError::SourceParse(err.to_string()))?,
            SourceFormat::Ndjson => text
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(idx, line)| {
                    serde_json::from_str(line).map_err(|err| {
                        KiraError::SourceParse(format!("line {}: {err}", idx + 1))
                    })
                })
                .collect::<Result<_, _>>()?,
        };
        debug!(source = %self.code, records = records.len(), "mapped manifest");
        Ok(records
            .into_iter()
            .map(|record| FileRecord {
                file_copies: record
                    .file_copies
                    .into_iter()
                    .map(|copy| self.stamp(copy))
                    .collect(),
                ..record
            })
            .collect())
    }
}

/// Local files are read directly; URLs are fetched over HTTP with bounded retries.
#[derive(Clone)]
pub struct DefaultFetcher {
    client: Client,
}

impl DefaultFetcher {
    pub fn new() -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-repo/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::SourceHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| KiraError::SourceHttp(err.to_string()))?;
        Ok(Self { client })
    }

    fn handle_status(response: Response) -> Result<Response, KiraError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "source request failed".to_string());
        Err(KiraError::SourceStatus { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, KiraError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 1000;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    if attempt < MAX_RETRIES && is_retryable_status(resp.status().as_u16()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(KiraError::SourceHttp(err.to_string()));
                }
            }
        }
    }
}

impl SourceFetcher for DefaultFetcher {
    fn fetch(&self, location: &SourceLocation) -> Result<Vec<u8>, KiraError> {
        match location {
            SourceLocation::Path(path) => fs::read(path.as_std_path())
                .map_err(|err| KiraError::Filesystem(format!("{path}: {err}"))),
            SourceLocation::Url(url) => {
                let response = self.send_with_retries(|| self.client.get(url))?;
                let response = Self::handle_status(response)?;
                let bytes = response
                    .bytes()
                    .map_err(|err| KiraError::SourceHttp(err.to_string()))?;
                Ok(bytes.to_vec())
            }
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}
