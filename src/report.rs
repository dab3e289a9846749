use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::time::Duration;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::combine::ReconciliationWarning;
use crate::error::{
    ExtractionError, IdentityAssignmentError, KiraError, PublicationPolicyError, PublishError,
};
use crate::identity::IdentityStats;
use crate::publish::PublishOutcome;

pub const EXIT_OK: u8 = 0;
pub const EXIT_EXTRACTION: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_PUBLISH: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCount {
    pub code: String,
    pub records: usize,
    pub failed: bool,
}

/// Everything accumulated over one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub sources: Vec<SourceCount>,
    pub raw_records: usize,
    pub unidentified_records: usize,
    pub combined_records: usize,
    pub eligible_records: usize,
    pub withheld_records: usize,
    pub warnings: Vec<ReconciliationWarning>,
    pub extraction_errors: Vec<ExtractionError>,
    pub identity_errors: Vec<IdentityAssignmentError>,
    pub policy_error: Option<PublicationPolicyError>,
    pub publish: Option<PublishOutcome>,
    pub publish_error: Option<PublishError>,
    pub identity: IdentityStats,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            started_at,
            duration_ms: 0,
            dry_run,
            sources: Vec::new(),
            raw_records: 0,
            unidentified_records: 0,
            combined_records: 0,
            eligible_records: 0,
            withheld_records: 0,
            warnings: Vec::new(),
            extraction_errors: Vec::new(),
            identity_errors: Vec::new(),
            policy_error: None,
            publish: None,
            publish_error: None,
            identity: IdentityStats::default(),
        }
    }

    /// Identity errors and warnings are reported but never fail the run.
    pub fn succeeded(&self) -> bool {
        self.exit_code() == EXIT_OK
    }

    pub fn exit_code(&self) -> u8 {
        if self.publish_error.is_some() || self.policy_error.is_some() {
            EXIT_PUBLISH
        } else if !self.extraction_errors.is_empty() {
            EXIT_EXTRACTION
        } else {
            EXIT_OK
        }
    }

    /// The alias may be held by zero or several generations.
    pub fn needs_attention(&self) -> bool {
        matches!(self.publish_error, Some(PublishError::AliasInconsistent { .. }))
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let status = if self.succeeded() { "succeeded" } else { "FAILED" };
        let _ = writeln!(
            out,
            "kira-repo run {status} in {}",
            format_duration(Duration::from_millis(self.duration_ms))
        );
        if self.needs_attention() {
            let _ = writeln!(out, "ALERT: public alias state needs manual attention");
        }
        for source in &self.sources {
            let marker = if source.failed { " (failed)" } else { "" };
            let _ = writeln!(out, "  {:<20} {:>8} records{marker}", source.code, source.records);
        }
        let _ = writeln!(
            out,
            "records: {} raw, {} combined, {} eligible, {} withheld, {} without id",
            self.raw_records,
            self.combined_records,
            self.eligible_records,
            self.withheld_records,
            self.unidentified_records
        );
        let _ = writeln!(
            out,
            "identity: {} lookups, {} created, {} cache hits",
            self.identity.lookups, self.identity.creations, self.identity.cache_hits
        );
        if let Some(publish) = &self.publish {
            let _ = writeln!(
                out,
                "generation {}: {} files, {} donors, pruned {}",
                publish.generation,
                publish.documents.file,
                publish.documents.donor_text,
                publish.prune.deleted.len()
            );
            for warning in &publish.warnings {
                let _ = writeln!(out, "  publish warning: {warning}");
            }
            for failure in &publish.prune.failures {
                let _ = writeln!(out, "  prune warning: {failure}");
            }
        }
        if !self.warnings.is_empty() {
            let _ = writeln!(out, "reconciliation warnings: {}", self.warnings.len());
            for warning in self.warnings.iter().take(20) {
                let _ = writeln!(
                    out,
                    "  {} {}: {}",
                    warning.id.as_deref().unwrap_or("?"),
                    warning.field,
                    warning.values.join(" | ")
                );
            }
        }
        for err in &self.extraction_errors {
            let _ = writeln!(out, "error: {err}");
        }
        for err in &self.identity_errors {
            let _ = writeln!(out, "identity: {err}");
        }
        if let Some(err) = &self.policy_error {
            let _ = writeln!(out, "error: {err}");
        }
        if let Some(err) = &self.publish_error {
            let _ = writeln!(out, "error: {err}");
        }
        out
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

/// Side channel for the run summary.
pub trait Notifier: Send + Sync {
    fn notify(&self, report: &RunReport) -> Result<(), KiraError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, report: &RunReport) -> Result<(), KiraError> {
        let summary = report.summary();
        if report.succeeded() {
            info!(target: "kira_repo::summary", "{summary}");
        } else {
            warn!(target: "kira_repo::summary", "{summary}");
        }
        Ok(())
    }
}

/// Posts `{ "text": <summary>, "report": <report> }` to a webhook.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self, KiraError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| KiraError::Notify(err.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, report: &RunReport) -> Result<(), KiraError> {
        let body = json!({ "text": report.summary(), "report": report });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|err| KiraError::Notify(err.to_string()))?;
        if !response.status().is_success() {
            return Err(KiraError::Notify(format!(
                "webhook returned status {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

/// Delivers to every notifier; one failing does not stop the others.
pub struct Notifiers(pub Vec<Box<dyn Notifier>>);

impl Notifier for Notifiers {
    fn notify(&self, report: &RunReport) -> Result<(), KiraError> {
        let mut first_error = None;
        for notifier in &self.0 {
            if let Err(err) = notifier.notify(report) {
                warn!(error = %err, "notifier failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Writes the report as pretty JSON, replacing `dest` atomically.
pub fn write_report(report: &RunReport, dest: &Utf8Path) -> Result<(), KiraError> {
    let parent = dest
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let json = serde_json::to_vec_pretty(report)
        .map_err(|err| KiraError::Serialization(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix("kira-repo-report")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.write_all(&json)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.persist(dest.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(())
}
