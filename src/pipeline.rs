use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::combine::{RecordCombiner, group_by_id};
use crate::error::ExtractionError;
use crate::filter::PublicationFilter;
use crate::identity::IdentityResolver;
use crate::idservice::{DonorRegistry, IdentityService};
use crate::publish::IndexPublisher;
use crate::record::FileRecord;
use crate::report::{Notifier, RunReport, SourceCount};
use crate::search::IndexClient;
use crate::source::{Archive, SourceFetcher};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Restrict extraction to these archive codes; empty means all.
    pub only: Vec<String>,
    pub dry_run: bool,
}

/// Sequences extract, link, combine, filter and publish for one run.
pub struct Pipeline<'a, F, S, D, C>
where
    F: SourceFetcher,
    S: IdentityService,
    D: DonorRegistry,
    C: IndexClient,
{
    fetcher: &'a F,
    resolver: &'a IdentityResolver<S, D>,
    combiner: RecordCombiner,
    filter: PublicationFilter,
    publisher: IndexPublisher<'a, C>,
    notifier: &'a dyn Notifier,
}

impl<'a, F, S, D, C> Pipeline<'a, F, S, D, C>
where
    F: SourceFetcher,
    S: IdentityService,
    D: DonorRegistry,
    C: IndexClient,
{
    pub fn new(
        fetcher: &'a F,
        resolver: &'a IdentityResolver<S, D>,
        filter: PublicationFilter,
        publisher: IndexPublisher<'a, C>,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            fetcher,
            resolver,
            combiner: RecordCombiner::new(filter.policy().clone()),
            filter,
            publisher,
            notifier,
        }
    }

    /// Runs to completion and returns the report; failures are recorded in it, not raised.
    pub fn run(
        &self,
        archives: &[Archive],
        options: &RunOptions,
        sink: &dyn ProgressSink,
    ) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new(Utc::now(), options.dry_run);

        let raw = self.extract(archives, options, &mut report, started, sink);
        report.raw_records = raw.len();

        let linked = self.link(raw, &mut report, started, sink);

        let (groups, unidentified) = group_by_id(linked);
        report.unidentified_records += unidentified.len();
        if !unidentified.is_empty() {
            warn!(count = unidentified.len(), "records without id dropped");
        }

        emit(sink, started, format!("phase=Combine; groups={}", groups.len()));
        let mut combined = Vec::with_capacity(groups.len());
        for group in &groups {
            let result = self.combiner.combine(group);
            for warning in &result.warnings {
                warn!(id = ?warning.id, field = warning.field, values = ?warning.values, "conflicting values");
            }
            report.warnings.extend(result.warnings);
            combined.push(result.record);
        }
        report.combined_records = combined.len();

        emit(sink, started, "phase=Filter".to_string());
        match self.filter.partition(combined) {
            Ok((eligible, withheld)) => {
                report.eligible_records = eligible.len();
                report.withheld_records = withheld;
                self.publish(&eligible, &mut report, started, sink);
            }
            Err(err) => {
                warn!(error = %err, "publication policy failed; nothing published");
                report.policy_error = Some(err);
            }
        }

        report.identity = self.resolver.stats();
        report.duration_ms = started.elapsed().as_millis() as u64;
        emit(sink, started, format!("phase=Done; exit_code={}", report.exit_code()));
        info!(exit_code = report.exit_code(), duration_ms = report.duration_ms, "run finished");

        if let Err(err) = self.notifier.notify(&report) {
            warn!(error = %err, "run summary could not be delivered");
        }
        report
    }

    fn extract(
        &self,
        archives: &[Archive],
        options: &RunOptions,
        report: &mut RunReport,
        started: Instant,
        sink: &dyn ProgressSink,
    ) -> Vec<FileRecord> {
        let mut records = Vec::new();
        for archive in archives {
            if !options.only.is_empty() && !options.only.contains(&archive.code) {
                continue;
            }
            emit(
                sink,
                started,
                format!("phase=Extract; source={}; location={}", archive.code, archive.location),
            );
            let mapped = self
                .fetcher
                .fetch(&archive.location)
                .and_then(|raw| archive.processor.map_to_records(&raw));
            match mapped {
                Ok(mapped) => {
                    let mapped = drop_unattributed(&archive.code, mapped, report);
                    info!(source = %archive.code, records = mapped.len(), "extracted");
                    report.sources.push(SourceCount {
                        code: archive.code.clone(),
                        records: mapped.len(),
                        failed: false,
                    });
                    records.extend(mapped);
                }
                Err(err) => {
                    warn!(source = %archive.code, error = %err, "extraction failed");
                    report.sources.push(SourceCount {
                        code: archive.code.clone(),
                        records: 0,
                        failed: true,
                    });
                    report.extraction_errors.push(ExtractionError {
                        source_code: archive.code.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        records
    }

    fn link(
        &self,
        raw: Vec<FileRecord>,
        report: &mut RunReport,
        started: Instant,
        sink: &dyn ProgressSink,
    ) -> Vec<FileRecord> {
        emit(sink, started, format!("phase=Link; records={}", raw.len()));
        let mut linked = Vec::with_capacity(raw.len());
        for record in raw {
            let (record, errors) = self.resolver.link_donors(record);
            report.identity_errors.extend(errors);
            match self.resolver.assign_file_id(record) {
                Ok(record) => linked.push(record),
                Err(err) => {
                    warn!(error = %err, "file id assignment failed");
                    report.identity_errors.push(err);
                    report.unidentified_records += 1;
                }
            }
        }
        linked
    }

    fn publish(
        &self,
        eligible: &[FileRecord],
        report: &mut RunReport,
        started: Instant,
        sink: &dyn ProgressSink,
    ) {
        emit(
            sink,
            started,
            format!("phase=Publish; alias={}; records={}", self.publisher.alias(), eligible.len()),
        );
        match self.publisher.publish(eligible, self.resolver) {
            Ok(outcome) => {
                emit(sink, started, format!("phase=Publish; generation={}", outcome.generation));
                report.publish = Some(outcome);
            }
            Err(err) => {
                warn!(error = %err, "publish failed");
                report.publish_error = Some(err);
            }
        }
    }
}

/// Records whose copies do not all name an archive are rejected for their archive alone.
fn drop_unattributed(
    code: &str,
    records: Vec<FileRecord>,
    report: &mut RunReport,
) -> Vec<FileRecord> {
    let mut kept = Vec::with_capacity(records.len());
    for record in records {
        match record.unattributed_copy() {
            None => kept.push(record),
            Some(idx) => {
                let id = record.id.as_deref().unwrap_or("?");
                warn!(source = code, id, copy = idx, "record dropped: file copy has no archive code");
                report.extraction_errors.push(ExtractionError {
                    source_code: code.to_string(),
                    message: format!("record {id}: file copy {idx} has no archive code"),
                });
            }
        }
    }
    kept
}

fn emit(sink: &dyn ProgressSink, started: Instant, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: Some(started.elapsed()),
    });
}
