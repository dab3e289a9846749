use std::time::Instant;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::IndexSettings;
use crate::documents::{DonorDirectory, DonorTextAggregator, FileTextDocument, file_document};
use crate::domain::GenerationName;
use crate::error::{KiraError, PublishError};
use crate::record::FileRecord;
use crate::schema::{self, DOC_TYPES, DONOR_TEXT_TYPE, FILE_TEXT_TYPE, FILE_TYPE};
use crate::search::{BulkSink, IndexClient};

/// Lifecycle of one generation within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Absent,
    Created,
    Populated,
    Aliased,
    Pruned,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ViewCounts {
    pub file: usize,
    pub file_text: usize,
    pub donor_text: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneOutcome {
    pub deleted: Vec<String>,
    pub kept: Vec<String>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub generation: String,
    pub state: GenerationState,
    pub documents: ViewCounts,
    pub previous_holders: Vec<String>,
    /// Non-fatal problems met while building the views.
    pub warnings: Vec<String>,
    pub prune: PruneOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationInfo {
    pub name: String,
    pub timestamp: NaiveDateTime,
    pub aliased: bool,
}

/// Builds a generation, populates it, moves the alias onto it and prunes old ones.
pub struct IndexPublisher<'a, C: IndexClient> {
    client: &'a C,
    settings: IndexSettings,
}

impl<'a, C: IndexClient> IndexPublisher<'a, C> {
    pub fn new(client: &'a C, settings: IndexSettings) -> Self {
        Self { client, settings }
    }

    pub fn alias(&self) -> &str {
        &self.settings.alias
    }

    pub fn publish(
        &self,
        records: &[FileRecord],
        directory: &dyn DonorDirectory,
    ) -> Result<PublishOutcome, PublishError> {
        self.publish_at(records, directory, Utc::now())
    }

    /// A failure before the alias step leaves the serving generation untouched.
    pub fn publish_at(
        &self,
        records: &[FileRecord],
        directory: &dyn DonorDirectory,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome, PublishError> {
        let started = Instant::now();
        let generation = GenerationName::new(&self.settings.alias, now).to_string();
        let mut state = GenerationState::Absent;
        info!(%generation, records = records.len(), "publishing generation");

        self.create(&generation)?;
        state = advance(&generation, state, GenerationState::Created);

        let (documents, warnings) = self.populate(&generation, records, directory)?;
        state = advance(&generation, state, GenerationState::Populated);

        let previous_holders = self.swap_alias(&generation)?;
        state = advance(&generation, state, GenerationState::Aliased);

        let prune = self.prune_keeping(self.settings.retain, &[generation.clone()]);
        state = advance(&generation, state, GenerationState::Pruned);

        Ok(PublishOutcome {
            generation,
            state,
            documents,
            previous_holders,
            warnings,
            prune,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Generations following the naming convention, newest first.
    pub fn list_generations(&self) -> Result<Vec<GenerationInfo>, KiraError> {
        let holders = self.client.alias_holders(&self.settings.alias)?;
        let mut generations = self
            .client
            .list_names()?
            .into_iter()
            .filter_map(|name| GenerationName::parse(&self.settings.alias, &name).ok())
            .map(|parsed| {
                let name = parsed.to_string();
                GenerationInfo {
                    aliased: holders.contains(&name),
                    timestamp: parsed.timestamp(),
                    name,
                }
            })
            .collect::<Vec<_>>();
        generations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.name.cmp(&a.name)));
        Ok(generations)
    }

    /// Standalone prune; whatever currently holds the alias is never deleted.
    pub fn prune_only(&self, retain: usize) -> Result<PruneOutcome, KiraError> {
        if retain == 0 {
            return Err(KiraError::InvalidConfig(
                "prune must keep at least one generation".to_string(),
            ));
        }
        let holders = self.client.alias_holders(&self.settings.alias)?;
        Ok(self.prune_keeping(retain, &holders))
    }

    fn create(&self, generation: &str) -> Result<(), PublishError> {
        let create_error = |err: KiraError| PublishError::Create {
            generation: generation.to_string(),
            message: err.to_string(),
        };
        if self.client.exists(generation).map_err(create_error)? {
            let holders = self
                .client
                .alias_holders(&self.settings.alias)
                .map_err(create_error)?;
            if holders.iter().any(|holder| holder == generation) {
                return Err(PublishError::Create {
                    generation: generation.to_string(),
                    message: format!("{generation} is serving alias {}", self.settings.alias),
                });
            }
            warn!(%generation, "generation already exists; recreating");
            self.client.delete(generation).map_err(create_error)?;
        }
        self.client
            .create(generation, &schema::settings())
            .map_err(create_error)?;

        for doc_type in DOC_TYPES {
            let schema_error = |message: String| PublishError::Schema {
                generation: generation.to_string(),
                doc_type: doc_type.to_string(),
                message,
            };
            let schema = schema::schema(doc_type)
                .ok_or_else(|| schema_error("no schema defined".to_string()))?;
            self.client
                .put_schema(generation, doc_type, &schema)
                .map_err(|err| schema_error(err.to_string()))?;
        }
        Ok(())
    }

    fn populate(
        &self,
        generation: &str,
        records: &[FileRecord],
        directory: &dyn DonorDirectory,
    ) -> Result<(ViewCounts, Vec<String>), PublishError> {
        let bulk_error = |err: KiraError| PublishError::Bulk {
            generation: generation.to_string(),
            message: err.to_string(),
        };
        let documents_error = |message: String| PublishError::Documents {
            generation: generation.to_string(),
            message,
        };

        let mut counts = ViewCounts::default();
        let mut sink = BulkSink::new(
            self.client,
            generation,
            self.settings.bulk_actions,
            self.settings.bulk_bytes,
        );
        let mut donors = DonorTextAggregator::new();

        for record in records {
            let id = record
                .id
                .as_deref()
                .filter(|id| !id.is_empty())
                .ok_or_else(|| documents_error("record without id".to_string()))?;

            let primary = file_document(record).map_err(|err| documents_error(err.to_string()))?;
            sink.add(FILE_TYPE, id, primary).map_err(bulk_error)?;
            counts.file += 1;

            let text = serde_json::to_value(FileTextDocument::from_record(id, record))
                .map_err(|err| documents_error(err.to_string()))?;
            sink.add(FILE_TEXT_TYPE, id, text).map_err(bulk_error)?;
            counts.file_text += 1;

            donors.observe(record);
        }

        let batch = donors.finish(directory);
        let warnings = batch
            .membership_errors
            .iter()
            .map(|err| format!("donor membership flags unset: {err}"))
            .collect::<Vec<_>>();
        for doc in batch.documents {
            let id = doc.id.clone();
            let value =
                serde_json::to_value(doc).map_err(|err| documents_error(err.to_string()))?;
            sink.add(DONOR_TEXT_TYPE, &id, value).map_err(bulk_error)?;
            counts.donor_text += 1;
        }

        let stats = sink.finish().map_err(bulk_error)?;
        debug!(%generation, batches = stats.batches, documents = stats.documents, "bulk load finished");
        Ok((counts, warnings))
    }

    /// Moves the alias in one request, then verifies only the new generation holds it.
    fn swap_alias(&self, generation: &str) -> Result<Vec<String>, PublishError> {
        let alias = &self.settings.alias;
        let alias_error = |message: String| PublishError::Alias {
            alias: alias.clone(),
            generation: generation.to_string(),
            message,
        };

        let previous = self
            .client
            .alias_holders(alias)
            .map_err(|err| alias_error(err.to_string()))?;
        let old = previous
            .iter()
            .filter(|name| name.as_str() != generation)
            .cloned()
            .collect::<Vec<_>>();

        let reassigned = self.client.reassign_alias(alias, &old, generation);
        let mut holders = self
            .client
            .alias_holders(alias)
            .map_err(|err| alias_error(format!("cannot read back alias: {err}")))?;
        holders.sort();

        if holders == [generation] {
            if let Err(err) = reassigned {
                warn!(%alias, %generation, error = %err, "alias request reported failure but alias is in place");
            }
            info!(%alias, %generation, previous = ?old, "alias moved");
            return Ok(previous);
        }

        let mut before = previous;
        before.sort();
        match reassigned {
            Err(err) if holders == before => Err(alias_error(err.to_string())),
            _ => {
                error!(%alias, %generation, ?holders, "alias left inconsistent");
                Err(PublishError::AliasInconsistent {
                    alias: alias.clone(),
                    generation: generation.to_string(),
                    holders,
                })
            }
        }
    }

    /// Keeps `retain` generations in total: every protected one, then the newest others.
    /// Failures are collected, never raised.
    fn prune_keeping(&self, retain: usize, protected: &[String]) -> PruneOutcome {
        let mut outcome = PruneOutcome::default();
        let generations = match self.list_generations() {
            Ok(generations) => generations,
            Err(err) => {
                warn!(error = %err, "cannot list generations for pruning");
                outcome.failures.push(err.to_string());
                return outcome;
            }
        };
        let protected_present = generations
            .iter()
            .filter(|generation| protected.contains(&generation.name))
            .count();
        let mut slots = retain.saturating_sub(protected_present);
        for generation in generations {
            if protected.contains(&generation.name) {
                outcome.kept.push(generation.name);
                continue;
            }
            if slots > 0 {
                slots -= 1;
                outcome.kept.push(generation.name);
                continue;
            }
            match self.client.delete(&generation.name) {
                Ok(()) => {
                    info!(generation = %generation.name, "pruned generation");
                    outcome.deleted.push(generation.name);
                }
                Err(err) => {
                    warn!(generation = %generation.name, error = %err, "prune failed");
                    outcome.failures.push(format!("{}: {err}", generation.name));
                }
            }
        }
        outcome
    }
}

fn advance(generation: &str, from: GenerationState, to: GenerationState) -> GenerationState {
    debug!(%generation, ?from, ?to, "generation state");
    to
}
