use std::collections::BTreeMap;

use crate::domain::ProvenanceClass;
use crate::error::PublicationPolicyError;
use crate::record::FileRecord;

/// Maps archives to provenance classes and names the harmonization study tag.
#[derive(Debug, Clone)]
pub struct ProvenancePolicy {
    harmonized_study: String,
    repositories: BTreeMap<String, ProvenanceClass>,
}

impl ProvenancePolicy {
    pub fn new(
        harmonized_study: impl Into<String>,
        repositories: BTreeMap<String, ProvenanceClass>,
    ) -> Self {
        Self {
            harmonized_study: harmonized_study.into(),
            repositories,
        }
    }

    pub fn harmonized_study(&self) -> &str {
        &self.harmonized_study
    }

    /// Archives missing from the mapping are `Unclassified`.
    pub fn class_of(&self, repo_code: &str) -> ProvenanceClass {
        self.repositories
            .get(repo_code)
            .copied()
            .unwrap_or(ProvenanceClass::Unclassified)
    }

    pub fn classes<'a>(&'a self, record: &'a FileRecord) -> impl Iterator<Item = ProvenanceClass> + 'a {
        record.repo_codes().map(|code| self.class_of(code))
    }

    pub fn is_harmonized(&self, record: &FileRecord) -> bool {
        record.study.iter().any(|study| study == &self.harmonized_study)
            || self
                .classes(record)
                .any(|class| class == ProvenanceClass::Harmonized)
    }

    /// Completeness rank of a raw record; lower is more complete.
    pub fn rank(&self, record: &FileRecord) -> u8 {
        if self.is_harmonized(record) {
            return ProvenanceClass::Harmonized.priority();
        }
        self.classes(record)
            .map(ProvenanceClass::priority)
            .min()
            .unwrap_or_else(|| ProvenanceClass::Unclassified.priority())
    }
}

#[derive(Debug, Clone)]
pub struct PublicationFilter {
    policy: ProvenancePolicy,
}

impl PublicationFilter {
    pub fn new(policy: ProvenancePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ProvenancePolicy {
        &self.policy
    }

    /// Released anywhere wins over a pre-release mirror; unclassified archives publish.
    pub fn is_eligible(&self, record: &FileRecord) -> bool {
        let mut mirrored = false;
        for class in self.policy.classes(record) {
            if class.is_formally_released() {
                return true;
            }
            mirrored |= class == ProvenanceClass::PreRelease;
        }
        !mirrored
    }

    /// Like [`is_eligible`](Self::is_eligible), but rejects copies with no archive.
    /// Extraction drops such records, so reaching this error means a stage upstream is broken.
    pub fn evaluate(&self, record: &FileRecord) -> Result<bool, PublicationPolicyError> {
        if let Some(idx) = record.unattributed_copy() {
            return Err(PublicationPolicyError {
                record_id: record.id.clone().unwrap_or_default(),
                message: format!("file copy {idx} has no archive code"),
            });
        }
        Ok(self.is_eligible(record))
    }

    /// Splits records into publishable ones and the number withheld.
    pub fn partition(
        &self,
        records: Vec<FileRecord>,
    ) -> Result<(Vec<FileRecord>, usize), PublicationPolicyError> {
        let mut eligible = Vec::with_capacity(records.len());
        let mut withheld = 0usize;
        for record in records {
            if self.evaluate(&record)? {
                eligible.push(record);
            } else {
                withheld += 1;
            }
        }
        Ok((eligible, withheld))
    }
}
