use serde::{Deserialize, Serialize};

use crate::domain::Access;

/// A file-metadata record. Raw per-archive records and reconciled records share this shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub study: Vec<String>,
    #[serde(default)]
    pub access: Option<Access>,
    #[serde(default)]
    pub data_bundle: Option<DataBundle>,
    #[serde(default)]
    pub analysis_method: Option<AnalysisMethod>,
    #[serde(default)]
    pub data_categorization: Option<DataCategorization>,
    #[serde(default)]
    pub reference_genome: Option<ReferenceGenome>,
    #[serde(default)]
    pub file_copies: Vec<FileCopy>,
    #[serde(default)]
    pub donors: Vec<Donor>,
}

impl FileRecord {
    pub fn builder() -> FileRecordBuilder {
        FileRecordBuilder::default()
    }

    /// Project of the first donor, used when minting a file id.
    pub fn project_code(&self) -> Option<&str> {
        self.donors
            .iter()
            .find_map(|donor| donor.project_code.as_deref())
    }

    pub fn repo_codes(&self) -> impl Iterator<Item = &str> {
        self.file_copies
            .iter()
            .filter_map(|copy| copy.repo_code.as_deref())
    }

    /// Index of the first copy that names no archive.
    pub fn unattributed_copy(&self) -> Option<usize> {
        self.file_copies
            .iter()
            .position(|copy| copy.repo_code.as_deref().is_none_or(str::is_empty))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataBundle {
    pub data_bundle_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AnalysisMethod {
    #[serde(default)]
    pub analysis_type: Option<String>,
    #[serde(default)]
    pub software: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DataCategorization {
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub experimental_strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ReferenceGenome {
    #[serde(default)]
    pub genome_build: Option<String>,
    #[serde(default)]
    pub reference_name: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
}

/// One physical location of a logical file, held by exactly one archive.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileCopy {
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_format: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_md5sum: Option<String>,
    /// Seconds since the epoch.
    #[serde(default)]
    pub last_modified: Option<i64>,
    #[serde(default)]
    pub index_file: Option<IndexFile>,
    #[serde(default)]
    pub repo_type: Option<String>,
    #[serde(default)]
    pub repo_org: Option<String>,
    #[serde(default)]
    pub repo_name: Option<String>,
    #[serde(default)]
    pub repo_code: Option<String>,
    #[serde(default)]
    pub repo_country: Option<String>,
    #[serde(default)]
    pub repo_base_url: Option<String>,
    #[serde(default)]
    pub repo_data_path: Option<String>,
    #[serde(default)]
    pub repo_metadata_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_format: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_md5sum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Donor {
    #[serde(default)]
    pub project_code: Option<String>,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub study: Option<String>,
    #[serde(default)]
    pub primary_site: Option<String>,
    #[serde(default)]
    pub donor_id: Option<String>,
    #[serde(default)]
    pub specimen_id: Vec<String>,
    #[serde(default)]
    pub specimen_type: Vec<String>,
    #[serde(default)]
    pub sample_id: Vec<String>,
    #[serde(default)]
    pub submitted_donor_id: Option<String>,
    #[serde(default)]
    pub submitted_specimen_id: Vec<String>,
    #[serde(default)]
    pub submitted_sample_id: Vec<String>,
    #[serde(default)]
    pub other_identifiers: OtherIdentifiers,
}

impl Donor {
    pub fn key(&self) -> Option<DonorKey> {
        if let Some(id) = self.donor_id.as_deref().filter(|id| !id.is_empty()) {
            return Some(DonorKey::Resolved(id.to_string()));
        }
        self.submitted_donor_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(|id| DonorKey::Submitted(id.to_string()))
    }

    /// Equal resolved ids, or equal submitted ids when either side is unresolved.
    pub fn same_donor(&self, other: &Donor) -> bool {
        match (self.donor_id.as_deref(), other.donor_id.as_deref()) {
            (Some(left), Some(right)) => left == right,
            _ => matches!(
                (self.submitted_donor_id.as_deref(), other.submitted_donor_id.as_deref()),
                (Some(left), Some(right)) if left == right
            ),
        }
    }

    pub fn is_linked(&self) -> bool {
        self.donor_id.is_some()
            && self.specimen_id.len() >= self.submitted_specimen_id.len()
            && self.sample_id.len() >= self.submitted_sample_id.len()
    }
}

/// Identity used to deduplicate donors: resolved id when present, else submitted id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DonorKey {
    Resolved(String),
    Submitted(String),
}

/// Cross-system identifier variants (legacy barcodes).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OtherIdentifiers {
    #[serde(default)]
    pub tcga_participant_barcode: Vec<String>,
    #[serde(default)]
    pub tcga_sample_barcode: Vec<String>,
    #[serde(default)]
    pub tcga_aliquot_barcode: Vec<String>,
}

/// Accumulates fields and produces a finished record in one step.
#[derive(Debug, Clone, Default)]
pub struct FileRecordBuilder {
    record: FileRecord,
}

impl FileRecordBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.record.id = Some(id.into());
        self
    }

    pub fn object_id(mut self, object_id: impl Into<String>) -> Self {
        self.record.object_id = Some(object_id.into());
        self
    }

    pub fn study(mut self, study: impl Into<String>) -> Self {
        self.record.study.push(study.into());
        self
    }

    pub fn access(mut self, access: Access) -> Self {
        self.record.access = Some(access);
        self
    }

    pub fn data_bundle(mut self, data_bundle_id: impl Into<String>) -> Self {
        self.record.data_bundle = Some(DataBundle {
            data_bundle_id: data_bundle_id.into(),
        });
        self
    }

    pub fn analysis_method(mut self, method: AnalysisMethod) -> Self {
        self.record.analysis_method = Some(method);
        self
    }

    pub fn data_categorization(mut self, categorization: DataCategorization) -> Self {
        self.record.data_categorization = Some(categorization);
        self
    }

    pub fn reference_genome(mut self, genome: ReferenceGenome) -> Self {
        self.record.reference_genome = Some(genome);
        self
    }

    pub fn file_copy(mut self, copy: FileCopy) -> Self {
        self.record.file_copies.push(copy);
        self
    }

    pub fn donor(mut self, donor: Donor) -> Self {
        self.record.donors.push(donor);
        self
    }

    pub fn build(self) -> FileRecord {
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn donor_key_prefers_resolved_id() {
        let donor = Donor {
            donor_id: Some("DO1".to_string()),
            submitted_donor_id: Some("sub-1".to_string()),
            ..Donor::default()
        };
        assert_eq!(donor.key(), Some(DonorKey::Resolved("DO1".to_string())));

        let unresolved = Donor {
            submitted_donor_id: Some("sub-1".to_string()),
            ..Donor::default()
        };
        assert_eq!(
            unresolved.key(),
            Some(DonorKey::Submitted("sub-1".to_string()))
        );
        assert_eq!(Donor::default().key(), None);
    }

    #[test]
    fn record_uses_canonical_field_names() {
        let record = FileRecord::builder()
            .id("FI1")
            .data_bundle("bundle-1")
            .file_copy(FileCopy {
                repo_code: Some("collab".to_string()),
                ..FileCopy::default()
            })
            .build();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["data_bundle"]["data_bundle_id"], "bundle-1");
        assert_eq!(json["file_copies"][0]["repo_code"], "collab");
        assert!(json["donors"].as_array().unwrap().is_empty());
    }
}
