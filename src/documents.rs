use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::domain::ResolveMode;
use crate::error::KiraError;
use crate::idservice::{DonorRegistry, IdentityService};
use crate::identity::IdentityResolver;
use crate::record::{Donor, FileRecord};

/// What the donor-aggregate view needs from identity resolution.
pub trait DonorDirectory {
    /// True when the project submits legacy barcodes that must be translated.
    fn translates(&self, project_code: &str) -> bool;
    fn translate(&self, submitted_id: &str) -> Option<String>;
    fn harmonized_donors(&self) -> Result<&HashSet<String>, KiraError>;
    fn registered_donors(&self) -> Result<&HashSet<String>, KiraError>;
}

impl<S: IdentityService, D: DonorRegistry> DonorDirectory for IdentityResolver<S, D> {
    fn translates(&self, project_code: &str) -> bool {
        self.mode_for(project_code) == ResolveMode::TranslateBarcode
    }

    fn translate(&self, submitted_id: &str) -> Option<String> {
        IdentityResolver::translate(self, submitted_id)
    }

    fn harmonized_donors(&self) -> Result<&HashSet<String>, KiraError> {
        IdentityResolver::harmonized_donors(self)
    }

    fn registered_donors(&self) -> Result<&HashSet<String>, KiraError> {
        IdentityResolver::registered_donors(self)
    }
}

pub fn file_document(record: &FileRecord) -> Result<Value, KiraError> {
    serde_json::to_value(record).map_err(|err| KiraError::Serialization(err.to_string()))
}

/// Flattened leaf fields of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileTextDocument {
    pub id: String,
    pub object_id: Option<String>,
    pub file_name: Vec<String>,
    pub data_bundle_id: Option<String>,
    pub donor_id: Vec<String>,
    pub project_code: Vec<String>,
    pub data_type: Option<String>,
}

impl FileTextDocument {
    pub fn from_record(id: &str, record: &FileRecord) -> Self {
        Self {
            id: id.to_string(),
            object_id: record.object_id.clone(),
            file_name: distinct(
                record
                    .file_copies
                    .iter()
                    .filter_map(|copy| copy.file_name.as_deref()),
            ),
            data_bundle_id: record
                .data_bundle
                .as_ref()
                .map(|bundle| bundle.data_bundle_id.clone()),
            donor_id: distinct(record.donors.iter().filter_map(|d| d.donor_id.as_deref())),
            project_code: distinct(
                record
                    .donors
                    .iter()
                    .filter_map(|d| d.project_code.as_deref()),
            ),
            data_type: record
                .data_categorization
                .as_ref()
                .and_then(|categorization| categorization.data_type.clone()),
        }
    }
}

/// All identifier variants observed for one donor across every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DonorTextDocument {
    pub id: String,
    pub project_code: Vec<String>,
    pub specimen_id: Vec<String>,
    pub sample_id: Vec<String>,
    pub submitted_donor_id: Vec<String>,
    pub submitted_specimen_id: Vec<String>,
    pub submitted_sample_id: Vec<String>,
    pub tcga_participant_barcode: Vec<String>,
    pub tcga_sample_barcode: Vec<String>,
    pub tcga_aliquot_barcode: Vec<String>,
    pub translated_id: Vec<String>,
    /// Unset when the membership set could not be fetched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_harmonized_study: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered: Option<bool>,
}

#[derive(Debug)]
pub struct DonorTextBatch {
    pub documents: Vec<DonorTextDocument>,
    /// Membership sets that could not be fetched; their flags are left unset.
    pub membership_errors: Vec<KiraError>,
}

#[derive(Debug, Default)]
struct DonorVariants {
    project_code: BTreeSet<String>,
    specimen_id: BTreeSet<String>,
    sample_id: BTreeSet<String>,
    submitted_donor_id: BTreeSet<String>,
    submitted_specimen_id: BTreeSet<String>,
    submitted_sample_id: BTreeSet<String>,
    tcga_participant_barcode: BTreeSet<String>,
    tcga_sample_barcode: BTreeSet<String>,
    tcga_aliquot_barcode: BTreeSet<String>,
}

impl DonorVariants {
    fn observe(&mut self, donor: &Donor) {
        self.project_code.extend(donor.project_code.iter().cloned());
        self.specimen_id.extend(donor.specimen_id.iter().cloned());
        self.sample_id.extend(donor.sample_id.iter().cloned());
        self.submitted_donor_id
            .extend(donor.submitted_donor_id.iter().cloned());
        self.submitted_specimen_id
            .extend(donor.submitted_specimen_id.iter().cloned());
        self.submitted_sample_id
            .extend(donor.submitted_sample_id.iter().cloned());
        let other = &donor.other_identifiers;
        self.tcga_participant_barcode
            .extend(other.tcga_participant_barcode.iter().cloned());
        self.tcga_sample_barcode
            .extend(other.tcga_sample_barcode.iter().cloned());
        self.tcga_aliquot_barcode
            .extend(other.tcga_aliquot_barcode.iter().cloned());
    }
}

/// Two-pass donor aggregation: `observe` every record, then `finish` once.
#[derive(Debug, Default)]
pub struct DonorTextAggregator {
    donors: BTreeMap<String, DonorVariants>,
}

impl DonorTextAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Donors without a resolved id are not aggregated.
    pub fn observe(&mut self, record: &FileRecord) {
        for donor in &record.donors {
            let Some(id) = donor.donor_id.as_deref().filter(|id| !id.is_empty()) else {
                continue;
            };
            self.donors.entry(id.to_string()).or_default().observe(donor);
        }
    }

    pub fn len(&self) -> usize {
        self.donors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.donors.is_empty()
    }

    /// One document per donor id, in id order.
    pub fn finish(self, directory: &dyn DonorDirectory) -> DonorTextBatch {
        let mut membership_errors = Vec::new();
        let harmonized = directory
            .harmonized_donors()
            .map_err(|err| {
                warn!(error = %err, "harmonized donor set unavailable");
                membership_errors.push(err);
            })
            .ok();
        let registered = directory
            .registered_donors()
            .map_err(|err| {
                warn!(error = %err, "registered donor set unavailable");
                membership_errors.push(err);
            })
            .ok();
        let documents = self
            .donors
            .into_iter()
            .map(|(id, variants)| {
                let translated_id = if variants
                    .project_code
                    .iter()
                    .any(|project| directory.translates(project))
                {
                    variants
                        .submitted_donor_id
                        .iter()
                        .chain(&variants.submitted_specimen_id)
                        .chain(&variants.submitted_sample_id)
                        .filter_map(|submitted| directory.translate(submitted))
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect()
                } else {
                    Vec::new()
                };
                DonorTextDocument {
                    in_harmonized_study: harmonized
                        .map(|set| member(set, &variants.submitted_donor_id)),
                    registered: registered.map(|set| member(set, &variants.submitted_donor_id)),
                    id,
                    project_code: variants.project_code.into_iter().collect(),
                    specimen_id: variants.specimen_id.into_iter().collect(),
                    sample_id: variants.sample_id.into_iter().collect(),
                    submitted_donor_id: variants.submitted_donor_id.into_iter().collect(),
                    submitted_specimen_id: variants.submitted_specimen_id.into_iter().collect(),
                    submitted_sample_id: variants.submitted_sample_id.into_iter().collect(),
                    tcga_participant_barcode: variants
                        .tcga_participant_barcode
                        .into_iter()
                        .collect(),
                    tcga_sample_barcode: variants.tcga_sample_barcode.into_iter().collect(),
                    tcga_aliquot_barcode: variants.tcga_aliquot_barcode.into_iter().collect(),
                    translated_id,
                }
            })
            .collect();
        DonorTextBatch {
            documents,
            membership_errors,
        }
    }
}

fn member(set: &HashSet<String>, submitted: &BTreeSet<String>) -> bool {
    submitted.iter().any(|id| set.contains(id))
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        if !out.iter().any(|existing| existing == value) {
            out.push(value.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FileCopy, OtherIdentifiers};

    struct StaticDirectory {
        harmonized: HashSet<String>,
        registered: HashSet<String>,
    }

    impl DonorDirectory for StaticDirectory {
        fn translates(&self, project_code: &str) -> bool {
            project_code == "BRCA-US"
        }

        fn translate(&self, submitted_id: &str) -> Option<String> {
            Some(format!("uuid-of-{submitted_id}"))
        }

        fn harmonized_donors(&self) -> Result<&HashSet<String>, KiraError> {
            Ok(&self.harmonized)
        }

        fn registered_donors(&self) -> Result<&HashSet<String>, KiraError> {
            Ok(&self.registered)
        }
    }

    fn donor(id: &str, project: &str, submitted: &str, sample: &str) -> Donor {
        Donor {
            donor_id: Some(id.to_string()),
            project_code: Some(project.to_string()),
            submitted_donor_id: Some(submitted.to_string()),
            sample_id: vec![sample.to_string()],
            ..Donor::default()
        }
    }

    #[test]
    fn file_text_flattens_leaf_fields() {
        let record = FileRecord::builder()
            .id("FI1")
            .data_bundle("EGAZ1")
            .file_copy(FileCopy {
                file_name: Some("a.bam".to_string()),
                ..FileCopy::default()
            })
            .file_copy(FileCopy {
                file_name: Some("a.bam".to_string()),
                ..FileCopy::default()
            })
            .donor(donor("DO1", "PACA-CA", "pcsi_1", "SA1"))
            .build();
        let doc = FileTextDocument::from_record("FI1", &record);
        assert_eq!(doc.file_name, vec!["a.bam"]);
        assert_eq!(doc.data_bundle_id.as_deref(), Some("EGAZ1"));
        assert_eq!(doc.donor_id, vec!["DO1"]);
        assert_eq!(doc.project_code, vec!["PACA-CA"]);
    }

    #[test]
    fn donor_text_merges_variants_across_records() {
        let first = FileRecord::builder()
            .donor(donor("DO1", "PACA-CA", "pcsi_1", "SA1"))
            .build();
        let second = FileRecord::builder()
            .donor(donor("DO1", "PACA-CA", "pcsi_1", "SA2"))
            .donor(Donor {
                submitted_donor_id: Some("unlinked".to_string()),
                ..Donor::default()
            })
            .build();
        let mut aggregator = DonorTextAggregator::new();
        aggregator.observe(&first);
        aggregator.observe(&second);
        assert_eq!(aggregator.len(), 1);

        let directory = StaticDirectory {
            harmonized: HashSet::from(["pcsi_1".to_string()]),
            registered: HashSet::new(),
        };
        let batch = aggregator.finish(&directory);
        assert!(batch.membership_errors.is_empty());
        let docs = batch.documents;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].sample_id, vec!["SA1", "SA2"]);
        assert_eq!(docs[0].in_harmonized_study, Some(true));
        assert_eq!(docs[0].registered, Some(false));
        assert!(docs[0].translated_id.is_empty());
    }

    #[test]
    fn barcode_projects_get_translated_ids() {
        let record = FileRecord::builder()
            .donor(Donor {
                other_identifiers: OtherIdentifiers {
                    tcga_participant_barcode: vec!["TCGA-A1-0001".to_string()],
                    ..OtherIdentifiers::default()
                },
                ..donor("DO9", "BRCA-US", "TCGA-A1-0001", "SA9")
            })
            .build();
        let mut aggregator = DonorTextAggregator::new();
        aggregator.observe(&record);
        let directory = StaticDirectory {
            harmonized: HashSet::new(),
            registered: HashSet::from(["TCGA-A1-0001".to_string()]),
        };
        let docs = aggregator.finish(&directory).documents;
        assert_eq!(docs[0].translated_id, vec!["uuid-of-TCGA-A1-0001"]);
        assert_eq!(docs[0].tcga_participant_barcode, vec!["TCGA-A1-0001"]);
        assert_eq!(docs[0].registered, Some(true));
    }

    struct UnreachableRegistry;

    impl DonorDirectory for UnreachableRegistry {
        fn translates(&self, _project_code: &str) -> bool {
            false
        }

        fn translate(&self, _submitted_id: &str) -> Option<String> {
            None
        }

        fn harmonized_donors(&self) -> Result<&HashSet<String>, KiraError> {
            Err(KiraError::IdentityHttp("registry down".to_string()))
        }

        fn registered_donors(&self) -> Result<&HashSet<String>, KiraError> {
            Err(KiraError::IdentityStatus {
                status: 503,
                message: "unavailable".to_string(),
            })
        }
    }

    #[test]
    fn unavailable_membership_leaves_flags_unset() {
        let mut aggregator = DonorTextAggregator::new();
        aggregator.observe(
            &FileRecord::builder()
                .donor(donor("DO1", "PACA-CA", "pcsi_1", "SA1"))
                .build(),
        );
        let batch = aggregator.finish(&UnreachableRegistry);
        assert_eq!(batch.membership_errors.len(), 2);
        assert_eq!(batch.documents.len(), 1);
        assert_eq!(batch.documents[0].in_harmonized_study, None);
        assert_eq!(batch.documents[0].registered, None);
        let value = serde_json::to_value(&batch.documents[0]).unwrap();
        assert!(value.get("registered").is_none());
    }
}
