use std::collections::BTreeMap;

use kira_repo_index::combine::{RecordCombiner, RecordGroup};
use kira_repo_index::domain::{Access, ProvenanceClass};
use kira_repo_index::filter::ProvenancePolicy;
use kira_repo_index::record::{AnalysisMethod, Donor, FileCopy, FileRecord};

fn policy() -> ProvenancePolicy {
    let mut repositories = BTreeMap::new();
    repositories.insert("harmonized-archive".to_string(), ProvenanceClass::Harmonized);
    repositories.insert("ega".to_string(), ProvenanceClass::OpenRelease);
    repositories.insert("aws-virginia".to_string(), ProvenanceClass::PreRelease);
    ProvenancePolicy::new("HARMONIZED", repositories)
}

fn copy(repo_code: &str, file_name: &str) -> FileCopy {
    FileCopy {
        repo_code: Some(repo_code.to_string()),
        file_name: Some(file_name.to_string()),
        ..FileCopy::default()
    }
}

fn donor(donor_id: Option<&str>, submitted: &str, site: &str) -> Donor {
    Donor {
        donor_id: donor_id.map(str::to_string),
        submitted_donor_id: Some(submitted.to_string()),
        primary_site: Some(site.to_string()),
        ..Donor::default()
    }
}

#[test]
fn harmonized_record_wins_and_copies_concatenate() {
    let a = FileRecord::builder()
        .id("F1")
        .file_copy(copy("cghub", "a.bam"))
        .build();
    let b = FileRecord::builder()
        .id("F1")
        .study("HARMONIZED")
        .file_copy(copy("harmonized-archive", "b.bam"))
        .donor(donor(Some("DO1"), "sub-1", "Pancreas"))
        .build();
    let group = RecordGroup::new(vec![a.clone(), b.clone()]).unwrap();

    let combined = RecordCombiner::new(policy()).combine(&group);
    let record = combined.record;
    assert_eq!(record.id.as_deref(), Some("F1"));
    assert_eq!(record.study, vec!["HARMONIZED"]);
    assert_eq!(record.file_copies.len(), 2);
    assert_eq!(record.file_copies[0], b.file_copies[0]);
    assert_eq!(record.file_copies[1], a.file_copies[0]);
    assert_eq!(record.donors.len(), 1);
    assert_eq!(record.donors[0].donor_id.as_deref(), Some("DO1"));
    assert!(combined.warnings.is_empty());
}

#[test]
fn combine_leaves_members_untouched() {
    let a = FileRecord::builder()
        .id("F1")
        .access(Access::Controlled)
        .file_copy(copy("aws-virginia", "a.bam"))
        .build();
    let b = FileRecord::builder()
        .id("F1")
        .access(Access::Open)
        .file_copy(copy("ega", "b.bam"))
        .build();
    let group = RecordGroup::new(vec![a.clone(), b.clone()]).unwrap();
    let _ = RecordCombiner::new(policy()).combine(&group);
    assert_eq!(group.members()[0], a);
    assert_eq!(group.members()[1], b);
}

#[test]
fn first_non_null_scalar_in_priority_order() {
    let mirror = FileRecord::builder()
        .id("F1")
        .object_id("obj-mirror")
        .analysis_method(AnalysisMethod {
            analysis_type: Some("alignment".to_string()),
            software: Some("bwa".to_string()),
        })
        .file_copy(copy("aws-virginia", "a.bam"))
        .build();
    let released = FileRecord::builder()
        .id("F1")
        .file_copy(copy("ega", "b.bam"))
        .build();
    let group = RecordGroup::new(vec![mirror, released]).unwrap();

    let combined = RecordCombiner::new(policy()).combine(&group);
    // the released member has no object id, so the mirror's fills in
    assert_eq!(combined.record.object_id.as_deref(), Some("obj-mirror"));
    assert_eq!(
        combined.record.analysis_method.and_then(|m| m.software),
        Some("bwa".to_string())
    );
    assert_eq!(
        combined.record.file_copies[0].repo_code.as_deref(),
        Some("ega")
    );
    assert!(combined.record.access.is_none());
}

#[test]
fn conflicting_scalars_warn_without_blocking() {
    let released = FileRecord::builder()
        .id("F1")
        .access(Access::Open)
        .file_copy(copy("ega", "b.bam"))
        .build();
    let mirror = FileRecord::builder()
        .id("F1")
        .access(Access::Controlled)
        .file_copy(copy("aws-virginia", "a.bam"))
        .build();
    let group = RecordGroup::new(vec![mirror, released]).unwrap();

    let combined = RecordCombiner::new(policy()).combine(&group);
    assert_eq!(combined.record.access, Some(Access::Open));
    assert_eq!(combined.warnings.len(), 1);
    let warning = &combined.warnings[0];
    assert_eq!(warning.field, "access");
    assert_eq!(warning.values, vec!["open", "controlled"]);
    assert_eq!(warning.id.as_deref(), Some("F1"));
}

#[test]
fn donors_dedup_keeps_highest_priority_copy() {
    let mirror = FileRecord::builder()
        .id("F1")
        .file_copy(copy("aws-virginia", "a.bam"))
        .donor(donor(Some("DO1"), "sub-1", "mirror-site"))
        .donor(donor(None, "sub-2", "mirror-site"))
        .build();
    let harmonized = FileRecord::builder()
        .id("F1")
        .file_copy(copy("harmonized-archive", "b.bam"))
        .donor(donor(Some("DO1"), "sub-1", "harmonized-site"))
        .donor(donor(None, "sub-2", "harmonized-site"))
        .build();
    let group = RecordGroup::new(vec![mirror, harmonized]).unwrap();

    let combined = RecordCombiner::new(policy()).combine(&group);
    let donors = combined.record.donors;
    assert_eq!(donors.len(), 2);
    assert!(
        donors
            .iter()
            .all(|d| d.primary_site.as_deref() == Some("harmonized-site"))
    );
    assert_eq!(combined.record.study, vec!["HARMONIZED"]);
}

#[test]
fn singleton_group_passes_through() {
    let record = FileRecord::builder()
        .id("F9")
        .study("OTHER")
        .access(Access::Open)
        .file_copy(copy("ega", "x.vcf"))
        .donor(donor(Some("DO9"), "sub-9", "Liver"))
        .build();
    let combined = RecordCombiner::new(policy()).combine(&RecordGroup::single(record.clone()));
    assert_eq!(combined.record, record);
    assert!(combined.warnings.is_empty());
}

#[test]
fn all_null_scalar_stays_null() {
    let group = RecordGroup::new(vec![
        FileRecord::builder().id("F1").build(),
        FileRecord::builder().id("F1").build(),
    ])
    .unwrap();
    let combined = RecordCombiner::new(policy()).combine(&group);
    assert!(combined.record.reference_genome.is_none());
    assert!(combined.record.data_bundle.is_none());
}
