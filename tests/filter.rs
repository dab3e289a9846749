use std::collections::BTreeMap;

use kira_repo_index::domain::ProvenanceClass;
use kira_repo_index::filter::{ProvenancePolicy, PublicationFilter};
use kira_repo_index::record::{FileCopy, FileRecord};

fn filter() -> PublicationFilter {
    let mut repositories = BTreeMap::new();
    repositories.insert("pcawg-heidelberg".to_string(), ProvenanceClass::Harmonized);
    repositories.insert("ega".to_string(), ProvenanceClass::OpenRelease);
    repositories.insert("aws-virginia".to_string(), ProvenanceClass::PreRelease);
    repositories.insert("collab".to_string(), ProvenanceClass::PreRelease);
    PublicationFilter::new(ProvenancePolicy::new("PCAWG", repositories))
}

fn record(codes: &[&str]) -> FileRecord {
    codes
        .iter()
        .fold(FileRecord::builder().id("FI1"), |builder, code| {
            builder.file_copy(FileCopy {
                repo_code: Some(code.to_string()),
                ..FileCopy::default()
            })
        })
        .build()
}

#[test]
fn released_copy_is_eligible_regardless_of_mirrors() {
    let filter = filter();
    assert!(filter.is_eligible(&record(&["ega"])));
    assert!(filter.is_eligible(&record(&["aws-virginia", "pcawg-heidelberg"])));
    assert!(filter.is_eligible(&record(&["collab", "aws-virginia", "ega"])));
}

#[test]
fn mirror_only_record_is_withheld() {
    let filter = filter();
    assert!(!filter.is_eligible(&record(&["aws-virginia"])));
    assert!(!filter.is_eligible(&record(&["aws-virginia", "collab"])));
    assert!(!filter.is_eligible(&record(&["cghub", "collab"])));
}

#[test]
fn unclassified_archives_publish() {
    let filter = filter();
    assert!(filter.is_eligible(&record(&["cghub"])));
    assert!(filter.is_eligible(&record(&[])));
}

#[test]
fn partition_counts_withheld() {
    let filter = filter();
    let (eligible, withheld) = filter
        .partition(vec![
            record(&["ega"]),
            record(&["collab"]),
            record(&["cghub"]),
        ])
        .unwrap();
    assert_eq!(eligible.len(), 2);
    assert_eq!(withheld, 1);
}
