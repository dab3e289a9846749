use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::domain::ProvenanceClass;
use crate::filter::ProvenancePolicy;
use crate::record::{Donor, FileRecord};

/// Records sharing one id. Never empty.
#[derive(Debug, Clone)]
pub struct RecordGroup {
    members: Vec<FileRecord>,
}

impl RecordGroup {
    pub fn new(members: Vec<FileRecord>) -> Option<Self> {
        (!members.is_empty()).then_some(Self { members })
    }

    pub fn single(record: FileRecord) -> Self {
        Self {
            members: vec![record],
        }
    }

    pub fn members(&self) -> &[FileRecord] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Conflicting scalar values inside one combine group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationWarning {
    pub field: &'static str,
    pub values: Vec<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Combined {
    pub record: FileRecord,
    pub warnings: Vec<ReconciliationWarning>,
}

#[derive(Debug, Clone)]
pub struct RecordCombiner {
    policy: ProvenancePolicy,
}

impl RecordCombiner {
    pub fn new(policy: ProvenancePolicy) -> Self {
        Self { policy }
    }

    /// Merges a group into one record. Members are never modified.
    pub fn combine(&self, group: &RecordGroup) -> Combined {
        let ordered = self.prioritize(group);
        let mut warnings = Vec::new();

        let record = FileRecord {
            id: pick(&ordered, "id", |r| r.id.as_ref(), &mut warnings),
            object_id: pick(&ordered, "object_id", |r| r.object_id.as_ref(), &mut warnings),
            access: pick(&ordered, "access", |r| r.access.as_ref(), &mut warnings),
            data_bundle: pick(&ordered, "data_bundle", |r| r.data_bundle.as_ref(), &mut warnings),
            analysis_method: pick(
                &ordered,
                "analysis_method",
                |r| r.analysis_method.as_ref(),
                &mut warnings,
            ),
            data_categorization: pick(
                &ordered,
                "data_categorization",
                |r| r.data_categorization.as_ref(),
                &mut warnings,
            ),
            reference_genome: pick(
                &ordered,
                "reference_genome",
                |r| r.reference_genome.as_ref(),
                &mut warnings,
            ),
            study: self.merge_study(&ordered),
            file_copies: ordered
                .iter()
                .flat_map(|member| member.file_copies.iter().cloned())
                .collect(),
            donors: dedup_donors(ordered.iter().flat_map(|member| member.donors.iter())),
        };

        let id = record.id.clone();
        for warning in &mut warnings {
            warning.id = id.clone();
        }

        Combined { record, warnings }
    }

    /// Members in completeness order; equal ranks keep their input order.
    fn prioritize<'a>(&self, group: &'a RecordGroup) -> Vec<&'a FileRecord> {
        let mut ordered = group.members().iter().collect::<Vec<_>>();
        ordered.sort_by_key(|member| self.policy.rank(member));
        ordered
    }

    fn merge_study(&self, ordered: &[&FileRecord]) -> Vec<String> {
        let mut study = Vec::new();
        for member in ordered {
            for tag in &member.study {
                if !study.contains(tag) {
                    study.push(tag.clone());
                }
            }
        }
        let tag = self.policy.harmonized_study();
        let harmonized_copy = ordered.iter().any(|member| {
            self.policy
                .classes(member)
                .any(|class| class == ProvenanceClass::Harmonized)
        });
        if harmonized_copy && !study.iter().any(|existing| existing == tag) {
            study.push(tag.to_string());
        }
        study
    }
}

/// First non-null value in priority order; records a warning when members disagree.
fn pick<T, F>(
    ordered: &[&FileRecord],
    field: &'static str,
    get: F,
    warnings: &mut Vec<ReconciliationWarning>,
) -> Option<T>
where
    T: Clone + PartialEq + Serialize,
    F: Fn(&FileRecord) -> Option<&T>,
{
    let mut distinct: Vec<&T> = Vec::new();
    for value in ordered.iter().filter_map(|member| get(member)) {
        if !distinct.contains(&value) {
            distinct.push(value);
        }
    }
    if distinct.len() > 1 {
        warnings.push(ReconciliationWarning {
            field,
            values: distinct.iter().map(|value| render(*value)).collect(),
            id: None,
        });
    }
    distinct.first().map(|value| (*value).clone())
}

fn render<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(text)) => text,
        Ok(other) => other.to_string(),
        Err(err) => format!("<unrenderable: {err}>"),
    }
}

/// Keeps the first copy of every donor; donors without any id are all kept.
pub fn dedup_donors<'a>(donors: impl Iterator<Item = &'a Donor>) -> Vec<Donor> {
    let mut kept: Vec<Donor> = Vec::new();
    let mut seen = HashSet::new();
    for donor in donors {
        let Some(key) = donor.key() else {
            kept.push(donor.clone());
            continue;
        };
        if seen.contains(&key) || kept.iter().any(|existing| existing.same_donor(donor)) {
            continue;
        }
        seen.insert(key);
        kept.push(donor.clone());
    }
    kept
}

/// Partitions records by id, groups in first-seen order. Records without an id are returned apart.
pub fn group_by_id(records: Vec<FileRecord>) -> (Vec<RecordGroup>, Vec<FileRecord>) {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<FileRecord>> = HashMap::new();
    let mut unidentified = Vec::new();
    for record in records {
        match record.id.clone().filter(|id| !id.is_empty()) {
            Some(id) => {
                let members = groups.entry(id.clone()).or_default();
                if members.is_empty() {
                    order.push(id);
                }
                members.push(record);
            }
            None => unidentified.push(record),
        }
    }
    let groups = order
        .into_iter()
        .filter_map(|id| groups.remove(&id).and_then(RecordGroup::new))
        .collect();
    (groups, unidentified)
}
