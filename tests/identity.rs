use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use kira_repo_index::domain::{AssignmentMode, IdKind, ResolveMode, StableId};
use kira_repo_index::error::KiraError;
use kira_repo_index::identity::IdentityResolver;
use kira_repo_index::idservice::{DonorRegistry, IdentityService};
use kira_repo_index::record::{Donor, FileRecord};

#[derive(Default)]
struct Calls {
    lookups: AtomicUsize,
    creations: AtomicUsize,
    registry: AtomicUsize,
}

#[derive(Default)]
struct MockService {
    calls: Arc<Calls>,
    known: Mutex<HashMap<(IdKind, String), String>>,
    barcodes: HashMap<String, String>,
    failing: HashSet<String>,
}

impl MockService {
    fn new(calls: Arc<Calls>) -> Self {
        Self {
            calls,
            ..Self::default()
        }
    }

    fn with_known(self, kind: IdKind, submitted: &str, id: &str) -> Self {
        self.known
            .lock()
            .unwrap()
            .insert((kind, submitted.to_string()), id.to_string());
        self
    }
}

impl IdentityService for MockService {
    fn lookup(
        &self,
        kind: IdKind,
        submitted_id: &str,
        _project_code: &str,
    ) -> Result<Option<StableId>, KiraError> {
        self.calls.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(submitted_id) {
            return Err(KiraError::IdentityStatus {
                status: 500,
                message: "boom".to_string(),
            });
        }
        Ok(self
            .known
            .lock()
            .unwrap()
            .get(&(kind, submitted_id.to_string()))
            .map(StableId::new))
    }

    fn create(
        &self,
        kind: IdKind,
        submitted_id: &str,
        _project_code: &str,
    ) -> Result<StableId, KiraError> {
        let n = self.calls.creations.fetch_add(1, Ordering::SeqCst) + 1;
        thread::sleep(Duration::from_millis(10));
        let id = format!("{}{n}", kind.as_str().to_uppercase());
        self.known
            .lock()
            .unwrap()
            .insert((kind, submitted_id.to_string()), id.clone());
        Ok(StableId::new(id))
    }

    fn translate_barcode(&self, barcode: &str) -> Result<Option<String>, KiraError> {
        Ok(self.barcodes.get(barcode).cloned())
    }

    fn translate_uuid(&self, _uuid: &str) -> Result<Option<String>, KiraError> {
        Ok(None)
    }
}

#[derive(Default)]
struct MockRegistry {
    calls: Arc<Calls>,
    fail_next: AtomicBool,
}

impl DonorRegistry for MockRegistry {
    fn harmonized_submitted_donors(&self) -> Result<HashSet<String>, KiraError> {
        self.calls.registry.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(KiraError::IdentityHttp("registry down".to_string()));
        }
        Ok(HashSet::from(["sub-1".to_string()]))
    }

    fn registered_submitted_donors(&self) -> Result<HashSet<String>, KiraError> {
        self.calls.registry.fetch_add(1, Ordering::SeqCst);
        Ok(HashSet::new())
    }
}

fn resolver(
    service: MockService,
    calls: &Arc<Calls>,
    mode: AssignmentMode,
) -> IdentityResolver<MockService, MockRegistry> {
    let registry = MockRegistry {
        calls: calls.clone(),
        ..MockRegistry::default()
    };
    IdentityResolver::new(service, registry, mode)
}

#[test]
fn read_only_resolve_is_cached() {
    let calls = Arc::new(Calls::default());
    let service = MockService::new(calls.clone()).with_known(IdKind::Donor, "sub-1", "DO1");
    let resolver = resolver(service, &calls, AssignmentMode::ReadOnly);

    let first = resolver
        .resolve(IdKind::Donor, "sub-1", "PACA-CA", ResolveMode::Direct)
        .unwrap();
    let second = resolver
        .resolve(IdKind::Donor, "sub-1", "PACA-CA", ResolveMode::Direct)
        .unwrap();
    assert_eq!(first, Some(StableId::new("DO1")));
    assert_eq!(first, second);
    assert_eq!(calls.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(resolver.stats().cache_hits, 1);
}

#[test]
fn misses_are_cached_too() {
    let calls = Arc::new(Calls::default());
    let resolver = resolver(MockService::new(calls.clone()), &calls, AssignmentMode::ReadOnly);
    for _ in 0..3 {
        let found = resolver
            .resolve(IdKind::Sample, "unknown", "PACA-CA", ResolveMode::Direct)
            .unwrap();
        assert!(found.is_none());
    }
    assert_eq!(calls.lookups.load(Ordering::SeqCst), 1);
}

#[test]
fn read_only_ensure_never_mints() {
    let calls = Arc::new(Calls::default());
    let service = MockService::new(calls.clone()).with_known(IdKind::Donor, "sub-1", "DO1");
    let resolver = resolver(service, &calls, AssignmentMode::ReadOnly);

    assert_eq!(
        resolver.ensure(IdKind::Donor, "sub-1", "PACA-CA").unwrap(),
        StableId::new("DO1")
    );
    let err = resolver
        .ensure(IdKind::Donor, "sub-2", "PACA-CA")
        .unwrap_err();
    assert_eq!(err.kind, IdKind::Donor);
    assert_eq!(err.submitted_id, "sub-2");
    assert_eq!(err.project_code, "PACA-CA");
    assert_eq!(calls.creations.load(Ordering::SeqCst), 0);
}

#[test]
fn authoritative_ensure_creates_once() {
    let calls = Arc::new(Calls::default());
    let resolver = resolver(
        MockService::new(calls.clone()),
        &calls,
        AssignmentMode::Authoritative,
    );
    let first = resolver.ensure(IdKind::Specimen, "sp-1", "PACA-CA").unwrap();
    let second = resolver.ensure(IdKind::Specimen, "sp-1", "PACA-CA").unwrap();
    assert_eq!(first, second);
    assert_eq!(calls.creations.load(Ordering::SeqCst), 1);
    assert_eq!(calls.lookups.load(Ordering::SeqCst), 1);

    // another project is another cache key
    resolver.ensure(IdKind::Specimen, "sp-1", "BRCA-UK").unwrap();
    assert_eq!(calls.lookups.load(Ordering::SeqCst), 2);
}

#[test]
fn concurrent_ensure_is_single_flight() {
    let calls = Arc::new(Calls::default());
    let resolver = resolver(
        MockService::new(calls.clone()),
        &calls,
        AssignmentMode::Authoritative,
    );
    let ids = thread::scope(|scope| {
        let handles = (0..8)
            .map(|_| scope.spawn(|| resolver.ensure(IdKind::Donor, "sub-9", "PACA-CA").unwrap()))
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });
    assert_eq!(calls.creations.load(Ordering::SeqCst), 1);
    assert!(ids.iter().all(|id| id == &ids[0]));
}

#[test]
fn barcode_mode_retries_with_translation() {
    let calls = Arc::new(Calls::default());
    let mut service = MockService::new(calls.clone()).with_known(IdKind::Donor, "uuid-1", "DO7");
    service
        .barcodes
        .insert("TCGA-AB-0001".to_string(), "uuid-1".to_string());
    let resolver = resolver(service, &calls, AssignmentMode::ReadOnly);

    let direct = resolver
        .resolve(IdKind::Donor, "TCGA-AB-0001", "BRCA-US", ResolveMode::Direct)
        .unwrap();
    assert!(direct.is_none());

    let translated = resolver
        .resolve(IdKind::Donor, "TCGA-AB-0001", "LAML-US", ResolveMode::TranslateBarcode)
        .unwrap();
    assert_eq!(translated, Some(StableId::new("DO7")));
    // one direct lookup, then literal + translated for the second key
    assert_eq!(calls.lookups.load(Ordering::SeqCst), 3);
}

#[test]
fn failed_donor_does_not_affect_others() {
    let calls = Arc::new(Calls::default());
    let mut service = MockService::new(calls.clone()).with_known(IdKind::Donor, "sub-1", "DO1");
    service.failing.insert("sub-bad".to_string());
    let resolver = resolver(service, &calls, AssignmentMode::Authoritative);

    let record = FileRecord::builder()
        .id("FI1")
        .donor(Donor {
            project_code: Some("PACA-CA".to_string()),
            submitted_donor_id: Some("sub-1".to_string()),
            submitted_sample_id: vec!["sa-1".to_string()],
            ..Donor::default()
        })
        .donor(Donor {
            project_code: Some("PACA-CA".to_string()),
            submitted_donor_id: Some("sub-bad".to_string()),
            ..Donor::default()
        })
        .build();

    let (linked, errors) = resolver.link_donors(record.clone());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].submitted_id, "sub-bad");
    assert_eq!(linked.donors[0].donor_id.as_deref(), Some("DO1"));
    assert_eq!(linked.donors[0].sample_id.len(), 1);
    assert!(linked.donors[1].donor_id.is_none());
    assert_eq!(linked.id, record.id);
    assert_eq!(linked.donors.len(), 2);
}

#[test]
fn membership_sets_computed_once() {
    let calls = Arc::new(Calls::default());
    let resolver = resolver(MockService::new(calls.clone()), &calls, AssignmentMode::ReadOnly);
    for _ in 0..3 {
        assert!(resolver.harmonized_donors().unwrap().contains("sub-1"));
    }
    assert!(resolver.registered_donors().unwrap().is_empty());
    assert_eq!(calls.registry.load(Ordering::SeqCst), 2);
}

#[test]
fn failed_membership_is_retried() {
    let calls = Arc::new(Calls::default());
    let registry = MockRegistry {
        calls: calls.clone(),
        fail_next: AtomicBool::new(true),
    };
    let resolver = IdentityResolver::new(
        MockService::new(calls.clone()),
        registry,
        AssignmentMode::ReadOnly,
    );
    assert_matches!(resolver.harmonized_donors(), Err(KiraError::IdentityHttp(_)));
    assert!(resolver.harmonized_donors().is_ok());
    assert!(resolver.harmonized_donors().is_ok());
    assert_eq!(calls.registry.load(Ordering::SeqCst), 2);
}

#[test]
fn file_id_minted_from_object_id() {
    let calls = Arc::new(Calls::default());
    let resolver = resolver(
        MockService::new(calls.clone()),
        &calls,
        AssignmentMode::Authoritative,
    );
    let record = FileRecord::builder()
        .object_id("obj-1")
        .donor(Donor {
            project_code: Some("PACA-CA".to_string()),
            ..Donor::default()
        })
        .build();
    let assigned = resolver.assign_file_id(record).unwrap();
    assert_eq!(assigned.id.as_deref(), Some("FILE1"));

    let existing = FileRecord::builder().id("FI5").build();
    assert_eq!(
        resolver.assign_file_id(existing).unwrap().id.as_deref(),
        Some("FI5")
    );
}

#[test]
fn translation_is_cached_per_run() {
    let calls = Arc::new(Calls::default());
    let mut service = MockService::new(calls.clone());
    service
        .barcodes
        .insert("TCGA-AB-0001".to_string(), "uuid-1".to_string());
    let resolver = resolver(service, &calls, AssignmentMode::ReadOnly);

    assert_eq!(resolver.translate("TCGA-AB-0001").as_deref(), Some("uuid-1"));
    assert_eq!(resolver.translate("TCGA-AB-0001").as_deref(), Some("uuid-1"));
    assert!(resolver.translate("sub-unknown").is_none());
    assert_eq!(resolver.stats().translations, 2);
}

#[test]
fn direct_miss_does_not_hide_translated_lookup() {
    let calls = Arc::new(Calls::default());
    let mut service = MockService::new(calls.clone()).with_known(IdKind::Donor, "uuid-1", "DO7");
    service
        .barcodes
        .insert("TCGA-AB-0001".to_string(), "uuid-1".to_string());
    let resolver = resolver(service, &calls, AssignmentMode::ReadOnly);

    let direct = resolver
        .resolve(IdKind::Donor, "TCGA-AB-0001", "LAML-US", ResolveMode::Direct)
        .unwrap();
    assert!(direct.is_none());
    let translated = resolver
        .resolve(IdKind::Donor, "TCGA-AB-0001", "LAML-US", ResolveMode::TranslateBarcode)
        .unwrap();
    assert_eq!(translated, Some(StableId::new("DO7")));
    assert_eq!(calls.lookups.load(Ordering::SeqCst), 3);

    // now answered from the cache in either mode
    for mode in [ResolveMode::Direct, ResolveMode::TranslateBarcode] {
        let again = resolver
            .resolve(IdKind::Donor, "TCGA-AB-0001", "LAML-US", mode)
            .unwrap();
        assert_eq!(again, Some(StableId::new("DO7")));
    }
    assert_eq!(calls.lookups.load(Ordering::SeqCst), 3);
}

#[test]
fn translated_miss_also_answers_direct() {
    let calls = Arc::new(Calls::default());
    let resolver = resolver(MockService::new(calls.clone()), &calls, AssignmentMode::ReadOnly);
    let translated = resolver
        .resolve(IdKind::Donor, "TCGA-AB-0002", "LAML-US", ResolveMode::TranslateBarcode)
        .unwrap();
    assert!(translated.is_none());
    let direct = resolver
        .resolve(IdKind::Donor, "TCGA-AB-0002", "LAML-US", ResolveMode::Direct)
        .unwrap();
    assert!(direct.is_none());
    assert_eq!(calls.lookups.load(Ordering::SeqCst), 1);
}
