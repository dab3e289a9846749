use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{AssignmentMode, IdKind, ResolveMode, StableId};
use crate::error::{IdentityAssignmentError, KiraError};
use crate::idservice::{DonorRegistry, IdentityService};
use crate::record::{Donor, FileRecord};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    kind: IdKind,
    submitted_id: String,
    project_code: String,
}

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Unknown,
    /// `translated` is set once the miss also covers the barcode retry.
    Missing { translated: bool },
    Found(StableId),
}

impl Slot {
    /// A cached miss answers a lookup only if it covered at least as much as `mode` asks for.
    fn needs_lookup(&self, mode: ResolveMode) -> bool {
        match self {
            Slot::Unknown => true,
            Slot::Missing { translated } => !translated && mode == ResolveMode::TranslateBarcode,
            Slot::Found(_) => false,
        }
    }

    fn miss(mode: ResolveMode) -> Self {
        Slot::Missing {
            translated: mode == ResolveMode::TranslateBarcode,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IdentityStats {
    pub cache_hits: usize,
    pub lookups: usize,
    pub creations: usize,
    pub translations: usize,
}

#[derive(Debug, Default)]
struct Counters {
    cache_hits: AtomicUsize,
    lookups: AtomicUsize,
    creations: AtomicUsize,
    translations: AtomicUsize,
}

/// Run-scoped donor membership sets, each computed once on first successful access.
#[derive(Debug, Default)]
pub struct DonorMembership {
    harmonized: OnceLock<HashSet<String>>,
    registered: OnceLock<HashSet<String>>,
    init: Mutex<()>,
}

impl DonorMembership {
    fn get_or_compute<'a, F>(
        &'a self,
        cell: &'a OnceLock<HashSet<String>>,
        compute: F,
    ) -> Result<&'a HashSet<String>, KiraError>
    where
        F: FnOnce() -> Result<HashSet<String>, KiraError>,
    {
        if let Some(set) = cell.get() {
            return Ok(set);
        }
        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = cell.get() {
            return Ok(set);
        }
        let set = compute()?;
        Ok(cell.get_or_init(|| set))
    }
}

/// Assigns and looks up stable ids, caching every answer for the run.
pub struct IdentityResolver<S: IdentityService, D: DonorRegistry> {
    service: S,
    registry: D,
    mode: AssignmentMode,
    barcode_projects: HashSet<String>,
    slots: Mutex<HashMap<CacheKey, Arc<Mutex<Slot>>>>,
    translations: Mutex<HashMap<String, Option<String>>>,
    membership: DonorMembership,
    counters: Counters,
}

impl<S: IdentityService, D: DonorRegistry> IdentityResolver<S, D> {
    pub fn new(service: S, registry: D, mode: AssignmentMode) -> Self {
        Self {
            service,
            registry,
            mode,
            barcode_projects: HashSet::new(),
            slots: Mutex::new(HashMap::new()),
            translations: Mutex::new(HashMap::new()),
            membership: DonorMembership::default(),
            counters: Counters::default(),
        }
    }

    pub fn with_barcode_projects(mut self, projects: impl IntoIterator<Item = String>) -> Self {
        self.barcode_projects = projects.into_iter().collect();
        self
    }

    pub fn mode(&self) -> AssignmentMode {
        self.mode
    }

    /// Projects configured as barcode-submitting get translated lookups.
    pub fn mode_for(&self, project_code: &str) -> ResolveMode {
        if self.barcode_projects.contains(project_code) {
            ResolveMode::TranslateBarcode
        } else {
            ResolveMode::Direct
        }
    }

    /// Lookup only. Hits and misses are both cached for the run.
    pub fn resolve(
        &self,
        kind: IdKind,
        submitted_id: &str,
        project_code: &str,
        mode: ResolveMode,
    ) -> Result<Option<StableId>, IdentityAssignmentError> {
        let slot = self.slot(kind, submitted_id, project_code);
        let mut guard = lock(&slot);
        if !guard.needs_lookup(mode) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(match &*guard {
                Slot::Found(id) => Some(id.clone()),
                _ => None,
            });
        }
        let found = self
            .lookup(kind, submitted_id, project_code, mode)
            .map_err(|err| assignment_error(kind, submitted_id, project_code, err.to_string()))?;
        *guard = match &found {
            Some(id) => Slot::Found(id.clone()),
            None => Slot::miss(mode),
        };
        Ok(found)
    }

    pub fn ensure(
        &self,
        kind: IdKind,
        submitted_id: &str,
        project_code: &str,
    ) -> Result<StableId, IdentityAssignmentError> {
        self.ensure_with(kind, submitted_id, project_code, ResolveMode::Direct)
    }

    /// Lookup-or-create. In read-only mode nothing is minted and a miss is an error.
    pub fn ensure_with(
        &self,
        kind: IdKind,
        submitted_id: &str,
        project_code: &str,
        mode: ResolveMode,
    ) -> Result<StableId, IdentityAssignmentError> {
        let slot = self.slot(kind, submitted_id, project_code);
        // held across the external calls: one creation per key
        let mut guard = lock(&slot);
        if let Slot::Found(id) = &*guard {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(id.clone());
        }
        if guard.needs_lookup(mode) {
            let found = self
                .lookup(kind, submitted_id, project_code, mode)
                .map_err(|err| assignment_error(kind, submitted_id, project_code, err.to_string()))?;
            if let Some(id) = found {
                *guard = Slot::Found(id.clone());
                return Ok(id);
            }
            *guard = Slot::miss(mode);
        }

        if !self.mode.can_create() {
            return Err(assignment_error(
                kind,
                submitted_id,
                project_code,
                "not registered and the resolver is read-only".to_string(),
            ));
        }

        self.counters.creations.fetch_add(1, Ordering::Relaxed);
        let id = self
            .service
            .create(kind, submitted_id, project_code)
            .map_err(|err| assignment_error(kind, submitted_id, project_code, err.to_string()))?;
        debug!(%kind, submitted_id, project_code, id = %id, "minted stable id");
        *guard = Slot::Found(id.clone());
        Ok(id)
    }

    /// Cached barcode/UUID translation; failures are logged and yield `None`.
    pub fn translate(&self, submitted_id: &str) -> Option<String> {
        if let Some(cached) = lock(&self.translations).get(submitted_id) {
            return cached.clone();
        }
        match self.translate_uncached(submitted_id) {
            Ok(translated) => {
                lock(&self.translations).insert(submitted_id.to_string(), translated.clone());
                translated
            }
            Err(err) => {
                warn!(submitted_id, error = %err, "barcode translation failed");
                None
            }
        }
    }

    pub fn harmonized_donors(&self) -> Result<&HashSet<String>, KiraError> {
        self.membership
            .get_or_compute(&self.membership.harmonized, || {
                self.registry.harmonized_submitted_donors()
            })
    }

    pub fn registered_donors(&self) -> Result<&HashSet<String>, KiraError> {
        self.membership
            .get_or_compute(&self.membership.registered, || {
                self.registry.registered_submitted_donors()
            })
    }

    /// Fills resolved donor, specimen and sample ids. A failing donor keeps its resolved ids
    /// unset; the other donors and the record are unaffected.
    pub fn link_donors(&self, record: FileRecord) -> (FileRecord, Vec<IdentityAssignmentError>) {
        let mut errors = Vec::new();
        let FileRecord { donors, .. } = &record;
        let linked = donors
            .iter()
            .map(|donor| match self.link_donor(donor) {
                Ok(linked) => linked,
                Err(err) => {
                    warn!(error = %err, "donor linkage failed");
                    errors.push(err);
                    donor.clone()
                }
            })
            .collect::<Vec<_>>();
        (
            FileRecord {
                donors: linked,
                ..record
            },
            errors,
        )
    }

    /// Records arriving without an id get one minted from their object id.
    pub fn assign_file_id(&self, record: FileRecord) -> Result<FileRecord, IdentityAssignmentError> {
        if record.id.as_deref().is_some_and(|id| !id.is_empty()) {
            return Ok(record);
        }
        let project_code = record.project_code().unwrap_or_default().to_string();
        let Some(object_id) = record.object_id.clone() else {
            return Err(assignment_error(
                IdKind::File,
                "",
                &project_code,
                "record has neither id nor object id".to_string(),
            ));
        };
        let id = self.ensure(IdKind::File, &object_id, &project_code)?;
        Ok(FileRecord {
            id: Some(id.into_string()),
            ..record
        })
    }

    pub fn stats(&self) -> IdentityStats {
        IdentityStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            creations: self.counters.creations.load(Ordering::Relaxed),
            translations: self.counters.translations.load(Ordering::Relaxed),
        }
    }

    fn link_donor(&self, donor: &Donor) -> Result<Donor, IdentityAssignmentError> {
        if donor.is_linked() {
            return Ok(donor.clone());
        }
        let Some(submitted_donor_id) = donor.submitted_donor_id.as_deref() else {
            return Ok(donor.clone());
        };
        let project_code = donor.project_code.as_deref().ok_or_else(|| {
            assignment_error(
                IdKind::Donor,
                submitted_donor_id,
                "",
                "donor has no project code".to_string(),
            )
        })?;
        let mode = self.mode_for(project_code);

        let donor_id = self.ensure_with(IdKind::Donor, submitted_donor_id, project_code, mode)?;
        let specimen_id = donor
            .submitted_specimen_id
            .iter()
            .map(|id| {
                self.ensure_with(IdKind::Specimen, id, project_code, mode)
                    .map(StableId::into_string)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sample_id = donor
            .submitted_sample_id
            .iter()
            .map(|id| {
                self.ensure_with(IdKind::Sample, id, project_code, mode)
                    .map(StableId::into_string)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Donor {
            donor_id: Some(donor_id.into_string()),
            specimen_id,
            sample_id,
            ..donor.clone()
        })
    }

    fn lookup(
        &self,
        kind: IdKind,
        submitted_id: &str,
        project_code: &str,
        mode: ResolveMode,
    ) -> Result<Option<StableId>, KiraError> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        if let Some(id) = self.service.lookup(kind, submitted_id, project_code)? {
            return Ok(Some(id));
        }
        if mode != ResolveMode::TranslateBarcode {
            return Ok(None);
        }
        let Some(translated) = self.translate_uncached(submitted_id)? else {
            return Ok(None);
        };
        // one retry in the other namespace
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        self.service.lookup(kind, &translated, project_code)
    }

    fn translate_uncached(&self, submitted_id: &str) -> Result<Option<String>, KiraError> {
        self.counters.translations.fetch_add(1, Ordering::Relaxed);
        if let Some(uuid) = self.service.translate_barcode(submitted_id)? {
            return Ok(Some(uuid));
        }
        self.service.translate_uuid(submitted_id)
    }

    fn slot(&self, kind: IdKind, submitted_id: &str, project_code: &str) -> Arc<Mutex<Slot>> {
        let key = CacheKey {
            kind,
            submitted_id: submitted_id.to_string(),
            project_code: project_code.to_string(),
        };
        lock(&self.slots).entry(key).or_default().clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn assignment_error(
    kind: IdKind,
    submitted_id: &str,
    project_code: &str,
    message: String,
) -> IdentityAssignmentError {
    IdentityAssignmentError {
        kind,
        submitted_id: submitted_id.to_string(),
        project_code: project_code.to_string(),
        message,
    }
}
