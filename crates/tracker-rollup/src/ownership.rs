use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use tracker_core::{OwnershipMapping, OwnershipPair};
use tracker_storage::{GraphStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum ResolutionError {
    #[error("no domain named {0}")]
    UnknownDomain(String),
    #[error("no organization with acronym {0}")]
    UnknownOrganization(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedPair {
    pub acronym: String,
    pub domain: String,
    pub reason: ResolutionError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OwnershipReport {
    pub pairs_seen: usize,
    pub upserted: usize,
    pub unresolved: Vec<UnresolvedPair>,
    pub failed: Vec<String>,
}

#[derive(Debug, Default)]
pub struct OwnershipSync;

impl OwnershipSync {
    pub fn new() -> Self {
        Self
    }

    /// Upserts one `organization -> domain` edge per resolvable pair.
    /// Unresolvable pairs and per-pair storage errors are skipped and reported.
    pub fn sync(&self, store: &GraphStore, mapping: &OwnershipMapping) -> OwnershipReport {
        let mut report = OwnershipReport::default();

        for pair in mapping.pairs() {
            report.pairs_seen += 1;
            match sync_pair(store, &pair) {
                Ok(()) => report.upserted += 1,
                Err(PairError::Unresolved(reason)) => {
                    warn!(
                        event = "ownership_unresolved",
                        acronym = %pair.acronym,
                        domain = %pair.domain,
                        reason = %reason
                    );
                    report.unresolved.push(UnresolvedPair {
                        acronym: pair.acronym,
                        domain: pair.domain,
                        reason,
                    });
                }
                Err(PairError::Storage(err)) => {
                    warn!(
                        event = "ownership_failed",
                        acronym = %pair.acronym,
                        domain = %pair.domain,
                        error = %err
                    );
                    report
                        .failed
                        .push(format!("{} -> {}: {err}", pair.acronym, pair.domain));
                }
            }
        }

        info!(
            event = "ownership_sync_finish",
            pairs = report.pairs_seen,
            upserted = report.upserted,
            unresolved = report.unresolved.len(),
            failed = report.failed.len()
        );
        report
    }
}

enum PairError {
    Unresolved(ResolutionError),
    Storage(StorageError),
}

impl From<StorageError> for PairError {
    fn from(value: StorageError) -> Self {
        PairError::Storage(value)
    }
}

fn sync_pair(store: &GraphStore, pair: &OwnershipPair) -> Result<(), PairError> {
    let domain_key = store.domain_key(&pair.domain)?.ok_or_else(|| {
        PairError::Unresolved(ResolutionError::UnknownDomain(pair.domain.clone()))
    })?;
    let org_key = store
        .organization_key_by_acronym(&pair.acronym)?
        .ok_or_else(|| {
            PairError::Unresolved(ResolutionError::UnknownOrganization(pair.acronym.clone()))
        })?;
    store.upsert_ownership(&org_key, &domain_key)?;
    Ok(())
}
