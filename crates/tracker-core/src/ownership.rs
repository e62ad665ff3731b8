use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OwnershipMappingError {
    #[error("ownership mapping is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("ownership mapping has an empty organization acronym")]
    EmptyAcronym,
}

/// External ledger feed: organization acronym to the domains it accounts for.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct OwnershipMapping {
    pub entries: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipPair {
    pub acronym: String,
    pub domain: String,
}

impl OwnershipMapping {
    pub fn parse_json(raw: &str) -> Result<Self, OwnershipMappingError> {
        let mapping: Self = serde_json::from_str(raw)?;
        if mapping.entries.keys().any(|acronym| acronym.trim().is_empty()) {
            return Err(OwnershipMappingError::EmptyAcronym);
        }
        Ok(mapping)
    }

    /// Flattened `(acronym, domain)` pairs in acronym order; blank domains are dropped.
    pub fn pairs(&self) -> Vec<OwnershipPair> {
        self.entries
            .iter()
            .flat_map(|(acronym, domains)| {
                domains
                    .iter()
                    .map(|domain| normalize_domain(domain))
                    .filter(|domain| !domain.is_empty())
                    .map(move |domain| OwnershipPair {
                        acronym: acronym.trim().to_string(),
                        domain,
                    })
            })
            .collect()
    }
}

pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}
