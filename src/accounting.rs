//! Work-remaining reports: which declared run keys each collection member
//! has not been processed under yet.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::{Document, RunKey};
use crate::error::CatalogError;
use crate::store::{CatalogStore, CollectionObservation};

/// Run key → member documents with no output under that key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MissingRunsMap {
    pub collection: String,
    pub missing: BTreeMap<RunKey, Vec<Document>>,
}

impl MissingRunsMap {
    pub fn documents_missing(&self, run_key: &RunKey) -> &[Document] {
        self.missing.get(run_key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_complete(&self) -> bool {
        self.missing.values().all(Vec::is_empty)
    }

    pub fn total_missing(&self) -> usize {
        self.missing.values().map(Vec::len).sum()
    }
}

/// Every declared run key appears in the result, with an empty list once all
/// members have at least one output under it.
pub fn missing_runs(store: &CatalogStore, collection: &str) -> Result<MissingRunsMap, CatalogError> {
    let observation = store.observe_collection(collection)?;
    Ok(missing_from_observation(observation))
}

/// The documents of `collection` still lacking `run_key`. The key does not
/// have to be declared on the collection.
pub fn missing_for_run_key(
    store: &CatalogStore,
    collection: &str,
    run_key: &RunKey,
) -> Result<Vec<Document>, CatalogError> {
    let observation = store.observe_collection(collection)?;
    Ok(observation
        .documents
        .into_iter()
        .filter(|observed| !observed.has_run(run_key))
        .map(|observed| observed.document)
        .collect())
}

pub(crate) fn missing_from_observation(observation: CollectionObservation) -> MissingRunsMap {
    let CollectionObservation {
        collection,
        documents,
    } = observation;

    let mut missing: BTreeMap<RunKey, Vec<Document>> = collection
        .run_keys
        .iter()
        .map(|key| (key.clone(), Vec::new()))
        .collect();

    for observed in documents {
        for (run_key, list) in missing.iter_mut() {
            if !observed.has_run(run_key) {
                list.push(observed.document.clone());
            }
        }
    }

    MissingRunsMap {
        collection: collection.short_name,
        missing,
    }
}
