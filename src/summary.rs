use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::domain::RunKey;
use crate::error::CatalogError;
use crate::store::{CatalogCounts, CatalogStore, CollectionObservation};

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSummary {
    pub totals: CatalogCounts,
    pub collections: Vec<CollectionSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    pub short_name: String,
    pub documents: usize,
    pub run_keys: Vec<RunKeySummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunKeySummary {
    pub run_key: RunKey,
    /// Whether the collection declares this key; observed-only keys are
    /// listed too so stray outputs are visible.
    pub declared: bool,
    pub documents_processed: usize,
    pub documents_missing: usize,
    pub output_files: usize,
}

pub fn summarize(store: &CatalogStore) -> Result<CatalogSummary, CatalogError> {
    let mut collections = Vec::new();
    for collection in store.get_document_collections() {
        let observation = store.observe_collection(&collection.short_name)?;
        collections.push(summarize_collection(&observation));
    }
    Ok(CatalogSummary {
        totals: store.counts(),
        collections,
    })
}

pub fn summarize_collection(observation: &CollectionObservation) -> CollectionSummary {
    let declared = &observation.collection.run_keys;
    let mut keys: BTreeSet<&RunKey> = declared.iter().collect();
    let mut processed = BTreeMap::<&RunKey, usize>::new();
    let mut files = BTreeMap::<&RunKey, usize>::new();

    for observed in &observation.documents {
        for (run_key, count) in &observed.outputs_per_run_key {
            keys.insert(run_key);
            *processed.entry(run_key).or_default() += 1;
            *files.entry(run_key).or_default() += count;
        }
    }

    let documents = observation.documents.len();
    let run_keys = keys
        .into_iter()
        .map(|run_key| {
            let documents_processed = processed.get(run_key).copied().unwrap_or(0);
            RunKeySummary {
                run_key: run_key.clone(),
                declared: declared.contains(run_key),
                documents_processed,
                documents_missing: documents - documents_processed,
                output_files: files.get(run_key).copied().unwrap_or(0),
            }
        })
        .collect();

    CollectionSummary {
        short_name: observation.collection.short_name.clone(),
        documents,
        run_keys,
    }
}
