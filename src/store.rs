//! The catalog ledger.
//!
//! State lives in memory behind a `RwLock` and is persisted as a JSON snapshot
//! (`catalog.json`) plus an append-only journal (`journal.jsonl`). Every
//! mutating operation is validated against the in-memory state, written to the
//! journal as a single line, and only then applied, so a crash never exposes a
//! half-applied operation. Journal events are idempotent: replaying an event
//! that is already reflected in the snapshot changes nothing.
//!
//! One writer process at a time holds an OS lock on `catalog.lock`; the lock
//! dies with the process. Read-only handles take no lock and see the catalog
//! as it was when they opened.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{
    AnnotationOutput, AnnotationPipeline, Document, DocumentCollection, ExternalId,
    IdentifierType, RunKey,
};
use crate::error::CatalogError;

pub const SNAPSHOT_FILE: &str = "catalog.json";
pub const JOURNAL_FILE: &str = "journal.jsonl";
pub const LOCK_FILE: &str = "catalog.lock";

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Flush each journal record to stable storage before acknowledging it.
    pub fsync: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { fsync: true }
    }
}

/// Handle on an open catalog. A writable handle holds the directory lock
/// until dropped.
pub struct CatalogStore {
    root: Utf8PathBuf,
    inner: RwLock<Inner>,
    /// `None` for read-only handles.
    durability: Option<Durability>,
    _lock: Option<LockFile>,
}

impl std::fmt::Debug for CatalogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

struct Inner {
    state: CatalogState,
    journal: Option<Journal>,
}

/// A member document together with how many output files it has per run key.
#[derive(Debug, Clone, Serialize)]
pub struct ObservedDocument {
    pub document: Document,
    pub outputs_per_run_key: BTreeMap<RunKey, usize>,
}

impl ObservedDocument {
    pub fn has_run(&self, run_key: &RunKey) -> bool {
        self.outputs_per_run_key.contains_key(run_key)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionObservation {
    pub collection: DocumentCollection,
    pub documents: Vec<ObservedDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CatalogCounts {
    pub collections: usize,
    pub documents: usize,
    pub pipelines: usize,
    pub outputs: usize,
}

impl CatalogStore {
    pub fn open(root: &Utf8Path) -> Result<Self, CatalogError> {
        Self::open_with(root, StoreOptions::default())
    }

    pub fn open_with(root: &Utf8Path, options: StoreOptions) -> Result<Self, CatalogError> {
        fs::create_dir_all(root.as_std_path()).map_err(|err| CatalogError::store_io(root, err))?;
        let lock = LockFile::acquire(root)?;

        let journal_path = root.join(JOURNAL_FILE);
        let (state, records) = load_state(root)?;
        if records.torn {
            OpenOptions::new()
                .write(true)
                .open(journal_path.as_std_path())
                .and_then(|file| file.set_len(records.valid_len))
                .map_err(|err| CatalogError::store_io(&journal_path, err))?;
        }
        let journal = Journal::open(&journal_path)?;
        let durability = Durability::new(&journal, options.fsync)?;

        info!(
            root = %root,
            collections = state.collections.len(),
            documents = state.documents.len(),
            replayed = records.events.len(),
            "opened catalog"
        );

        Ok(Self {
            root: root.to_owned(),
            inner: RwLock::new(Inner {
                state,
                journal: Some(journal),
            }),
            durability: Some(durability),
            _lock: Some(lock),
        })
    }

    /// Opens the catalog for queries without taking the writer lock, so it
    /// works while another process is loading or recording outputs. Mutations
    /// that would change the catalog fail with `ReadOnly`.
    pub fn open_read_only(root: &Utf8Path) -> Result<Self, CatalogError> {
        let (state, records) = load_state(root)?;
        debug!(root = %root, replayed = records.events.len(), "opened catalog read-only");
        Ok(Self {
            root: root.to_owned(),
            inner: RwLock::new(Inner {
                state,
                journal: None,
            }),
            durability: None,
            _lock: None,
        })
    }

    /// Folds the journal into a fresh snapshot.
    pub fn compact(&self) -> Result<(), CatalogError> {
        let mut guard = self.write();
        let inner = &mut *guard;
        let Some(journal) = inner.journal.as_mut() else {
            return Err(CatalogError::ReadOnly(self.root.clone()));
        };
        let snapshot = inner.state.to_snapshot();
        write_snapshot(&self.root.join(SNAPSHOT_FILE), &snapshot)?;
        journal.truncate()?;
        info!(
            root = %self.root,
            documents = snapshot.documents.len(),
            "compacted catalog journal"
        );
        Ok(())
    }

    /// Compacts and releases the handle. Dropping the store without calling
    /// `close` still releases the lock; the journal is replayed on next open.
    pub fn close(self) -> Result<(), CatalogError> {
        self.compact()
    }

    pub fn add_document_collection(
        &self,
        collection: &DocumentCollection,
    ) -> Result<DocumentCollection, CatalogError> {
        let guard = self.write();
        if let Some(existing) = guard.state.collections.get(&collection.short_name) {
            if existing.run_keys == collection.run_keys {
                debug!(collection = %collection.short_name, "collection already registered");
                return Ok(existing.clone());
            }
            return Err(CatalogError::conflict(
                "document collection",
                collection.short_name.clone(),
                format!(
                    "run keys [{}] differ from recorded [{}]",
                    join_run_keys(&collection.run_keys),
                    join_run_keys(&existing.run_keys)
                ),
            ));
        }
        self.commit(
            guard,
            CatalogEvent::CollectionAdded {
                collection: collection.clone(),
            },
        )?;
        info!(collection = %collection.short_name, "registered collection");
        Ok(collection.clone())
    }

    pub fn add_run_key_to_document_collection(
        &self,
        short_name: &str,
        run_key: &RunKey,
    ) -> Result<(), CatalogError> {
        let guard = self.write();
        let collection = guard.state.collection(short_name)?;
        if collection.run_keys.contains(run_key) {
            return Ok(());
        }
        self.commit(
            guard,
            CatalogEvent::RunKeyAdded {
                collection: short_name.to_string(),
                run_key: run_key.clone(),
            },
        )
    }

    pub fn remove_run_key_from_document_collection(
        &self,
        short_name: &str,
        run_key: &RunKey,
    ) -> Result<(), CatalogError> {
        let guard = self.write();
        let collection = guard.state.collection(short_name)?;
        if !collection.run_keys.contains(run_key) {
            return Ok(());
        }
        self.commit(
            guard,
            CatalogEvent::RunKeyRemoved {
                collection: short_name.to_string(),
                run_key: run_key.clone(),
            },
        )
    }

    pub fn get_document_collection_by_short_name(
        &self,
        short_name: &str,
    ) -> Result<DocumentCollection, CatalogError> {
        self.read().state.collection(short_name).cloned()
    }

    pub fn get_document_collections(&self) -> Vec<DocumentCollection> {
        self.read().state.collections.values().cloned().collect()
    }

    pub fn get_document_collection_run_keys(
        &self,
        short_name: &str,
    ) -> Result<BTreeSet<RunKey>, CatalogError> {
        Ok(self.read().state.collection(short_name)?.run_keys.clone())
    }

    /// Registers `document` and links it to `collection` in one journal record.
    /// Returns the stored document, which may carry identifiers merged from an
    /// earlier registration.
    pub fn add_document(
        &self,
        document: &Document,
        collection: &str,
    ) -> Result<Document, CatalogError> {
        let guard = self.write();
        if guard.state.plan_document(document, collection)? {
            self.commit(
                guard,
                CatalogEvent::DocumentAdded {
                    document: document.clone(),
                    collection: collection.to_string(),
                },
            )?;
            debug!(document = %document.display_key(), collection, "registered document");
        } else {
            drop(guard);
        }

        let guard = self.read();
        let (doc_id, _) = guard.state.resolve(document)?;
        Ok(guard.state.entry(doc_id)?.document.clone())
    }

    /// Runs the checks of `add_document` without recording anything.
    pub fn check_document(&self, document: &Document, collection: &str) -> Result<(), CatalogError> {
        self.read()
            .state
            .plan_document(document, collection)
            .map(|_| ())
    }

    /// Records the plain-text rendition produced for a document after it was
    /// first registered.
    pub fn set_document_text_file(
        &self,
        id: &ExternalId,
        text_file: &Utf8Path,
    ) -> Result<(), CatalogError> {
        let guard = self.write();
        let doc_id = guard.state.lookup(id)?;
        match &guard.state.entry(doc_id)?.document.text_file {
            Some(recorded) if recorded == text_file => return Ok(()),
            Some(recorded) => {
                return Err(CatalogError::conflict(
                    "document",
                    id.to_string(),
                    format!("text file {text_file} differs from recorded {recorded}"),
                ));
            }
            None => {}
        }
        self.commit(
            guard,
            CatalogEvent::TextFileSet {
                document: id.clone(),
                text_file: text_file.to_owned(),
            },
        )
    }

    pub fn get_document_by_id(
        &self,
        id_type: IdentifierType,
        value: &str,
    ) -> Result<Document, CatalogError> {
        let id = ExternalId::new(id_type, value)
            .map_err(|_| CatalogError::not_found("document", format!("{id_type}:{value}")))?;
        self.get_document(&id)
    }

    pub fn get_document(&self, id: &ExternalId) -> Result<Document, CatalogError> {
        let guard = self.read();
        let doc_id = guard.state.lookup(id)?;
        Ok(guard.state.entry(doc_id)?.document.clone())
    }

    pub fn get_documents_in_collection(
        &self,
        short_name: &str,
    ) -> Result<Vec<Document>, CatalogError> {
        let guard = self.read();
        guard.state.collection(short_name)?;
        guard
            .state
            .member_ids(short_name)
            .map(|doc_id| Ok(guard.state.entry(doc_id)?.document.clone()))
            .collect()
    }

    pub fn add_annotation_pipeline(
        &self,
        pipeline: &AnnotationPipeline,
    ) -> Result<AnnotationPipeline, CatalogError> {
        let guard = self.write();
        if guard.state.pipelines.get(&pipeline.key()) == Some(pipeline) {
            return Ok(pipeline.clone());
        }
        self.commit(
            guard,
            CatalogEvent::PipelineAdded {
                pipeline: pipeline.clone(),
            },
        )?;
        info!(name = %pipeline.name, version = %pipeline.version, "registered pipeline");
        Ok(pipeline.clone())
    }

    pub fn get_annotation_pipelines(&self) -> Vec<AnnotationPipeline> {
        self.read().state.pipelines.values().cloned().collect()
    }

    pub fn add_annotation_output(
        &self,
        document: &Document,
        output: &AnnotationOutput,
    ) -> Result<(), CatalogError> {
        let guard = self.write();
        let (doc_id, resolved) = guard.state.resolve(document)?;
        let entry = guard.state.entry(doc_id)?;
        let key = (output.run_key.clone(), output.file_path.clone());
        match entry.outputs.get(&key) {
            Some(recorded) if recorded == output => {
                debug!(document = %resolved, run_key = %output.run_key, "output already recorded");
                return Ok(());
            }
            Some(recorded) => {
                return Err(CatalogError::conflict(
                    "annotation output",
                    format!("{resolved} {} {}", output.run_key, output.file_path),
                    format!(
                        "recorded {} annotations at {}, resubmitted {} at {}",
                        recorded.annotation_count,
                        recorded.timestamp.to_rfc3339(),
                        output.annotation_count,
                        output.timestamp.to_rfc3339()
                    ),
                ));
            }
            None => {}
        }
        self.commit(
            guard,
            CatalogEvent::OutputAdded {
                document: resolved,
                output: output.clone(),
            },
        )
    }

    pub fn get_annotation_files_for_document_id(
        &self,
        id_type: IdentifierType,
        value: &str,
        run_key: &RunKey,
    ) -> Result<BTreeSet<Utf8PathBuf>, CatalogError> {
        Ok(self
            .get_annotation_outputs(id_type, value)?
            .into_iter()
            .filter(|output| &output.run_key == run_key)
            .map(|output| output.file_path)
            .collect())
    }

    pub fn get_annotation_outputs(
        &self,
        id_type: IdentifierType,
        value: &str,
    ) -> Result<Vec<AnnotationOutput>, CatalogError> {
        let id = ExternalId::new(id_type, value)
            .map_err(|_| CatalogError::not_found("document", format!("{id_type}:{value}")))?;
        let guard = self.read();
        let doc_id = guard.state.lookup(&id)?;
        Ok(guard.state.entry(doc_id)?.outputs.values().cloned().collect())
    }

    /// Collects, in one pass over each member's outputs, which run keys every
    /// member of the collection has been processed under.
    pub fn observe_collection(
        &self,
        short_name: &str,
    ) -> Result<CollectionObservation, CatalogError> {
        let guard = self.read();
        let collection = guard.state.collection(short_name)?.clone();
        let mut documents = Vec::new();
        for doc_id in guard.state.member_ids(short_name) {
            let entry = guard.state.entry(doc_id)?;
            let mut outputs_per_run_key = BTreeMap::<RunKey, usize>::new();
            for (run_key, _) in entry.outputs.keys() {
                *outputs_per_run_key.entry(run_key.clone()).or_default() += 1;
            }
            documents.push(ObservedDocument {
                document: entry.document.clone(),
                outputs_per_run_key,
            });
        }
        Ok(CollectionObservation {
            collection,
            documents,
        })
    }

    pub fn counts(&self) -> CatalogCounts {
        let guard = self.read();
        CatalogCounts {
            collections: guard.state.collections.len(),
            documents: guard.state.documents.len(),
            pipelines: guard.state.pipelines.len(),
            outputs: guard
                .state
                .documents
                .values()
                .map(|entry| entry.outputs.len())
                .sum(),
        }
    }

    /// Appends `event` to the journal and applies it, then waits for the
    /// record to be durable with the write lock already released.
    fn commit(
        &self,
        mut guard: RwLockWriteGuard<'_, Inner>,
        event: CatalogEvent,
    ) -> Result<(), CatalogError> {
        let (Some(journal), Some(durability)) = (guard.journal.as_mut(), &self.durability) else {
            return Err(CatalogError::ReadOnly(self.root.clone()));
        };
        journal.append(&event)?;
        let seq = durability.appended.fetch_add(1, Ordering::Release) + 1;
        guard.state.apply(&event);
        drop(guard);
        durability.wait(seq)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn join_run_keys(keys: &BTreeSet<RunKey>) -> String {
    keys.iter().map(RunKey::as_str).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct DocId(u64);

#[derive(Debug, Clone)]
struct DocumentEntry {
    document: Document,
    outputs: BTreeMap<(RunKey, Utf8PathBuf), AnnotationOutput>,
}

#[derive(Debug, Default)]
struct CatalogState {
    collections: BTreeMap<String, DocumentCollection>,
    members: BTreeMap<String, BTreeSet<DocId>>,
    documents: BTreeMap<DocId, DocumentEntry>,
    identifiers: HashMap<ExternalId, DocId>,
    pipelines: BTreeMap<(String, String), AnnotationPipeline>,
    next_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum CatalogEvent {
    CollectionAdded {
        collection: DocumentCollection,
    },
    RunKeyAdded {
        collection: String,
        run_key: RunKey,
    },
    RunKeyRemoved {
        collection: String,
        run_key: RunKey,
    },
    DocumentAdded {
        document: Document,
        collection: String,
    },
    TextFileSet {
        document: ExternalId,
        text_file: Utf8PathBuf,
    },
    PipelineAdded {
        pipeline: AnnotationPipeline,
    },
    OutputAdded {
        document: ExternalId,
        output: AnnotationOutput,
    },
}

impl CatalogState {
    fn collection(&self, short_name: &str) -> Result<&DocumentCollection, CatalogError> {
        self.collections
            .get(short_name)
            .ok_or_else(|| CatalogError::not_found("document collection", short_name))
    }

    fn entry(&self, doc_id: DocId) -> Result<&DocumentEntry, CatalogError> {
        self.documents
            .get(&doc_id)
            .ok_or_else(|| CatalogError::not_found("document", format!("#{}", doc_id.0)))
    }

    fn lookup(&self, id: &ExternalId) -> Result<DocId, CatalogError> {
        self.identifiers
            .get(id)
            .copied()
            .ok_or_else(|| CatalogError::not_found("document", id.to_string()))
    }

    /// Finds the stored document owning any of `document`'s identifiers.
    fn resolve(&self, document: &Document) -> Result<(DocId, ExternalId), CatalogError> {
        document
            .identifiers
            .iter()
            .find_map(|id| self.identifiers.get(id).map(|doc_id| (*doc_id, id.clone())))
            .ok_or_else(|| CatalogError::not_found("document", document.display_key()))
    }

    /// Validates a registration against the recorded state. Returns whether it
    /// would change anything.
    fn plan_document(&self, document: &Document, collection: &str) -> Result<bool, CatalogError> {
        if document.identifiers.is_empty() {
            return Err(CatalogError::InvalidDocument(format!(
                "{} has no external identifiers",
                document.local_path
            )));
        }
        self.collection(collection)?;

        let owners: BTreeSet<DocId> = document
            .identifiers
            .iter()
            .filter_map(|id| self.identifiers.get(id).copied())
            .collect();

        let doc_id = match owners.len() {
            0 => return Ok(true),
            1 => owners.iter().next().copied().unwrap_or_default(),
            count => {
                return Err(CatalogError::conflict(
                    "document",
                    document.display_key(),
                    format!("identifiers belong to {count} different catalog documents"),
                ));
            }
        };

        let existing = &self.entry(doc_id)?.document;
        if let Some(field) = existing.metadata_mismatch(document) {
            warn!(
                document = %document.display_key(),
                field,
                "refusing to overwrite recorded document"
            );
            return Err(CatalogError::conflict(
                "document",
                document.display_key(),
                format!("{field} differs from recorded document {}", existing.display_key()),
            ));
        }
        if let (Some(recorded), Some(incoming)) = (&existing.text_file, &document.text_file) {
            if recorded != incoming {
                return Err(CatalogError::conflict(
                    "document",
                    document.display_key(),
                    format!("text file {incoming} differs from recorded {recorded}"),
                ));
            }
        }
        let linked = self
            .members
            .get(collection)
            .is_some_and(|members| members.contains(&doc_id));
        let new_identifiers = !document.identifiers.is_subset(&existing.identifiers);
        let new_text_file = existing.text_file.is_none() && document.text_file.is_some();
        Ok(!linked || new_identifiers || new_text_file)
    }

    fn member_ids(&self, short_name: &str) -> impl Iterator<Item = DocId> + '_ {
        self.members
            .get(short_name)
            .into_iter()
            .flat_map(|members| members.iter().copied())
    }

    fn apply(&mut self, event: &CatalogEvent) {
        match event {
            CatalogEvent::CollectionAdded { collection } => {
                self.collections
                    .insert(collection.short_name.clone(), collection.clone());
            }
            CatalogEvent::RunKeyAdded {
                collection,
                run_key,
            } => match self.collections.get_mut(collection) {
                Some(stored) => {
                    stored.run_keys.insert(run_key.clone());
                }
                None => warn!(collection, "run key added to unknown collection; ignored"),
            },
            CatalogEvent::RunKeyRemoved {
                collection,
                run_key,
            } => {
                if let Some(stored) = self.collections.get_mut(collection) {
                    stored.run_keys.remove(run_key);
                }
            }
            CatalogEvent::DocumentAdded {
                document,
                collection,
            } => {
                let owner = document
                    .identifiers
                    .iter()
                    .find_map(|id| self.identifiers.get(id).copied());
                let doc_id = match owner.and_then(|id| self.documents.get_mut(&id).map(|e| (id, e)))
                {
                    Some((doc_id, entry)) => {
                        entry
                            .document
                            .identifiers
                            .extend(document.identifiers.iter().cloned());
                        if entry.document.text_file.is_none() {
                            entry.document.text_file = document.text_file.clone();
                        }
                        doc_id
                    }
                    None => {
                        let doc_id = DocId(self.next_id);
                        self.next_id += 1;
                        self.documents.insert(
                            doc_id,
                            DocumentEntry {
                                document: document.clone(),
                                outputs: BTreeMap::new(),
                            },
                        );
                        doc_id
                    }
                };
                for id in &document.identifiers {
                    self.identifiers.insert(id.clone(), doc_id);
                }
                self.members
                    .entry(collection.clone())
                    .or_default()
                    .insert(doc_id);
            }
            CatalogEvent::TextFileSet {
                document,
                text_file,
            } => {
                let entry = self
                    .identifiers
                    .get(document)
                    .and_then(|doc_id| self.documents.get_mut(doc_id));
                match entry {
                    Some(entry) => entry.document.text_file = Some(text_file.clone()),
                    None => warn!(document = %document, "text file for unknown document; ignored"),
                }
            }
            CatalogEvent::PipelineAdded { pipeline } => {
                self.pipelines.insert(pipeline.key(), pipeline.clone());
            }
            CatalogEvent::OutputAdded { document, output } => {
                let entry = self
                    .identifiers
                    .get(document)
                    .and_then(|doc_id| self.documents.get_mut(doc_id));
                match entry {
                    Some(entry) => {
                        entry.outputs.insert(
                            (output.run_key.clone(), output.file_path.clone()),
                            output.clone(),
                        );
                    }
                    None => warn!(document = %document, "output for unknown document; ignored"),
                }
            }
        }
    }

    fn to_snapshot(&self) -> Snapshot {
        let mut memberships = BTreeMap::<DocId, BTreeSet<String>>::new();
        for (short_name, members) in &self.members {
            for doc_id in members {
                memberships
                    .entry(*doc_id)
                    .or_default()
                    .insert(short_name.clone());
            }
        }

        Snapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            written_at: Utc::now(),
            collections: self.collections.values().cloned().collect(),
            pipelines: self.pipelines.values().cloned().collect(),
            documents: self
                .documents
                .iter()
                .map(|(doc_id, entry)| SnapshotDocument {
                    document: entry.document.clone(),
                    collections: memberships.remove(doc_id).unwrap_or_default(),
                    outputs: entry.outputs.values().cloned().collect(),
                })
                .collect(),
        }
    }

    fn from_snapshot(snapshot: Snapshot, path: &Utf8Path) -> Result<Self, CatalogError> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(CatalogError::CorruptStore {
                path: path.to_owned(),
                message: format!("unsupported format version {}", snapshot.format_version),
            });
        }

        let mut state = CatalogState::default();
        for collection in snapshot.collections {
            state
                .collections
                .insert(collection.short_name.clone(), collection);
        }
        for pipeline in snapshot.pipelines {
            state.pipelines.insert(pipeline.key(), pipeline);
        }
        for stored in snapshot.documents {
            let doc_id = DocId(state.next_id);
            state.next_id += 1;
            for id in &stored.document.identifiers {
                if state.identifiers.insert(id.clone(), doc_id).is_some() {
                    return Err(CatalogError::CorruptStore {
                        path: path.to_owned(),
                        message: format!("identifier {id} is owned by two documents"),
                    });
                }
            }
            for short_name in stored.collections {
                state.members.entry(short_name).or_default().insert(doc_id);
            }
            let outputs = stored
                .outputs
                .into_iter()
                .map(|output| ((output.run_key.clone(), output.file_path.clone()), output))
                .collect();
            state.documents.insert(
                doc_id,
                DocumentEntry {
                    document: stored.document,
                    outputs,
                },
            );
        }
        Ok(state)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    format_version: u32,
    written_at: DateTime<Utc>,
    collections: Vec<DocumentCollection>,
    pipelines: Vec<AnnotationPipeline>,
    documents: Vec<SnapshotDocument>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    document: Document,
    collections: BTreeSet<String>,
    outputs: Vec<AnnotationOutput>,
}

fn read_snapshot(path: &Utf8Path) -> Result<Snapshot, CatalogError> {
    let file = File::open(path.as_std_path()).map_err(|err| CatalogError::store_io(path, err))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|err| CatalogError::CorruptStore {
        path: path.to_owned(),
        message: err.to_string(),
    })
}

fn write_snapshot(path: &Utf8Path, snapshot: &Snapshot) -> Result<(), CatalogError> {
    let parent = path
        .parent()
        .ok_or_else(|| CatalogError::store_io(path, "snapshot path has no parent"))?;
    let temp = tempfile::Builder::new()
        .prefix("catalog")
        .suffix(".json.tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CatalogError::store_io(parent, err))?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer(&mut writer, snapshot)
            .map_err(|err| CatalogError::store_io(path, err))?;
        writer
            .flush()
            .map_err(|err| CatalogError::store_io(path, err))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|err| CatalogError::store_io(path, err))?;
    temp.persist(path.as_std_path())
        .map_err(|err| CatalogError::store_io(path, err))?;
    Ok(())
}

/// The complete records of a journal file. A trailing record without its
/// newline was never acknowledged; `valid_len` is where it starts.
struct JournalRecords {
    events: Vec<CatalogEvent>,
    valid_len: u64,
    torn: bool,
}

/// Reads the journal before the snapshot. A compaction running concurrently
/// can then only make the snapshot newer than the journal, and replaying
/// idempotent events over a newer snapshot changes nothing.
fn load_state(root: &Utf8Path) -> Result<(CatalogState, JournalRecords), CatalogError> {
    let records = read_journal(&root.join(JOURNAL_FILE))?;

    let snapshot_path = root.join(SNAPSHOT_FILE);
    let mut state = if snapshot_path.as_std_path().exists() {
        CatalogState::from_snapshot(read_snapshot(&snapshot_path)?, &snapshot_path)?
    } else {
        CatalogState::default()
    };
    for event in &records.events {
        state.apply(event);
    }
    Ok((state, records))
}

fn read_journal(path: &Utf8Path) -> Result<JournalRecords, CatalogError> {
    let mut records = JournalRecords {
        events: Vec::new(),
        valid_len: 0,
        torn: false,
    };
    let file = match File::open(path.as_std_path()) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(records),
        Err(err) => return Err(CatalogError::store_io(path, err)),
    };

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|err| CatalogError::CorruptStore {
                path: path.to_owned(),
                message: format!("line {}: {err}", line_no + 1),
            })?;
        if read == 0 {
            break;
        }
        line_no += 1;

        if !line.ends_with('\n') {
            warn!(path = %path, line = line_no, "discarding torn journal record");
            records.torn = true;
            break;
        }

        let text = line.trim();
        if !text.is_empty() {
            let event: CatalogEvent =
                serde_json::from_str(text).map_err(|err| CatalogError::CorruptStore {
                    path: path.to_owned(),
                    message: format!("line {line_no}: {err}"),
                })?;
            records.events.push(event);
        }
        records.valid_len += read as u64;
    }
    Ok(records)
}

struct Journal {
    path: Utf8PathBuf,
    file: File,
}

impl Journal {
    fn open(path: &Utf8Path) -> Result<Self, CatalogError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(|err| CatalogError::store_io(path, err))?;
        Ok(Self {
            path: path.to_owned(),
            file,
        })
    }

    fn append(&mut self, event: &CatalogEvent) -> Result<(), CatalogError> {
        let mut line =
            serde_json::to_vec(event).map_err(|err| CatalogError::store_io(&self.path, err))?;
        line.push(b'\n');

        let len_before = self
            .file
            .metadata()
            .map_err(|err| CatalogError::store_io(&self.path, err))?
            .len();
        if let Err(err) = self.file.write_all(&line) {
            // Cut a partial record so later appends start on a clean line.
            let _ = self.file.set_len(len_before);
            return Err(CatalogError::store_io(&self.path, err));
        }
        Ok(())
    }

    fn truncate(&mut self) -> Result<(), CatalogError> {
        self.file
            .set_len(0)
            .and_then(|()| self.file.sync_all())
            .map_err(|err| CatalogError::store_io(&self.path, err))
    }
}

/// Group commit for journal records. Writers append under the state lock and
/// flush outside it; one `sync_data` covers every record appended before it
/// started, so concurrent writers share flushes instead of queueing on them.
struct Durability {
    path: Utf8PathBuf,
    file: File,
    fsync: bool,
    /// Sequence number of the last appended record.
    appended: AtomicU64,
    /// Sequence number known to be on stable storage.
    synced: Mutex<u64>,
}

impl Durability {
    fn new(journal: &Journal, fsync: bool) -> Result<Self, CatalogError> {
        let file = journal
            .file
            .try_clone()
            .map_err(|err| CatalogError::store_io(&journal.path, err))?;
        Ok(Self {
            path: journal.path.clone(),
            file,
            fsync,
            appended: AtomicU64::new(0),
            synced: Mutex::new(0),
        })
    }

    /// Returns once record `seq` is durable.
    fn wait(&self, seq: u64) -> Result<(), CatalogError> {
        if !self.fsync {
            return Ok(());
        }
        let mut synced = self.synced.lock().unwrap_or_else(PoisonError::into_inner);
        if *synced >= seq {
            return Ok(());
        }
        let target = self.appended.load(Ordering::Acquire);
        self.file
            .sync_data()
            .map_err(|err| CatalogError::store_io(&self.path, err))?;
        *synced = target;
        Ok(())
    }
}

/// Writer lock on `catalog.lock`. The OS releases it when the file is closed,
/// including when the process dies.
struct LockFile {
    _file: File,
}

impl LockFile {
    fn acquire(root: &Utf8Path) -> Result<Self, CatalogError> {
        let path = root.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_std_path())
            .map_err(|err| CatalogError::store_io(&path, err))?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(CatalogError::StoreLocked(root.to_owned()));
            }
            Err(TryLockError::Error(err)) => return Err(CatalogError::store_io(&path, err)),
        }
        file.set_len(0)
            .and_then(|()| {
                writeln!(
                    file,
                    "pid={} acquired={}",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                )
            })
            .map_err(|err| CatalogError::store_io(&path, err))?;
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::FileType;

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("catalog")).unwrap();
        (temp, root)
    }

    fn pmc_document(pmcid: &str) -> Document {
        Document::new(format!("library/{pmcid}.nxml"))
            .with_identifier(ExternalId::pmcid(pmcid).unwrap())
    }

    #[test]
    fn second_handle_is_refused_while_locked() {
        let (_temp, root) = temp_root();
        let store = CatalogStore::open(&root).unwrap();
        assert_matches!(CatalogStore::open(&root), Err(CatalogError::StoreLocked(_)));
        drop(store);
        assert!(CatalogStore::open(&root).is_ok());
    }

    #[test]
    fn lock_file_left_on_disk_does_not_block() {
        let (_temp, root) = temp_root();
        drop(CatalogStore::open(&root).unwrap());
        assert!(root.join(LOCK_FILE).as_std_path().exists());
        assert!(CatalogStore::open(&root).is_ok());
    }

    #[test]
    fn read_only_handle_coexists_with_writer() {
        let (_temp, root) = temp_root();
        let writer = CatalogStore::open(&root).unwrap();
        writer
            .add_document_collection(&DocumentCollection::new("PMC_OA"))
            .unwrap();

        let reader = CatalogStore::open_read_only(&root).unwrap();
        let second = CatalogStore::open_read_only(&root).unwrap();
        assert_eq!(reader.get_document_collections().len(), 1);
        assert_eq!(second.get_document_collections().len(), 1);

        // Readers see the catalog as of their open.
        writer
            .add_document_collection(&DocumentCollection::new("CRAFT"))
            .unwrap();
        assert_eq!(reader.get_document_collections().len(), 1);

        assert_matches!(
            reader.add_document_collection(&DocumentCollection::new("NEW")),
            Err(CatalogError::ReadOnly(_))
        );
        assert_matches!(reader.compact(), Err(CatalogError::ReadOnly(_)));
    }

    #[test]
    fn read_only_handle_skips_torn_tail_without_truncating() {
        let (_temp, root) = temp_root();
        drop(CatalogStore::open(&root).unwrap());
        let journal = root.join(JOURNAL_FILE);
        fs::write(
            journal.as_std_path(),
            b"{\"op\":\"collection_added\",\"collec",
        )
        .unwrap();

        let reader = CatalogStore::open_read_only(&root).unwrap();
        assert!(reader.get_document_collections().is_empty());
        assert!(fs::metadata(journal.as_std_path()).unwrap().len() > 0);
    }

    #[test]
    fn one_flush_covers_every_earlier_record() {
        let (_temp, root) = temp_root();
        fs::create_dir_all(root.as_std_path()).unwrap();
        let journal = Journal::open(&root.join(JOURNAL_FILE)).unwrap();
        let durability = Durability::new(&journal, true).unwrap();
        durability.appended.store(3, Ordering::Release);

        durability.wait(1).unwrap();
        assert_eq!(*durability.synced.lock().unwrap(), 3);
        // Records 2 and 3 were covered by the same flush.
        durability.wait(3).unwrap();
        assert_eq!(*durability.synced.lock().unwrap(), 3);
    }

    #[test]
    fn journal_replays_after_drop() {
        let (_temp, root) = temp_root();
        {
            let store = CatalogStore::open(&root).unwrap();
            store
                .add_document_collection(&DocumentCollection::new("PMC_OA"))
                .unwrap();
            store.add_document(&pmc_document("PMC1"), "PMC_OA").unwrap();
        }
        let store = CatalogStore::open(&root).unwrap();
        let doc = store.get_document_by_id(IdentifierType::Pmcid, "PMC1").unwrap();
        assert_eq!(doc.file_type, FileType::Nxml);
        assert_eq!(store.get_documents_in_collection("PMC_OA").unwrap().len(), 1);
    }

    #[test]
    fn torn_journal_tail_is_discarded() {
        let (_temp, root) = temp_root();
        {
            let store = CatalogStore::open(&root).unwrap();
            store
                .add_document_collection(&DocumentCollection::new("PMC_OA"))
                .unwrap();
        }
        let journal = root.join(JOURNAL_FILE);
        let mut file = OpenOptions::new()
            .append(true)
            .open(journal.as_std_path())
            .unwrap();
        file.write_all(br#"{"op":"collection_added","collec"#).unwrap();
        drop(file);

        let store = CatalogStore::open(&root).unwrap();
        assert_eq!(store.get_document_collections().len(), 1);
        store
            .add_document_collection(&DocumentCollection::new("OTHER"))
            .unwrap();
        drop(store);

        let store = CatalogStore::open(&root).unwrap();
        assert_eq!(store.get_document_collections().len(), 2);
    }

    #[test]
    fn compaction_preserves_state_and_empties_journal() {
        let (_temp, root) = temp_root();
        let store = CatalogStore::open(&root).unwrap();
        let key: RunKey = "CM_CL_v0.5.4".parse().unwrap();
        store
            .add_document_collection(&DocumentCollection::new("PMC_OA").with_run_key(key.clone()))
            .unwrap();
        let doc = store.add_document(&pmc_document("PMC7"), "PMC_OA").unwrap();
        store
            .add_annotation_output(&doc, &AnnotationOutput::new(key.clone(), "out/PMC7.bionlp", 3))
            .unwrap();
        store.close().unwrap();

        let journal_len = fs::metadata(root.join(JOURNAL_FILE).as_std_path())
            .unwrap()
            .len();
        assert_eq!(journal_len, 0);

        let store = CatalogStore::open(&root).unwrap();
        let files = store
            .get_annotation_files_for_document_id(IdentifierType::Pmcid, "PMC7", &key)
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(store.counts().outputs, 1);
    }
}
