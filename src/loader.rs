//! Bulk registration of locally downloaded corpus artifacts.
//!
//! Each artifact under the source directory is matched to a manifest entry by
//! the identifier in its file name, moved to `<library_root>/<remote dir>/`,
//! registered as a document and linked to the target collection. Loading the
//! same manifest again, over the same directory or over the library itself,
//! converges to the same catalog.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{Document, ExternalId};
use crate::error::CatalogError;
use crate::fs_util::{artifact_stem, move_file, walk_files};
use crate::manifest::{Manifest, ManifestEntry, ManifestSource};
use crate::store::CatalogStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub manifest_entries: usize,
    pub rejected_lines: usize,
    pub artifacts: usize,
    pub registered: usize,
    pub already_cataloged: usize,
    pub relocated: usize,
    pub unmatched: Vec<Utf8PathBuf>,
    pub failed: Vec<LoadFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadFailure {
    /// Display form of the path; unreadable entries need not be UTF-8.
    pub artifact: String,
    pub error: String,
}

pub struct BulkLoader<'a> {
    store: &'a CatalogStore,
    library_root: Utf8PathBuf,
}

impl<'a> BulkLoader<'a> {
    pub fn new(store: &'a CatalogStore, library_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            store,
            library_root: library_root.into(),
        }
    }

    pub fn load_from(
        &self,
        source: &dyn ManifestSource,
        source_dir: &Utf8Path,
        collection: &str,
    ) -> Result<LoadReport, CatalogError> {
        info!(manifest = %source.describe(), "reading manifest");
        let manifest = Manifest::parse(&source.fetch()?);
        self.load(&manifest, source_dir, collection)
    }

    /// Per-artifact problems (no manifest entry, an unreadable file name,
    /// conflicting metadata, a file that cannot be moved) are logged and
    /// reported; only store I/O failures, an unknown collection and an
    /// unreadable `source_dir` abort the load.
    pub fn load(
        &self,
        manifest: &Manifest,
        source_dir: &Utf8Path,
        collection: &str,
    ) -> Result<LoadReport, CatalogError> {
        self.store.get_document_collection_by_short_name(collection)?;

        let index = manifest.by_identifier();
        let walk = walk_files(source_dir)?;
        let mut report = LoadReport {
            manifest_entries: manifest.entries.len(),
            rejected_lines: manifest.rejected.len(),
            artifacts: walk.files.len() + walk.skipped.len(),
            ..LoadReport::default()
        };
        report
            .failed
            .extend(walk.skipped.into_iter().map(|skipped| LoadFailure {
                artifact: skipped.path,
                error: skipped.reason,
            }));

        let mut matched = Vec::new();
        for artifact in walk.files {
            let entry = artifact_stem(&artifact)
                .and_then(|stem| ExternalId::parse_prefixed(stem).ok())
                .and_then(|id| index.get(&id).copied());
            match entry {
                Some(entry) => matched.push((artifact, entry)),
                None => {
                    info!(artifact = %artifact, "no manifest entry for artifact; skipped");
                    report.unmatched.push(artifact);
                }
            }
        }
        // The file named like the manifest's remote file claims its entry
        // before any sibling carrying the same identifier.
        matched.sort_by_key(|(artifact, entry)| !is_remote_file(artifact, entry));

        for (artifact, entry) in matched {
            match self.load_artifact(&artifact, entry, collection, &mut report) {
                Ok(()) => {}
                Err(err @ (CatalogError::StoreIo { .. } | CatalogError::NotFound { .. })) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!(artifact = %artifact, error = %err, "failed to load artifact");
                    report.failed.push(LoadFailure {
                        artifact: artifact.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            collection,
            registered = report.registered,
            already_cataloged = report.already_cataloged,
            unmatched = report.unmatched.len(),
            failed = report.failed.len(),
            "bulk load finished"
        );
        Ok(report)
    }

    /// Where an artifact matched to `entry` lives inside the library.
    pub fn library_path(&self, entry: &ManifestEntry, artifact: &Utf8Path) -> Utf8PathBuf {
        let dir = match entry.remote_path.parent() {
            Some(parent) => self.library_root.join(parent),
            None => self.library_root.clone(),
        };
        match artifact.file_name() {
            Some(name) => dir.join(name),
            None => self.library_root.join(&entry.remote_path),
        }
    }

    /// The artifact is validated against the catalog before it is moved and
    /// moved back if registration still fails, so a rejected file stays in
    /// `source_dir`.
    fn load_artifact(
        &self,
        artifact: &Utf8Path,
        entry: &ManifestEntry,
        collection: &str,
        report: &mut LoadReport,
    ) -> Result<(), CatalogError> {
        let target = self.library_path(entry, artifact);
        let mut document = Document::new(target.clone());
        document.identifiers.extend(entry.identifiers().cloned());
        document.citation = entry.citation.clone();
        document.license = entry.license.clone();

        self.store.check_document(&document, collection)?;
        let known = self.store.get_document(&entry.primary_id).is_ok();

        let mut moved = false;
        if target != artifact {
            if target.exists() {
                warn!(
                    artifact = %artifact,
                    target = %target,
                    "library already holds this artifact; source left in place"
                );
            } else {
                move_file(artifact, &target)?;
                debug!(artifact = %artifact, target = %target, "relocated artifact");
                moved = true;
            }
        }

        if let Err(err) = self.store.add_document(&document, collection) {
            if moved {
                match move_file(&target, artifact) {
                    Ok(()) => debug!(artifact = %artifact, "returned artifact after failed registration"),
                    Err(undo) => warn!(
                        artifact = %artifact,
                        target = %target,
                        error = %undo,
                        "artifact left in library after failed registration"
                    ),
                }
            }
            return Err(err);
        }

        if moved {
            report.relocated += 1;
        }
        if known {
            report.already_cataloged += 1;
        } else {
            report.registered += 1;
        }
        Ok(())
    }
}

fn is_remote_file(artifact: &Utf8Path, entry: &ManifestEntry) -> bool {
    artifact.file_name().is_some() && artifact.file_name() == entry.remote_path.file_name()
}
