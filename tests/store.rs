use std::process::Command;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{TimeZone, Utc};

use corpus_run_catalog::domain::{
    AnnotationOutput, AnnotationPipeline, Document, DocumentCollection, ExternalId,
    IdentifierType, RunKey,
};
use corpus_run_catalog::error::CatalogError;
use corpus_run_catalog::store::CatalogStore;

fn open_temp() -> (tempfile::TempDir, CatalogStore) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("catalog")).unwrap();
    let store = CatalogStore::open(&root).unwrap();
    (temp, store)
}

fn key(value: &str) -> RunKey {
    value.parse().unwrap()
}

fn article(pmcid: &str, pmid: &str) -> Document {
    Document::new(format!("library/oa_package/{pmcid}.tar.gz"))
        .with_identifier(ExternalId::pmcid(pmcid).unwrap())
        .with_identifier(ExternalId::pmid(pmid).unwrap())
        .with_citation("Breast Cancer Res. 2001 Nov 2; 3(1):55-60")
        .with_license("NO-CC CODE")
}

fn output(run_key: &str, path: &str, count: u64) -> AnnotationOutput {
    AnnotationOutput {
        run_key: key(run_key),
        file_path: Utf8PathBuf::from(path),
        timestamp: Utc.with_ymd_and_hms(2018, 5, 3, 11, 41, 6).unwrap(),
        annotation_count: count,
    }
}

#[test]
fn collection_registration_is_idempotent() {
    let (_temp, store) = open_temp();
    let collection = DocumentCollection::new("PMC_OA").with_run_key(key("CM_CL_v0.5.4"));
    store.add_document_collection(&collection).unwrap();
    store.add_document_collection(&collection).unwrap();
    assert_eq!(store.get_document_collections(), vec![collection]);
}

#[test]
fn collection_with_different_run_keys_conflicts() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA").with_run_key(key("A")))
        .unwrap();
    let err = store
        .add_document_collection(&DocumentCollection::new("PMC_OA").with_run_key(key("B")))
        .unwrap_err();
    assert_matches!(err, CatalogError::Conflict { .. });
}

#[test]
fn run_key_add_and_remove_are_idempotent() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    store
        .add_run_key_to_document_collection("PMC_OA", &key("A"))
        .unwrap();
    store
        .add_run_key_to_document_collection("PMC_OA", &key("A"))
        .unwrap();
    store
        .remove_run_key_from_document_collection("PMC_OA", &key("B"))
        .unwrap();
    let keys = store.get_document_collection_run_keys("PMC_OA").unwrap();
    assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec![key("A")]);

    store
        .remove_run_key_from_document_collection("PMC_OA", &key("A"))
        .unwrap();
    assert!(store.get_document_collection_run_keys("PMC_OA").unwrap().is_empty());
}

#[test]
fn unknown_collection_is_not_found() {
    let (_temp, store) = open_temp();
    assert_matches!(
        store.get_document_collection_by_short_name("NOPE"),
        Err(CatalogError::NotFound { .. })
    );
    assert_matches!(
        store.add_run_key_to_document_collection("NOPE", &key("A")),
        Err(CatalogError::NotFound { .. })
    );
    assert_matches!(
        store.add_document(&article("PMC1", "1"), "NOPE"),
        Err(CatalogError::NotFound { .. })
    );
}

#[test]
fn adding_the_same_document_twice_keeps_one() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    let doc = article("PMC13900", "11250746");
    store.add_document(&doc, "PMC_OA").unwrap();
    store.add_document(&doc, "PMC_OA").unwrap();

    assert_eq!(store.counts().documents, 1);
    assert_eq!(store.get_documents_in_collection("PMC_OA").unwrap().len(), 1);
}

#[test]
fn document_resolves_by_every_identifier() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    store
        .add_document(&article("PMC13900", "11250746"), "PMC_OA")
        .unwrap();

    let by_pmc = store
        .get_document_by_id(IdentifierType::Pmcid, "PMC13900")
        .unwrap();
    let by_pmid = store
        .get_document_by_id(IdentifierType::Pmid, "11250746")
        .unwrap();
    assert_eq!(by_pmc, by_pmid);
    assert_matches!(
        store.get_document_by_id(IdentifierType::Pmid, "999"),
        Err(CatalogError::NotFound { .. })
    );
}

#[test]
fn overlapping_identifier_with_different_source_conflicts() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    store
        .add_document(&article("PMC13900", "11250746"), "PMC_OA")
        .unwrap();

    let mut moved = article("PMC13900", "11250746");
    moved.local_path = Utf8PathBuf::from("elsewhere/PMC13900.tar.gz");
    assert_matches!(
        store.add_document(&moved, "PMC_OA"),
        Err(CatalogError::Conflict { .. })
    );

    // Same PubMed id claimed by a different PMC article.
    let collision = Document::new("library/oa_package/PMC99.tar.gz")
        .with_identifier(ExternalId::pmcid("PMC99").unwrap())
        .with_identifier(ExternalId::pmid("11250746").unwrap())
        .with_citation("Breast Cancer Res. 2001 Nov 2; 3(1):55-60")
        .with_license("NO-CC CODE");
    assert_matches!(
        store.add_document(&collision, "PMC_OA"),
        Err(CatalogError::Conflict { .. })
    );
    assert_eq!(store.counts().documents, 1);
}

#[test]
fn identifiers_spanning_two_documents_conflict() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    let first = Document::new("a.nxml").with_identifier(ExternalId::pmcid("PMC1").unwrap());
    let second = Document::new("a.nxml").with_identifier(ExternalId::pmid("2").unwrap());
    store.add_document(&first, "PMC_OA").unwrap();
    store.add_document(&second, "PMC_OA").unwrap();

    let both = Document::new("a.nxml")
        .with_identifier(ExternalId::pmcid("PMC1").unwrap())
        .with_identifier(ExternalId::pmid("2").unwrap());
    assert_matches!(
        store.add_document(&both, "PMC_OA"),
        Err(CatalogError::Conflict { .. })
    );
}

#[test]
fn additional_identifiers_are_merged() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    let bare = Document::new("a.nxml").with_identifier(ExternalId::pmcid("PMC1").unwrap());
    store.add_document(&bare, "PMC_OA").unwrap();

    let richer = bare.clone().with_identifier(ExternalId::pmid("77").unwrap());
    let stored = store.add_document(&richer, "PMC_OA").unwrap();
    assert_eq!(stored.identifiers.len(), 2);
    assert_eq!(
        store.get_document_by_id(IdentifierType::Pmid, "77").unwrap(),
        stored
    );
}

#[test]
fn document_without_identifiers_is_rejected() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    assert_matches!(
        store.add_document(&Document::new("a.nxml"), "PMC_OA"),
        Err(CatalogError::InvalidDocument(_))
    );
}

#[test]
fn document_links_to_several_collections() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    store
        .add_document_collection(&DocumentCollection::new("CRAFT"))
        .unwrap();
    let doc = article("PMC1", "1");
    store.add_document(&doc, "PMC_OA").unwrap();
    store.add_document(&doc, "CRAFT").unwrap();

    assert_eq!(store.counts().documents, 1);
    assert_eq!(store.get_documents_in_collection("CRAFT").unwrap(), vec![
        store.get_document_by_id(IdentifierType::Pmcid, "PMC1").unwrap()
    ]);
}

#[test]
fn text_file_pointer_can_be_added_once() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    store.add_document(&article("PMC1", "1"), "PMC_OA").unwrap();
    let id = ExternalId::pmcid("PMC1").unwrap();

    store
        .set_document_text_file(&id, Utf8Path::new("text/PMC1.txt"))
        .unwrap();
    store
        .set_document_text_file(&id, Utf8Path::new("text/PMC1.txt"))
        .unwrap();
    assert_matches!(
        store.set_document_text_file(&id, Utf8Path::new("text/other.txt")),
        Err(CatalogError::Conflict { .. })
    );

    // Re-registering the original document does not drop the pointer.
    store.add_document(&article("PMC1", "1"), "PMC_OA").unwrap();
    let doc = store.get_document(&id).unwrap();
    assert_eq!(doc.text_file.as_deref(), Some(Utf8Path::new("text/PMC1.txt")));
}

#[test]
fn pipeline_registration_is_an_upsert() {
    let (_temp, store) = open_temp();
    let mut pipeline = AnnotationPipeline {
        name: "concept-mapper".to_string(),
        description: "dictionary tagger".to_string(),
        implementation: "edu.ucdenver.ccp.nlp.pipelines.ConceptMapper".to_string(),
        version: "0.5.4".to_string(),
    };
    store.add_annotation_pipeline(&pipeline).unwrap();
    store.add_annotation_pipeline(&pipeline).unwrap();
    pipeline.description = "dictionary tagger, CL ontology".to_string();
    store.add_annotation_pipeline(&pipeline).unwrap();

    assert_eq!(store.get_annotation_pipelines(), vec![pipeline.clone()]);

    pipeline.version = "0.5.5".to_string();
    store.add_annotation_pipeline(&pipeline).unwrap();
    assert_eq!(store.get_annotation_pipelines().len(), 2);
}

#[test]
fn output_files_round_trip_per_run_key() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    let doc = store.add_document(&article("PMC1", "1"), "PMC_OA").unwrap();

    store
        .add_annotation_output(&doc, &output("CM_CL_v0.5.4", "out/PMC1.cl.bionlp", 10))
        .unwrap();
    store
        .add_annotation_output(&doc, &output("CM_CL_v0.5.4", "out/PMC1.cl.rdf", 10))
        .unwrap();
    store
        .add_annotation_output(&doc, &output("SENT_v1", "out/PMC1.sent", 4))
        .unwrap();

    let files = store
        .get_annotation_files_for_document_id(IdentifierType::Pmid, "1", &key("CM_CL_v0.5.4"))
        .unwrap();
    let expected: Vec<Utf8PathBuf> = vec!["out/PMC1.cl.bionlp".into(), "out/PMC1.cl.rdf".into()];
    assert_eq!(files.into_iter().collect::<Vec<_>>(), expected);

    let none = store
        .get_annotation_files_for_document_id(IdentifierType::Pmcid, "PMC1", &key("OTHER"))
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn outputs_are_immutable_once_recorded() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    let doc = store.add_document(&article("PMC1", "1"), "PMC_OA").unwrap();
    let recorded = output("A", "out/PMC1.a", 3);

    store.add_annotation_output(&doc, &recorded).unwrap();
    store.add_annotation_output(&doc, &recorded).unwrap();
    assert_eq!(store.counts().outputs, 1);

    let recount = output("A", "out/PMC1.a", 4);
    assert_matches!(
        store.add_annotation_output(&doc, &recount),
        Err(CatalogError::Conflict { .. })
    );
}

#[test]
fn output_for_unknown_document_is_not_found() {
    let (_temp, store) = open_temp();
    assert_matches!(
        store.add_annotation_output(&article("PMC1", "1"), &output("A", "x", 1)),
        Err(CatalogError::NotFound { .. })
    );
}

#[test]
fn state_survives_reopen_with_and_without_compaction() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("catalog")).unwrap();
    {
        let store = CatalogStore::open(&root).unwrap();
        store
            .add_document_collection(&DocumentCollection::new("PMC_OA").with_run_key(key("A")))
            .unwrap();
        let doc = store.add_document(&article("PMC1", "1"), "PMC_OA").unwrap();
        store
            .add_annotation_output(&doc, &output("A", "out/PMC1.a", 3))
            .unwrap();
        store.close().unwrap();
    }
    {
        let store = CatalogStore::open(&root).unwrap();
        let doc = store.get_document_by_id(IdentifierType::Pmid, "1").unwrap();
        // Identical resubmission after reload still counts as already recorded.
        store
            .add_annotation_output(&doc, &output("A", "out/PMC1.a", 3))
            .unwrap();
        store
            .add_annotation_output(&doc, &output("A", "out/PMC1.b", 5))
            .unwrap();
    }
    let store = CatalogStore::open(&root).unwrap();
    assert_eq!(store.counts().outputs, 2);
    assert_eq!(
        store.get_document_collection_run_keys("PMC_OA").unwrap().len(),
        1
    );
}

#[test]
fn concurrent_writers_converge() {
    let (_temp, store) = open_temp();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    let docs: Vec<Document> = (0..8)
        .map(|n| {
            store
                .add_document(&article(&format!("PMC{n}"), &format!("{}", n + 100)), "PMC_OA")
                .unwrap()
        })
        .collect();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for doc in &docs {
                    store
                        .add_annotation_output(doc, &output("A", "out/shared.a", 1))
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(store.counts().outputs, docs.len());
}

#[test]
fn concurrent_outputs_for_different_documents_are_all_durable() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("catalog")).unwrap();
    let store = CatalogStore::open(&root).unwrap();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    let docs: Vec<Document> = (0..6)
        .map(|n| {
            store
                .add_document(&article(&format!("PMC{n}"), &format!("{}", n + 200)), "PMC_OA")
                .unwrap()
        })
        .collect();

    std::thread::scope(|scope| {
        for doc in &docs {
            let store = &store;
            scope.spawn(move || {
                for run in 0..5 {
                    let path = format!("out/{}.{run}", doc.display_key());
                    store
                        .add_annotation_output(doc, &output("A", &path, run))
                        .unwrap();
                }
            });
        }
    });
    drop(store);

    let reopened = CatalogStore::open(&root).unwrap();
    assert_eq!(reopened.counts().outputs, docs.len() * 5);
}

const CRASH_CATALOG_ENV: &str = "RUNCAT_TEST_CRASH_CATALOG";

#[test]
fn writer_lock_dies_with_a_crashed_process() {
    if let Ok(root) = std::env::var(CRASH_CATALOG_ENV) {
        let store = CatalogStore::open(Utf8Path::new(&root)).unwrap();
        store
            .add_document_collection(&DocumentCollection::new("PMC_OA"))
            .unwrap();
        std::process::abort();
    }

    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("catalog")).unwrap();
    let status = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "writer_lock_dies_with_a_crashed_process", "--test-threads=1"])
        .env(CRASH_CATALOG_ENV, root.as_str())
        .status()
        .unwrap();
    assert!(!status.success());

    let store = CatalogStore::open(&root).unwrap();
    assert_eq!(store.get_document_collections().len(), 1);
}

#[test]
fn queries_run_while_a_writer_holds_the_catalog() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("catalog")).unwrap();
    let store = CatalogStore::open(&root).unwrap();
    store
        .add_document_collection(&DocumentCollection::new("PMC_OA"))
        .unwrap();
    store.add_document(&article("PMC1", "1"), "PMC_OA").unwrap();

    assert_matches!(
        CatalogStore::open(&root),
        Err(CatalogError::StoreLocked(_))
    );
    let reader = CatalogStore::open_read_only(&root).unwrap();
    assert_eq!(reader.get_documents_in_collection("PMC_OA").unwrap().len(), 1);
}
