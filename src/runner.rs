//! Driving an external annotation pipeline over the documents a collection
//! still lacks a run key for.

use std::process::Command;

use camino::Utf8PathBuf;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::accounting::missing_for_run_key;
use crate::domain::{AnnotationOutput, AnnotationPipeline, Document, RunKey};
use crate::error::CatalogError;
use crate::store::CatalogStore;

/// An annotation engine. Implementations process one document and return the
/// output files they wrote; the catalog records them.
pub trait AnnotationRunner: Send + Sync {
    fn pipeline(&self) -> AnnotationPipeline;
    fn annotate(
        &self,
        document: &Document,
        run_key: &RunKey,
    ) -> Result<Vec<AnnotationOutput>, CatalogError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_key: String,
    pub candidates: usize,
    pub processed: usize,
    pub outputs_recorded: usize,
    pub failed: Vec<RunFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub document: String,
    pub error: String,
}

pub fn run_missing(
    store: &CatalogStore,
    collection: &str,
    run_key: &RunKey,
    runner: &dyn AnnotationRunner,
    limit: Option<usize>,
) -> Result<RunReport, CatalogError> {
    store.add_annotation_pipeline(&runner.pipeline())?;

    let mut pending = missing_for_run_key(store, collection, run_key)?;
    if let Some(limit) = limit {
        pending.truncate(limit);
    }

    let mut report = RunReport {
        run_key: run_key.to_string(),
        candidates: pending.len(),
        ..RunReport::default()
    };
    info!(collection, run_key = %run_key, candidates = report.candidates, "starting run");

    for document in pending {
        match process_document(store, &document, run_key, runner) {
            Ok(recorded) => {
                report.processed += 1;
                report.outputs_recorded += recorded;
            }
            Err(err @ CatalogError::StoreIo { .. }) => return Err(err),
            Err(err) => {
                warn!(document = %document.display_key(), error = %err, "document failed");
                report.failed.push(RunFailure {
                    document: document.display_key(),
                    error: err.to_string(),
                });
            }
        }
    }

    info!(
        collection,
        run_key = %run_key,
        processed = report.processed,
        failed = report.failed.len(),
        "run finished"
    );
    Ok(report)
}

fn process_document(
    store: &CatalogStore,
    document: &Document,
    run_key: &RunKey,
    runner: &dyn AnnotationRunner,
) -> Result<usize, CatalogError> {
    let outputs = runner.annotate(document, run_key)?;
    if let Some(stray) = outputs.iter().find(|output| &output.run_key != run_key) {
        return Err(CatalogError::Runner {
            document: document.display_key(),
            message: format!("produced output under {} instead of {run_key}", stray.run_key),
        });
    }
    for output in &outputs {
        store.add_annotation_output(document, output)?;
    }
    Ok(outputs.len())
}

/// Runs an external program once per document. The program receives the
/// document through `RUNCAT_INPUT`, `RUNCAT_DOCUMENT` and `RUNCAT_RUN_KEY`
/// and reports each file it wrote on stdout as `path<TAB>annotation_count`.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    pipeline: AnnotationPipeline,
    program: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(pipeline: AnnotationPipeline, program: String, args: Vec<String>) -> Self {
        Self {
            pipeline,
            program,
            args,
        }
    }
}

impl AnnotationRunner for CommandRunner {
    fn pipeline(&self) -> AnnotationPipeline {
        self.pipeline.clone()
    }

    fn annotate(
        &self,
        document: &Document,
        run_key: &RunKey,
    ) -> Result<Vec<AnnotationOutput>, CatalogError> {
        let runner_error = |message: String| CatalogError::Runner {
            document: document.display_key(),
            message,
        };
        let output = Command::new(&self.program)
            .args(&self.args)
            .env("RUNCAT_INPUT", document.local_path.as_str())
            .env("RUNCAT_DOCUMENT", document.display_key())
            .env("RUNCAT_RUN_KEY", run_key.as_str())
            .output()
            .map_err(|err| runner_error(format!("spawn {}: {err}", self.program)))?;
        if !output.status.success() {
            return Err(runner_error(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_reported_outputs(&String::from_utf8_lossy(&output.stdout), run_key)
            .map_err(runner_error)
    }
}

fn parse_reported_outputs(stdout: &str, run_key: &RunKey) -> Result<Vec<AnnotationOutput>, String> {
    let timestamp = Utc::now();
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (path, count) = line.split_once('\t').unwrap_or((line, "0"));
            let annotation_count = count
                .trim()
                .parse::<u64>()
                .map_err(|err| format!("bad annotation count in {line:?}: {err}"))?;
            Ok(AnnotationOutput {
                run_key: run_key.clone(),
                file_path: Utf8PathBuf::from(path.trim()),
                timestamp,
                annotation_count,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_outputs_share_one_timestamp() {
        let key: RunKey = "SENT_v1".parse().unwrap();
        let outputs =
            parse_reported_outputs("out/PMC1.sent\t12\n\nout/PMC1.tok\n", &key).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].annotation_count, 12);
        assert_eq!(outputs[1].annotation_count, 0);
        assert_eq!(outputs[0].timestamp, outputs[1].timestamp);
        assert!(parse_reported_outputs("out/x\tmany\n", &key).is_err());
    }
}
