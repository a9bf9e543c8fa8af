use std::fmt::Write as _;
use std::io::{self, Write};

use serde::Serialize;

use crate::accounting::MissingRunsMap;
use crate::domain::{AnnotationPipeline, Document, DocumentCollection};
use crate::loader::LoadReport;
use crate::runner::RunReport;
use crate::store::CatalogCounts;
use crate::summary::CatalogSummary;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

/// Plain-text rendering for terminal output.
pub trait TextRender {
    fn render_text(&self) -> String;
}

pub fn print<T: Serialize + TextRender>(mode: OutputMode, value: &T) -> io::Result<()> {
    match mode {
        OutputMode::Json => JsonOutput::print_json(value),
        OutputMode::Text => {
            let mut stdout = io::stdout();
            stdout.write_all(value.render_text().as_bytes())?;
            Ok(())
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl TextRender for Document {
    fn render_text(&self) -> String {
        let mut out = String::new();
        let ids = self
            .identifiers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(out, "{ids}");
        let _ = writeln!(out, "  path: {} ({})", self.local_path, self.file_type);
        if let Some(citation) = &self.citation {
            let _ = writeln!(out, "  citation: {citation}");
        }
        if let Some(license) = &self.license {
            let _ = writeln!(out, "  license: {license}");
        }
        if let Some(text_file) = &self.text_file {
            let _ = writeln!(out, "  text: {text_file}");
        }
        out
    }
}

impl TextRender for DocumentCollection {
    fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{}", self.short_name);
        if let Some(long_name) = &self.long_name {
            let _ = write!(out, " ({long_name})");
        }
        out.push('\n');
        if let Some(description) = &self.description {
            let _ = writeln!(out, "  {description}");
        }
        for key in &self.run_keys {
            let _ = writeln!(out, "  run key: {key}");
        }
        out
    }
}

impl TextRender for AnnotationPipeline {
    fn render_text(&self) -> String {
        format!(
            "{} {} [{}]\n  {}\n",
            self.name, self.version, self.implementation, self.description
        )
    }
}

impl<T: TextRender> TextRender for Vec<T> {
    fn render_text(&self) -> String {
        self.iter().map(TextRender::render_text).collect()
    }
}

impl<T: std::fmt::Display> TextRender for std::collections::BTreeSet<T> {
    fn render_text(&self) -> String {
        self.iter().map(|item| format!("{item}\n")).collect()
    }
}

impl TextRender for MissingRunsMap {
    fn render_text(&self) -> String {
        let mut out = String::new();
        for (run_key, documents) in &self.missing {
            let _ = writeln!(
                out,
                "{} {}: {} missing",
                self.collection,
                run_key,
                documents.len()
            );
            for document in documents {
                let _ = writeln!(out, "  {}", document.display_key());
            }
        }
        out
    }
}

impl TextRender for CatalogSummary {
    fn render_text(&self) -> String {
        let mut out = self.totals.render_text();
        for collection in &self.collections {
            let _ = writeln!(
                out,
                "{} ({} documents)",
                collection.short_name, collection.documents
            );
            for key in &collection.run_keys {
                let marker = if key.declared { "" } else { " (undeclared)" };
                let _ = writeln!(
                    out,
                    "  {}{marker}: {} done, {} missing, {} files",
                    key.run_key, key.documents_processed, key.documents_missing, key.output_files
                );
            }
        }
        out
    }
}

impl TextRender for CatalogCounts {
    fn render_text(&self) -> String {
        format!(
            "collections: {}  documents: {}  pipelines: {}  outputs: {}\n",
            self.collections, self.documents, self.pipelines, self.outputs
        )
    }
}

impl TextRender for LoadReport {
    fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "manifest entries: {} (rejected lines: {})",
            self.manifest_entries, self.rejected_lines
        );
        let _ = writeln!(
            out,
            "artifacts: {}  registered: {}  already cataloged: {}  relocated: {}",
            self.artifacts, self.registered, self.already_cataloged, self.relocated
        );
        for path in &self.unmatched {
            let _ = writeln!(out, "  unmatched: {path}");
        }
        for failure in &self.failed {
            let _ = writeln!(out, "  failed: {}: {}", failure.artifact, failure.error);
        }
        out
    }
}

impl TextRender for RunReport {
    fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}: {} candidates, {} processed, {} outputs recorded",
            self.run_key, self.candidates, self.processed, self.outputs_recorded
        );
        for failure in &self.failed {
            let _ = writeln!(out, "  failed: {}: {}", failure.document, failure.error);
        }
        out
    }
}
