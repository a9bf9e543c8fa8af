use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

static DOI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^10\.\d{4,9}/\S+$").expect("DOI pattern compiles"));

/// Namespace of an external identifier. The declaration order is the order in
/// which a document's identifiers are listed, so PMC ids come first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    Pmcid,
    Pmid,
    Doi,
    Nihms,
}

impl IdentifierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Pmcid => "pmcid",
            IdentifierType::Pmid => "pmid",
            IdentifierType::Doi => "doi",
            IdentifierType::Nihms => "nihms",
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierType {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pmcid" | "pmc" => Ok(IdentifierType::Pmcid),
            "pmid" => Ok(IdentifierType::Pmid),
            "doi" => Ok(IdentifierType::Doi),
            "nihms" | "mid" => Ok(IdentifierType::Nihms),
            _ => Err(CatalogError::InvalidIdentifier(value.to_string())),
        }
    }
}

/// A (namespace, value) pair naming a document in an outside system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalId {
    #[serde(rename = "type")]
    id_type: IdentifierType,
    value: String,
}

impl ExternalId {
    pub fn new(id_type: IdentifierType, value: &str) -> Result<Self, CatalogError> {
        let trimmed = value.trim();
        let invalid = || CatalogError::InvalidIdentifier(format!("{id_type}:{value}"));
        let normalized = match id_type {
            IdentifierType::Pmid => {
                if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
                    return Err(invalid());
                }
                trimmed.to_string()
            }
            IdentifierType::Pmcid => normalize_numbered(trimmed, "PMC").ok_or_else(invalid)?,
            IdentifierType::Nihms => normalize_numbered(trimmed, "NIHMS").ok_or_else(invalid)?,
            IdentifierType::Doi => {
                let lowered = trimmed.to_ascii_lowercase();
                if !DOI_RE.is_match(&lowered) {
                    return Err(invalid());
                }
                lowered
            }
        };
        Ok(Self {
            id_type,
            value: normalized,
        })
    }

    pub fn pmcid(value: &str) -> Result<Self, CatalogError> {
        Self::new(IdentifierType::Pmcid, value)
    }

    pub fn pmid(value: &str) -> Result<Self, CatalogError> {
        Self::new(IdentifierType::Pmid, value)
    }

    /// Parses the forms found in corpus manifests and file names:
    /// `PMC13900`, `PMID:11250746`, `NIHMS12345`, `10.1186/bcr271`.
    pub fn parse_prefixed(raw: &str) -> Result<Self, CatalogError> {
        let trimmed = raw.trim();
        if let Some((prefix, rest)) = trimmed.split_once(':') {
            if let Ok(id_type) = prefix.parse::<IdentifierType>() {
                return Self::new(id_type, rest);
            }
        }
        let upper = trimmed.to_ascii_uppercase();
        if upper.starts_with("PMC") {
            Self::new(IdentifierType::Pmcid, trimmed)
        } else if upper.starts_with("NIHMS") {
            Self::new(IdentifierType::Nihms, trimmed)
        } else if trimmed.starts_with("10.") {
            Self::new(IdentifierType::Doi, trimmed)
        } else if !trimmed.is_empty() && trimmed.chars().all(|ch| ch.is_ascii_digit()) {
            Self::new(IdentifierType::Pmid, trimmed)
        } else {
            Err(CatalogError::InvalidIdentifier(raw.to_string()))
        }
    }

    pub fn id_type(&self) -> IdentifierType {
        self.id_type
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

fn normalize_numbered(value: &str, prefix: &str) -> Option<String> {
    let upper = value.to_ascii_uppercase();
    let digits = upper.strip_prefix(prefix).unwrap_or(&upper);
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    Some(format!("{prefix}{digits}"))
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id_type, self.value)
    }
}

/// Accepts `type:value` (`pmid:123`, `pmcid:PMC1`) as well as the bare
/// manifest forms handled by [`ExternalId::parse_prefixed`].
impl FromStr for ExternalId {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse_prefixed(value)
    }
}

/// Label of one pipeline-version execution pass, e.g. `CM_CL_v0.5.4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunKey(String);

impl RunKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunKey {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(CatalogError::InvalidRunKey(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for RunKey {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RunKey> for String {
    fn from(value: RunKey) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Nxml,
    Xml,
    Pdf,
    Txt,
    #[serde(rename = "tar.gz")]
    TarGz,
    Other,
}

impl FileType {
    pub fn from_path(path: &Utf8Path) -> Self {
        let name = path.file_name().unwrap_or_default().to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            return FileType::TarGz;
        }
        match path.extension().map(str::to_ascii_lowercase).as_deref() {
            Some("nxml") => FileType::Nxml,
            Some("xml") => FileType::Xml,
            Some("pdf") => FileType::Pdf,
            Some("txt") => FileType::Txt,
            _ => FileType::Other,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::Nxml => write!(f, "nxml"),
            FileType::Xml => write!(f, "xml"),
            FileType::Pdf => write!(f, "pdf"),
            FileType::Txt => write!(f, "txt"),
            FileType::TarGz => write!(f, "tar.gz"),
            FileType::Other => write!(f, "other"),
        }
    }
}

/// One corpus item. Identity is carried by `identifiers`; the remaining
/// fields are metadata compared on re-registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub identifiers: BTreeSet<ExternalId>,
    pub local_path: Utf8PathBuf,
    pub file_type: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_file: Option<Utf8PathBuf>,
}

impl Document {
    pub fn new(local_path: impl Into<Utf8PathBuf>) -> Self {
        let local_path = local_path.into();
        let file_type = FileType::from_path(&local_path);
        Self {
            identifiers: BTreeSet::new(),
            local_path,
            file_type,
            license: None,
            citation: None,
            text_file: None,
        }
    }

    pub fn with_identifier(mut self, id: ExternalId) -> Self {
        self.identifiers.insert(id);
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    pub fn with_citation(mut self, citation: impl Into<String>) -> Self {
        self.citation = Some(citation.into());
        self
    }

    pub fn identifier(&self, id_type: IdentifierType) -> Option<&ExternalId> {
        self.identifiers.iter().find(|id| id.id_type() == id_type)
    }

    /// The identifier used to name the document in logs and reports.
    pub fn primary_identifier(&self) -> Option<&ExternalId> {
        self.identifiers.iter().next()
    }

    pub fn display_key(&self) -> String {
        self.primary_identifier()
            .map(ToString::to_string)
            .unwrap_or_else(|| self.local_path.to_string())
    }

    /// Returns the name of the first material field that differs.
    pub fn metadata_mismatch(&self, other: &Document) -> Option<&'static str> {
        if self.local_path != other.local_path {
            Some("local_path")
        } else if self.file_type != other.file_type {
            Some("file_type")
        } else if self.license != other.license {
            Some("license")
        } else if self.citation != other.citation {
            Some("citation")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCollection {
    pub short_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub run_keys: BTreeSet<RunKey>,
}

impl DocumentCollection {
    pub fn new(short_name: impl Into<String>) -> Self {
        Self {
            short_name: short_name.into(),
            long_name: None,
            description: None,
            run_keys: BTreeSet::new(),
        }
    }

    pub fn with_run_key(mut self, key: RunKey) -> Self {
        self.run_keys.insert(key);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationPipeline {
    pub name: String,
    pub description: String,
    pub implementation: String,
    pub version: String,
}

impl AnnotationPipeline {
    pub fn key(&self) -> (String, String) {
        (self.name.clone(), self.version.clone())
    }
}

/// Record that a document was processed under a run key, producing the file
/// at `file_path`. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationOutput {
    pub run_key: RunKey,
    pub file_path: Utf8PathBuf,
    pub timestamp: DateTime<Utc>,
    pub annotation_count: u64,
}

impl AnnotationOutput {
    pub fn new(run_key: RunKey, file_path: impl Into<Utf8PathBuf>, annotation_count: u64) -> Self {
        Self {
            run_key,
            file_path: file_path.into(),
            timestamp: Utc::now(),
            annotation_count,
        }
    }
}
