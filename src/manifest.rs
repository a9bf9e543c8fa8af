//! Corpus manifests: the remote party's tab-separated file listing, e.g. the
//! PMC Open Access `oa_file_list.txt`.
//!
//! ```text
//! 2018-05-03 11:41:06
//! oa_package/08/e0/PMC13900.tar.gz	Breast Cancer Res. 2001 Nov 2; 3(1):55-60	PMC13900	PMID:11250746	NO-CC CODE
//! ```

use std::collections::HashMap;
use std::fs;
use std::thread;
use std::time::Duration;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::warn;

use crate::domain::ExternalId;
use crate::error::CatalogError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub line: usize,
    pub remote_path: Utf8PathBuf,
    pub citation: Option<String>,
    pub primary_id: ExternalId,
    pub secondary_id: Option<ExternalId>,
    pub license: Option<String>,
}

impl ManifestEntry {
    pub fn identifiers(&self) -> impl Iterator<Item = &ExternalId> {
        std::iter::once(&self.primary_id).chain(self.secondary_id.as_ref())
    }
}

#[derive(Debug, Default)]
pub struct Manifest {
    /// The header line, usually the listing's generation timestamp.
    pub generated: String,
    pub entries: Vec<ManifestEntry>,
    /// Lines that could not be parsed, as `CatalogError::ManifestParse`.
    pub rejected: Vec<CatalogError>,
}

impl Manifest {
    pub fn parse(content: &str) -> Self {
        let mut lines = content.lines();
        let generated = lines.next().unwrap_or_default().trim().to_string();
        let mut manifest = Manifest {
            generated,
            ..Manifest::default()
        };

        for (index, line) in lines.enumerate() {
            let line_no = index + 2;
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(line_no, line) {
                Ok(entry) => manifest.entries.push(entry),
                Err(err) => {
                    warn!(error = %err, "skipping manifest line");
                    manifest.rejected.push(err);
                }
            }
        }
        manifest
    }

    /// Indexes entries by every identifier they carry. On duplicates the
    /// first entry wins.
    pub fn by_identifier(&self) -> HashMap<&ExternalId, &ManifestEntry> {
        let mut index = HashMap::new();
        for entry in &self.entries {
            for id in entry.identifiers() {
                index.entry(id).or_insert(entry);
            }
        }
        index
    }
}

pub fn parse_line(line_no: usize, line: &str) -> Result<ManifestEntry, CatalogError> {
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
    let parse_error = |message: String| CatalogError::ManifestParse {
        line: line_no,
        message,
    };

    if fields.len() < 3 {
        return Err(parse_error(format!(
            "expected at least 3 tab-separated fields, found {}",
            fields.len()
        )));
    }

    let remote_path = Utf8PathBuf::from(fields[0].trim());
    let safe = !remote_path.as_str().is_empty()
        && remote_path
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)));
    if !safe {
        return Err(parse_error(format!(
            "remote path {remote_path:?} must be relative and stay inside the library"
        )));
    }

    let primary_id = ExternalId::parse_prefixed(fields[2])
        .map_err(|err| parse_error(format!("primary identifier: {err}")))?;

    let secondary_id = fields
        .get(3)
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty() && !raw.ends_with(':'))
        .and_then(|raw| match ExternalId::parse_prefixed(raw) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(line = line_no, error = %err, "ignoring unreadable secondary identifier");
                None
            }
        });

    Ok(ManifestEntry {
        line: line_no,
        remote_path,
        citation: non_empty(fields[1]),
        primary_id,
        secondary_id,
        license: fields.get(4).and_then(|raw| non_empty(raw)),
    })
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Where manifest text comes from.
pub trait ManifestSource: Send + Sync {
    fn fetch(&self) -> Result<String, CatalogError>;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct LocalManifest {
    path: Utf8PathBuf,
}

impl LocalManifest {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ManifestSource for LocalManifest {
    fn fetch(&self) -> Result<String, CatalogError> {
        fs::read_to_string(self.path.as_std_path())
            .map_err(|err| CatalogError::Filesystem(format!("read manifest {}: {err}", self.path)))
    }

    fn describe(&self) -> String {
        self.path.to_string()
    }
}

#[derive(Clone)]
pub struct ManifestHttpClient {
    client: Client,
    url: String,
}

impl ManifestHttpClient {
    pub fn new(url: impl Into<String>) -> Result<Self, CatalogError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("runcat/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CatalogError::ManifestHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| CatalogError::ManifestHttp(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    fn send_with_retries(&self) -> Result<reqwest::blocking::Response, CatalogError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match self.client.get(&self.url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(CatalogError::ManifestHttp(err.to_string()));
                }
            }
        }
    }
}

impl ManifestSource for ManifestHttpClient {
    fn fetch(&self) -> Result<String, CatalogError> {
        let response = self.send_with_retries()?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "manifest request failed".to_string());
            return Err(CatalogError::ManifestStatus { status, message });
        }
        response
            .text()
            .map_err(|err| CatalogError::ManifestHttp(err.to_string()))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Picks the HTTP client for `http(s)://` locations and the local reader
/// otherwise.
pub fn manifest_source(location: &str) -> Result<Box<dyn ManifestSource>, CatalogError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(ManifestHttpClient::new(location)?))
    } else {
        Ok(Box::new(LocalManifest::new(Utf8Path::new(location))))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::IdentifierType;

    #[test]
    fn parse_full_line() {
        let entry = parse_line(
            2,
            "oa_package/08/e0/PMC13900.tar.gz\tBreast Cancer Res. 2001 Nov 2; 3(1):55-60\tPMC13900\tPMID:11250746\tNO-CC CODE",
        )
        .unwrap();
        assert_eq!(entry.remote_path, "oa_package/08/e0/PMC13900.tar.gz");
        assert_eq!(entry.primary_id.id_type(), IdentifierType::Pmcid);
        assert_eq!(entry.secondary_id.unwrap().value(), "11250746");
        assert_eq!(entry.license.as_deref(), Some("NO-CC CODE"));
    }

    #[test]
    fn missing_pmid_is_tolerated() {
        let entry = parse_line(3, "oa_package/b0/ac/PMC13901.tar.gz\tcite\tPMC13901\t\tCC BY").unwrap();
        assert!(entry.secondary_id.is_none());
        let entry = parse_line(4, "oa_package/b0/ac/PMC13902.tar.gz\tcite\tPMC13902\tPMID:").unwrap();
        assert!(entry.secondary_id.is_none());
        assert!(entry.license.is_none());
    }

    #[test]
    fn reject_short_and_escaping_lines() {
        assert_matches!(
            parse_line(5, "oa_package/x.tar.gz\tonly two"),
            Err(CatalogError::ManifestParse { line: 5, .. })
        );
        assert_matches!(
            parse_line(6, "../etc/PMC1.tar.gz\tcite\tPMC1"),
            Err(CatalogError::ManifestParse { line: 6, .. })
        );
    }

    #[test]
    fn header_is_skipped_and_bad_lines_collected() {
        let manifest = Manifest::parse(
            "2018-05-03 11:41:06\n\
             oa_package/08/e0/PMC13900.tar.gz\tcite\tPMC13900\tPMID:11250746\tNO-CC CODE\n\
             garbage\n",
        );
        assert_eq!(manifest.generated, "2018-05-03 11:41:06");
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.rejected.len(), 1);
        let index = manifest.by_identifier();
        assert!(index.contains_key(&ExternalId::pmid("11250746").unwrap()));
    }
}
