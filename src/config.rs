use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{DocumentCollection, RunKey};
use crate::error::CatalogError;
use crate::store::StoreOptions;

pub const CONFIG_FILE: &str = "runcat.json";
pub const PMC_OA_FILE_LIST_URL: &str = "https://ftp.ncbi.nlm.nih.gov/pub/pmc/oa_file_list.txt";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub catalog_dir: Option<String>,
    #[serde(default)]
    pub library_root: Option<String>,
    #[serde(default)]
    pub manifest_url: Option<String>,
    #[serde(default)]
    pub fsync_journal: Option<bool>,
    #[serde(default)]
    pub collections: Vec<CollectionEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CollectionEntry {
    Shorthand(String),
    Detailed(CollectionEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CollectionEntryObject {
    pub short_name: String,
    #[serde(default)]
    pub long_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub run_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    /// The file the values came from; `None` when running on defaults.
    pub source: Option<PathBuf>,
    pub catalog_dir: Utf8PathBuf,
    pub library_root: Utf8PathBuf,
    pub manifest_url: String,
    pub store_options: StoreOptions,
    pub collections: Vec<DocumentCollection>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `runcat.json` in the current directory when present.
    /// Without either, built-in defaults are used.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CatalogError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CatalogError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CatalogError::ConfigParse(err.to_string()))?;

        let mut resolved = Self::resolve_config(config)?;
        resolved.source = Some(config_path);
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CatalogError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let catalog_dir = match config.catalog_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_data_dir()?.join("catalog"),
        };
        let library_root = match config.library_root {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_data_dir()?.join("library"),
        };

        let collections = config
            .collections
            .into_iter()
            .map(|entry| match entry {
                CollectionEntry::Shorthand(short_name) => Ok(DocumentCollection::new(short_name)),
                CollectionEntry::Detailed(obj) => {
                    let run_keys = obj
                        .run_keys
                        .iter()
                        .map(|key| key.parse::<RunKey>())
                        .collect::<Result<BTreeSet<_>, _>>()?;
                    Ok(DocumentCollection {
                        short_name: obj.short_name,
                        long_name: obj.long_name,
                        description: obj.description,
                        run_keys,
                    })
                }
            })
            .collect::<Result<Vec<_>, CatalogError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            source: None,
            catalog_dir,
            library_root,
            manifest_url: config
                .manifest_url
                .unwrap_or_else(|| PMC_OA_FILE_LIST_URL.to_string()),
            store_options: StoreOptions {
                fsync: config.fsync_journal.unwrap_or(true),
            },
            collections,
        })
    }
}

pub fn default_data_dir() -> Result<Utf8PathBuf, CatalogError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_dir().join("corpus-run-catalog")).ok()
        })
        .ok_or_else(|| CatalogError::Filesystem("unable to resolve data directory".to_string()))
}
