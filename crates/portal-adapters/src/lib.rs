//! Remote repository readers + CSV tabular parsing for manifest repositories.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use portal_core::{
    CsvTable, ManifestError, ManifestResult, RemoteCsvFile, RepoRef, RepoSnapshot,
};
use serde_json::{Map, Number, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

mod github;

pub use github::{classify_failure, GitHubConfig, GitHubReader};

pub const CRATE_NAME: &str = "portal-adapters";

/// Cell values read as "no value", following the pandas defaults.
const NULL_LIKE: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

#[async_trait]
pub trait RepositoryReader: Send + Sync {
    /// Config file plus every `.csv` directly under the repository root.
    async fn fetch_snapshot(&self, repo: &RepoRef) -> ManifestResult<RepoSnapshot>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TabularError {
    #[error("file has no data rows")]
    Empty,
    #[error("file is not valid csv: {0}")]
    Malformed(String),
}

pub fn parse_csv(bytes: &[u8]) -> Result<CsvTable, TabularError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let text = std::str::from_utf8(bytes)
        .map_err(|e| TabularError::Malformed(format!("not utf-8: {e}")))?;
    if text.trim().is_empty() {
        return Err(TabularError::Empty);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| TabularError::Malformed(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();
    for (idx, header) in headers.iter().enumerate() {
        if headers[..idx].contains(header) {
            return Err(TabularError::Malformed(format!("duplicate column {header:?}")));
        }
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| TabularError::Malformed(e.to_string()))?;
        let row: Map<String, JsonValue> = headers
            .iter()
            .zip(record.iter())
            .map(|(header, cell)| (header.clone(), typed_cell(cell)))
            .collect();
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(TabularError::Empty);
    }
    Ok(CsvTable { headers, rows })
}

fn typed_cell(cell: &str) -> JsonValue {
    let trimmed = cell.trim();
    if NULL_LIKE.contains(&trimmed) {
        return JsonValue::Null;
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return JsonValue::Number(int.into());
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float) {
            return JsonValue::Number(number);
        }
    }
    if trimmed.eq_ignore_ascii_case("true") {
        return JsonValue::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return JsonValue::Bool(false);
    }
    JsonValue::String(cell.to_string())
}

/// Raw repository file as handed over by a reader.
#[derive(Debug, Clone)]
pub struct RawFile {
    pub name: String,
    pub bytes: Vec<u8>,
    pub commit_hash: String,
}

/// Parses config + CSV payloads; any bad file rejects the whole snapshot.
pub fn build_snapshot(config: RawFile, csv_files: Vec<RawFile>) -> ManifestResult<RepoSnapshot> {
    let config_json: JsonValue = serde_json::from_slice(&config.bytes).map_err(|e| {
        ManifestError::validation(config.name.clone(), format!("config is not valid json: {e}"))
    })?;

    let mut parsed = Vec::with_capacity(csv_files.len());
    for file in csv_files {
        let table = parse_csv(&file.bytes).map_err(|e| {
            ManifestError::validation(
                file.name.clone(),
                format!("Please check the file and try again ({e})"),
            )
        })?;
        parsed.push(RemoteCsvFile {
            name: file.name,
            commit_hash: file.commit_hash,
            table,
        });
    }
    parsed.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(RepoSnapshot {
        config: config_json,
        config_name: config.name,
        config_commit_hash: config.commit_hash,
        csv_files: parsed,
    })
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serves repositories from `<root>/<owner>/<repo>/`; a file's commit hash is its sha256.
#[derive(Debug, Clone)]
pub struct DirectoryReader {
    root: PathBuf,
    config_file_name: String,
}

impl DirectoryReader {
    pub fn new(root: impl Into<PathBuf>, config_file_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            config_file_name: config_file_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_raw(path: &Path, name: String) -> ManifestResult<RawFile> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManifestError::NotFound(format!(
                    "{} does not exist",
                    path.display()
                )))
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", path.display()))
                    .into())
            }
        };
        Ok(RawFile {
            commit_hash: sha256_hex(&bytes),
            name,
            bytes,
        })
    }
}

#[async_trait]
impl RepositoryReader for DirectoryReader {
    async fn fetch_snapshot(&self, repo: &RepoRef) -> ManifestResult<RepoSnapshot> {
        let dir = self.root.join(&repo.owner).join(&repo.repo);
        let exists = fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking {}", dir.display()))?;
        if !exists {
            return Err(ManifestError::NotFound(format!(
                "repository {} not found",
                repo.full_name()
            )));
        }

        let config = Self::read_raw(
            &dir.join(&self.config_file_name),
            self.config_file_name.clone(),
        )
        .await?;

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|ft| ft.is_file())
                .unwrap_or(false);
            let name = entry.file_name().to_string_lossy().to_string();
            if is_file && name.ends_with(".csv") {
                names.push(name);
            }
        }
        names.sort();

        let mut csv_files = Vec::with_capacity(names.len());
        for name in names {
            csv_files.push(Self::read_raw(&dir.join(&name), name).await?);
        }
        debug!(repo = %repo.full_name(), files = csv_files.len(), "read fixture repository");
        build_snapshot(config, csv_files)
    }
}
