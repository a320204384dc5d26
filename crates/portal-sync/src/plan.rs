//! Pure planning: version-history diff, log-row ingestion and per-branch changesets.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use portal_core::{
    file_version_from_name, ManifestError, ManifestLog, ManifestResult, ManifestRules,
    RemoteCsvFile, RepoRef, RepoSnapshot, SiteConfig, SiteManifest, SiteManifestVersionHistory,
};
use portal_storage::{ConfigWrite, HistoryWrite, LogWrite, ManifestChangeset, ManifestWrite};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedFile {
    pub id: Uuid,
    pub manifest_file_name: String,
    pub latest_commit_hash: String,
    pub is_primary: bool,
    pub hash_changed: bool,
    pub primary_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedFile {
    pub id: Uuid,
    pub manifest_file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedFile {
    pub manifest_file_name: String,
    pub file_version: String,
    pub latest_commit_hash: String,
    pub is_primary: bool,
}

/// Existing history rows partitioned against a remote file listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionHistoryDiff {
    pub refreshed: Vec<RefreshedFile>,
    pub removed: Vec<RemovedFile>,
    pub added: Vec<AddedFile>,
}

impl VersionHistoryDiff {
    /// New files plus files whose latest commit moved.
    pub fn changed_files(&self) -> Vec<&str> {
        self.added
            .iter()
            .map(|f| f.manifest_file_name.as_str())
            .chain(
                self.refreshed
                    .iter()
                    .filter(|f| f.hash_changed)
                    .map(|f| f.manifest_file_name.as_str()),
            )
            .collect()
    }

    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self
                .refreshed
                .iter()
                .all(|f| !f.hash_changed && !f.primary_changed)
    }

    pub fn history_writes(
        &self,
        site_manifest_id: Uuid,
        added_by: Option<i64>,
        now: DateTime<Utc>,
    ) -> Vec<HistoryWrite> {
        let mut writes: Vec<HistoryWrite> = self
            .removed
            .iter()
            .map(|f| HistoryWrite::Delete(f.id))
            .collect();
        writes.extend(
            self.refreshed
                .iter()
                .filter(|f| f.hash_changed || f.primary_changed)
                .map(|f| HistoryWrite::Refresh {
                    id: f.id,
                    latest_commit_hash: f.latest_commit_hash.clone(),
                    is_primary: f.is_primary,
                }),
        );
        writes.extend(self.added.iter().map(|f| {
            HistoryWrite::Insert(SiteManifestVersionHistory {
                id: Uuid::new_v4(),
                site_manifest_id,
                added_by,
                validated_date: Some(now.date_naive()),
                file_version: f.file_version.clone(),
                manifest_file_name: f.manifest_file_name.clone(),
                latest_commit_hash: f.latest_commit_hash.clone(),
                is_primary: f.is_primary,
                created_at: now,
                updated_at: now,
            })
        }));
        writes
    }
}

pub fn plan_history_diff(
    existing: &[SiteManifestVersionHistory],
    snapshot: &RepoSnapshot,
    primary_file: Option<&str>,
) -> ManifestResult<VersionHistoryDiff> {
    let mut diff = VersionHistoryDiff::default();
    let mut known = BTreeSet::new();

    for row in existing {
        known.insert(row.manifest_file_name.as_str());
        match snapshot.csv_file(&row.manifest_file_name) {
            Some(remote) => {
                let is_primary = primary_file == Some(remote.name.as_str());
                diff.refreshed.push(RefreshedFile {
                    id: row.id,
                    manifest_file_name: row.manifest_file_name.clone(),
                    latest_commit_hash: remote.commit_hash.clone(),
                    is_primary,
                    hash_changed: remote.commit_hash != row.latest_commit_hash,
                    primary_changed: is_primary != row.is_primary,
                });
            }
            None => diff.removed.push(RemovedFile {
                id: row.id,
                manifest_file_name: row.manifest_file_name.clone(),
            }),
        }
    }

    for remote in &snapshot.csv_files {
        if known.contains(remote.name.as_str()) {
            continue;
        }
        diff.added.push(AddedFile {
            manifest_file_name: remote.name.clone(),
            file_version: file_version_from_name(&remote.name)?,
            latest_commit_hash: remote.commit_hash.clone(),
            is_primary: primary_file == Some(remote.name.as_str()),
        });
    }

    Ok(diff)
}

/// One ManifestLog row per CSV data row.
pub fn build_log_rows(
    site_id: i64,
    file: &RemoteCsvFile,
    rules: &ManifestRules,
    now: DateTime<Utc>,
) -> ManifestResult<Vec<ManifestLog>> {
    for column in [&rules.bit_number_column, &rules.reported_on_column] {
        if !file.table.has_column(column) {
            return Err(ManifestError::validation(
                column.as_str(),
                format!("{} has no {column} column", file.name),
            ));
        }
    }
    let file_version = file_version_from_name(&file.name)?;

    file.table
        .rows
        .iter()
        .enumerate()
        .map(|(idx, row)| -> ManifestResult<ManifestLog> {
            let bit_no = bit_number(row.get(&rules.bit_number_column)).ok_or_else(|| {
                ManifestError::validation(
                    rules.bit_number_column.as_str(),
                    format!(
                        "{} row {}: {} is not an integer",
                        file.name,
                        idx + 1,
                        rules.bit_number_column
                    ),
                )
            })?;
            Ok(ManifestLog {
                id: Uuid::new_v4(),
                site_id,
                subtopic_bit_no: bit_no,
                subtopic_reported_on: reported_on(row.get(&rules.reported_on_column)),
                file_version: file_version.clone(),
                manifest_file_name: file.name.clone(),
                data: JsonValue::Object(row.clone()),
                created_at: now,
                updated_at: now,
            })
        })
        .collect()
}

/// `Some(None)` for an empty cell, `None` when the cell is not integral.
fn bit_number(value: Option<&JsonValue>) -> Option<Option<i64>> {
    match value {
        None | Some(JsonValue::Null) => Some(None),
        Some(JsonValue::Number(n)) => match n.as_i64() {
            Some(int) => Some(Some(int)),
            None => n.as_f64().and_then(integral).map(Some),
        },
        Some(JsonValue::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral))
                .map(Some)
        }
        Some(_) => None,
    }
}

fn integral(float: f64) -> Option<i64> {
    (float.is_finite() && float.fract() == 0.0 && float.abs() < i64::MAX as f64)
        .then_some(float as i64)
}

fn reported_on(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Replace-all ingestion of one file.
pub fn ingest_file(
    site_id: i64,
    file: &RemoteCsvFile,
    rules: &ManifestRules,
    now: DateTime<Utc>,
) -> ManifestResult<Vec<LogWrite>> {
    let rows = build_log_rows(site_id, file, rules, now)?;
    Ok(vec![
        LogWrite::ClearFile(file.name.clone()),
        LogWrite::Insert(rows),
    ])
}

/// Inputs shared by the three interactive branches, already validated.
#[derive(Debug, Clone)]
pub struct InteractivePlan<'a> {
    pub site_id: i64,
    pub admin_user_id: i64,
    pub repo_url: &'a str,
    pub repo: &'a RepoRef,
    pub snapshot: &'a RepoSnapshot,
    pub primary_file: &'a str,
    pub rules: &'a ManifestRules,
    pub now: DateTime<Utc>,
}

impl InteractivePlan<'_> {
    fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }

    fn history_row(
        &self,
        site_manifest_id: Uuid,
        file: &RemoteCsvFile,
    ) -> ManifestResult<SiteManifestVersionHistory> {
        Ok(SiteManifestVersionHistory {
            id: Uuid::new_v4(),
            site_manifest_id,
            added_by: Some(self.admin_user_id),
            validated_date: Some(self.today()),
            file_version: file_version_from_name(&file.name)?,
            manifest_file_name: file.name.clone(),
            latest_commit_hash: file.commit_hash.clone(),
            is_primary: file.name == self.primary_file,
            created_at: self.now,
            updated_at: self.now,
        })
    }

    fn site_config(&self, site_manifest_id: Uuid) -> SiteConfig {
        SiteConfig {
            id: Uuid::new_v4(),
            site_manifest_id,
            config_name: self.snapshot.config_name.clone(),
            latest_commit_hash: self.snapshot.config_commit_hash.clone(),
            created_at: self.now,
            updated_at: self.now,
        }
    }

    fn all_rows(&self) -> ManifestResult<Vec<ManifestLog>> {
        let mut rows = Vec::new();
        for file in &self.snapshot.csv_files {
            rows.extend(build_log_rows(self.site_id, file, self.rules, self.now)?);
        }
        Ok(rows)
    }

    /// First validation of a site.
    pub fn create(&self) -> ManifestResult<ManifestChangeset> {
        let manifest = SiteManifest {
            id: Uuid::new_v4(),
            admin_user_id: self.admin_user_id,
            site_id: self.site_id,
            site_repo_url: self.repo_url.to_string(),
            owner: self.repo.owner.clone(),
            repo: self.repo.repo.clone(),
            created_at: self.now,
            updated_at: self.now,
        };

        let mut history = Vec::with_capacity(self.snapshot.csv_files.len());
        let mut logs = Vec::new();
        for file in &self.snapshot.csv_files {
            history.push(HistoryWrite::Insert(self.history_row(manifest.id, file)?));
            logs.extend(ingest_file(self.site_id, file, self.rules, self.now)?);
        }

        Ok(ManifestChangeset {
            site_id: self.site_id,
            config: ConfigWrite::Create(self.site_config(manifest.id)),
            manifest: ManifestWrite::Create(manifest),
            history,
            logs,
        })
    }

    /// Repository URL changed: history, logs and config start over.
    pub fn replace(&self, existing: &SiteManifest) -> ManifestResult<ManifestChangeset> {
        let manifest = SiteManifest {
            admin_user_id: self.admin_user_id,
            site_repo_url: self.repo_url.to_string(),
            owner: self.repo.owner.clone(),
            repo: self.repo.repo.clone(),
            updated_at: self.now,
            ..existing.clone()
        };

        let mut history = vec![HistoryWrite::Clear];
        for file in &self.snapshot.csv_files {
            history.push(HistoryWrite::Insert(self.history_row(manifest.id, file)?));
        }

        Ok(ManifestChangeset {
            site_id: self.site_id,
            config: ConfigWrite::Replace(self.site_config(manifest.id)),
            manifest: ManifestWrite::Update(manifest),
            history,
            logs: vec![LogWrite::ClearSite, LogWrite::Insert(self.all_rows()?)],
        })
    }

    /// Same repository URL: diff the history, re-ingest everything.
    pub fn diff(
        &self,
        existing: &SiteManifest,
        history: &[SiteManifestVersionHistory],
        config: Option<&SiteConfig>,
    ) -> ManifestResult<ManifestChangeset> {
        if config.is_none() {
            return Err(ManifestError::MissingLocal(format!(
                "site manifest {} has no site config",
                existing.id
            )));
        }
        let diff = plan_history_diff(history, self.snapshot, Some(self.primary_file))?;

        Ok(ManifestChangeset {
            site_id: self.site_id,
            manifest: ManifestWrite::Keep {
                id: existing.id,
                site_repo_url: existing.site_repo_url.clone(),
            },
            history: diff.history_writes(existing.id, Some(self.admin_user_id), self.now),
            config: ConfigWrite::RefreshHash {
                latest_commit_hash: self.snapshot.config_commit_hash.clone(),
            },
            logs: vec![LogWrite::ClearSite, LogWrite::Insert(self.all_rows()?)],
        })
    }
}

/// Scheduled drift pass for one site: only new and changed files are re-ingested.
pub fn scheduled_changeset(
    manifest: &SiteManifest,
    history: &[SiteManifestVersionHistory],
    config: Option<&SiteConfig>,
    snapshot: &RepoSnapshot,
    primary_file: Option<&str>,
    rules: &ManifestRules,
    now: DateTime<Utc>,
) -> ManifestResult<(ManifestChangeset, VersionHistoryDiff)> {
    let config = config.ok_or_else(|| {
        ManifestError::MissingLocal(format!("site manifest {} has no site config", manifest.id))
    })?;
    let diff = plan_history_diff(history, snapshot, primary_file)?;

    let mut logs: Vec<LogWrite> = diff
        .removed
        .iter()
        .map(|f| LogWrite::ClearFile(f.manifest_file_name.clone()))
        .collect();
    for name in diff.changed_files() {
        let file = snapshot.csv_file(name).ok_or_else(|| {
            ManifestError::Internal(anyhow::anyhow!("{name} vanished from snapshot"))
        })?;
        logs.extend(ingest_file(manifest.site_id, file, rules, now)?);
    }

    let config_write = if config.latest_commit_hash == snapshot.config_commit_hash {
        ConfigWrite::Keep
    } else {
        ConfigWrite::RefreshHash {
            latest_commit_hash: snapshot.config_commit_hash.clone(),
        }
    };

    let changeset = ManifestChangeset {
        site_id: manifest.site_id,
        manifest: ManifestWrite::Keep {
            id: manifest.id,
            site_repo_url: manifest.site_repo_url.clone(),
        },
        history: diff.history_writes(manifest.id, None, now),
        config: config_write,
        logs,
    };
    Ok((changeset, diff))
}
