//! Manifest record store: persisted manifest tables + atomic changeset application.

use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portal_core::{
    CronConfig, ManifestLog, PortalUser, SiteConfig, SiteContext, SiteManifest,
    SiteManifestVersionHistory, LOG_BATCH_SIZE,
};
use tokio::sync::Mutex;
use uuid::Uuid;

mod postgres;

pub use postgres::PgManifestStore;

pub const CRATE_NAME: &str = "portal-storage";

#[derive(Debug, Clone, PartialEq)]
pub enum ManifestWrite {
    Create(SiteManifest),
    Update(SiteManifest),
    /// Leave the manifest row alone; the stored repo URL must still match.
    Keep { id: Uuid, site_repo_url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryWrite {
    /// Drop every version-history row of the manifest.
    Clear,
    Delete(Uuid),
    Refresh {
        id: Uuid,
        latest_commit_hash: String,
        is_primary: bool,
    },
    Insert(SiteManifestVersionHistory),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWrite {
    Create(SiteConfig),
    /// Delete the manifest's config row, then insert this one.
    Replace(SiteConfig),
    RefreshHash { latest_commit_hash: String },
    Keep,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogWrite {
    ClearSite,
    ClearFile(String),
    Insert(Vec<ManifestLog>),
}

/// All writes of one reconciliation pass for one site; applied as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestChangeset {
    pub site_id: i64,
    pub manifest: ManifestWrite,
    pub history: Vec<HistoryWrite>,
    pub config: ConfigWrite,
    pub logs: Vec<LogWrite>,
}

impl ManifestChangeset {
    pub fn manifest_id(&self) -> Uuid {
        match &self.manifest {
            ManifestWrite::Create(m) | ManifestWrite::Update(m) => m.id,
            ManifestWrite::Keep { id, .. } => *id,
        }
    }

    pub fn inserted_log_rows(&self) -> usize {
        self.logs
            .iter()
            .map(|w| match w {
                LogWrite::Insert(rows) => rows.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.manifest, ManifestWrite::Keep { .. })
            && self.history.is_empty()
            && self.config == ConfigWrite::Keep
            && self.logs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyRecord {
    pub id: i64,
    pub name: String,
    pub manifest_config_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRecord {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
    pub manifest_config_name: Option<String>,
}

#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn site_context(&self, site_id: i64) -> Result<Option<SiteContext>>;

    async fn user(&self, user_id: i64) -> Result<Option<PortalUser>>;

    async fn manifest_for_site(&self, site_id: i64) -> Result<Option<SiteManifest>>;

    async fn manifests(&self) -> Result<Vec<SiteManifest>>;

    /// Ordered newest file-version first, ties by file name.
    async fn version_history(&self, site_manifest_id: Uuid)
        -> Result<Vec<SiteManifestVersionHistory>>;

    async fn site_config(&self, site_manifest_id: Uuid) -> Result<Option<SiteConfig>>;

    async fn manifest_logs(
        &self,
        site_id: i64,
        manifest_file_name: Option<&str>,
    ) -> Result<Vec<ManifestLog>>;

    /// Applies every write of the changeset or none of them.
    async fn apply(&self, changeset: ManifestChangeset) -> Result<SiteManifest>;

    async fn cron_config(&self, name: &str) -> Result<Option<CronConfig>>;

    /// Creates the named marker on first use, bumps `updated_at` afterwards.
    async fn touch_cron_config(&self, name: &str, at: DateTime<Utc>) -> Result<CronConfig>;
}

pub fn sort_version_history(rows: &mut [SiteManifestVersionHistory]) {
    rows.sort_by(|a, b| {
        b.file_version
            .cmp(&a.file_version)
            .then_with(|| a.manifest_file_name.cmp(&b.manifest_file_name))
    });
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    companies: BTreeMap<i64, CompanyRecord>,
    sites: BTreeMap<i64, SiteRecord>,
    users: BTreeMap<i64, PortalUser>,
    manifests: BTreeMap<Uuid, SiteManifest>,
    history: BTreeMap<Uuid, SiteManifestVersionHistory>,
    configs: BTreeMap<Uuid, SiteConfig>,
    logs: Vec<ManifestLog>,
    crons: BTreeMap<String, CronConfig>,
}

/// Process-local store with the same constraints as the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryManifestStore {
    state: Mutex<MemoryState>,
    applied: Mutex<usize>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_company(&self, company: CompanyRecord) {
        self.state.lock().await.companies.insert(company.id, company);
    }

    pub async fn insert_site(&self, site: SiteRecord) {
        self.state.lock().await.sites.insert(site.id, site);
    }

    pub async fn insert_user(&self, user: PortalUser) {
        self.state.lock().await.users.insert(user.id, user);
    }

    /// Number of changesets committed so far.
    pub async fn applied_changesets(&self) -> usize {
        *self.applied.lock().await
    }

    pub async fn history_row_count(&self) -> usize {
        self.state.lock().await.history.len()
    }

    pub async fn log_row_count(&self) -> usize {
        self.state.lock().await.logs.len()
    }
}

impl MemoryState {
    fn apply(&mut self, changeset: ManifestChangeset) -> Result<SiteManifest> {
        let manifest_id = changeset.manifest_id();
        let now = Utc::now();

        match changeset.manifest {
            ManifestWrite::Create(manifest) => {
                if !self.sites.contains_key(&manifest.site_id) {
                    bail!("site {} does not exist", manifest.site_id);
                }
                if self.manifests.values().any(|m| m.site_id == manifest.site_id) {
                    bail!("site {} already has a manifest", manifest.site_id);
                }
                self.manifests.insert(manifest.id, manifest);
            }
            ManifestWrite::Update(manifest) => {
                let Some(slot) = self.manifests.get_mut(&manifest.id) else {
                    bail!("site manifest {} does not exist", manifest.id);
                };
                *slot = manifest;
            }
            ManifestWrite::Keep { id, site_repo_url } => {
                let Some(stored) = self.manifests.get(&id) else {
                    bail!("site manifest {id} does not exist");
                };
                if stored.site_repo_url != site_repo_url {
                    bail!(
                        "site manifest {id} now points at {}; changeset planned for {site_repo_url} is stale",
                        stored.site_repo_url
                    );
                }
            }
        }

        for write in changeset.history {
            match write {
                HistoryWrite::Clear => self
                    .history
                    .retain(|_, row| row.site_manifest_id != manifest_id),
                HistoryWrite::Delete(id) => {
                    self.history.remove(&id);
                }
                HistoryWrite::Refresh {
                    id,
                    latest_commit_hash,
                    is_primary,
                } => {
                    let Some(row) = self.history.get_mut(&id) else {
                        bail!("version history row {id} does not exist");
                    };
                    row.latest_commit_hash = latest_commit_hash;
                    row.is_primary = is_primary;
                    row.updated_at = now;
                }
                HistoryWrite::Insert(row) => {
                    if row.site_manifest_id != manifest_id {
                        bail!("version history row {} belongs to another manifest", row.id);
                    }
                    self.history.insert(row.id, row);
                }
            }
        }

        match changeset.config {
            ConfigWrite::Create(config) => {
                if self.configs.contains_key(&manifest_id) {
                    bail!("site manifest {manifest_id} already has a config");
                }
                self.configs.insert(manifest_id, config);
            }
            ConfigWrite::Replace(config) => {
                self.configs.insert(manifest_id, config);
            }
            ConfigWrite::RefreshHash { latest_commit_hash } => {
                let Some(config) = self.configs.get_mut(&manifest_id) else {
                    bail!("site manifest {manifest_id} has no config");
                };
                config.latest_commit_hash = latest_commit_hash;
                config.updated_at = now;
            }
            ConfigWrite::Keep => {}
        }

        let site_id = changeset.site_id;
        for write in changeset.logs {
            match write {
                LogWrite::ClearSite => self.logs.retain(|log| log.site_id != site_id),
                LogWrite::ClearFile(name) => self
                    .logs
                    .retain(|log| !(log.site_id == site_id && log.manifest_file_name == name)),
                LogWrite::Insert(rows) => {
                    for batch in rows.chunks(LOG_BATCH_SIZE) {
                        self.insert_logs(batch)?;
                    }
                }
            }
        }

        self.manifests
            .get(&manifest_id)
            .cloned()
            .with_context(|| format!("site manifest {manifest_id} vanished during apply"))
    }

    fn insert_logs(&mut self, batch: &[ManifestLog]) -> Result<()> {
        let mut keys: HashSet<(i64, String, i64, String)> = self
            .logs
            .iter()
            .filter_map(|log| log.natural_key())
            .map(|(bit, on, site, version)| (bit, on.to_string(), site, version.to_string()))
            .collect();
        for row in batch {
            if !self.sites.contains_key(&row.site_id) {
                bail!("site {} does not exist", row.site_id);
            }
            if let Some((bit, on, site, version)) = row.natural_key() {
                if !keys.insert((bit, on.to_string(), site, version.to_string())) {
                    bail!(
                        "duplicate manifest log key (bit {bit}, {on:?}, site {site}, version {version:?})"
                    );
                }
            }
        }
        self.logs.extend_from_slice(batch);
        Ok(())
    }
}

#[async_trait]
impl ManifestStore for MemoryManifestStore {
    async fn site_context(&self, site_id: i64) -> Result<Option<SiteContext>> {
        let state = self.state.lock().await;
        let Some(site) = state.sites.get(&site_id) else {
            return Ok(None);
        };
        let company = state
            .companies
            .get(&site.company_id)
            .with_context(|| format!("site {site_id} references missing company"))?;
        Ok(Some(SiteContext {
            site_id,
            site_name: site.name.clone(),
            site_manifest_config_name: site.manifest_config_name.clone(),
            company_id: company.id,
            company_name: company.name.clone(),
            company_manifest_config_name: company.manifest_config_name.clone(),
        }))
    }

    async fn user(&self, user_id: i64) -> Result<Option<PortalUser>> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn manifest_for_site(&self, site_id: i64) -> Result<Option<SiteManifest>> {
        Ok(self
            .state
            .lock()
            .await
            .manifests
            .values()
            .find(|m| m.site_id == site_id)
            .cloned())
    }

    async fn manifests(&self) -> Result<Vec<SiteManifest>> {
        let mut out: Vec<_> = self.state.lock().await.manifests.values().cloned().collect();
        out.sort_by_key(|m| m.site_id);
        Ok(out)
    }

    async fn version_history(
        &self,
        site_manifest_id: Uuid,
    ) -> Result<Vec<SiteManifestVersionHistory>> {
        let mut rows: Vec<_> = self
            .state
            .lock()
            .await
            .history
            .values()
            .filter(|row| row.site_manifest_id == site_manifest_id)
            .cloned()
            .collect();
        sort_version_history(&mut rows);
        Ok(rows)
    }

    async fn site_config(&self, site_manifest_id: Uuid) -> Result<Option<SiteConfig>> {
        Ok(self.state.lock().await.configs.get(&site_manifest_id).cloned())
    }

    async fn manifest_logs(
        &self,
        site_id: i64,
        manifest_file_name: Option<&str>,
    ) -> Result<Vec<ManifestLog>> {
        Ok(self
            .state
            .lock()
            .await
            .logs
            .iter()
            .filter(|log| log.site_id == site_id)
            .filter(|log| manifest_file_name.map_or(true, |name| log.manifest_file_name == name))
            .cloned()
            .collect())
    }

    async fn apply(&self, changeset: ManifestChangeset) -> Result<SiteManifest> {
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let manifest = staged.apply(changeset)?;
        *state = staged;
        *self.applied.lock().await += 1;
        Ok(manifest)
    }

    async fn cron_config(&self, name: &str) -> Result<Option<CronConfig>> {
        Ok(self.state.lock().await.crons.get(name).cloned())
    }

    async fn touch_cron_config(&self, name: &str, at: DateTime<Utc>) -> Result<CronConfig> {
        let mut state = self.state.lock().await;
        let entry = state
            .crons
            .entry(name.to_string())
            .and_modify(|cron| cron.updated_at = at)
            .or_insert_with(|| CronConfig {
                id: Uuid::new_v4(),
                name: name.to_string(),
                created_at: at,
                updated_at: at,
            });
        Ok(entry.clone())
    }
}
