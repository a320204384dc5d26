use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portal_core::{
    CronConfig, ManifestLog, PortalUser, SiteConfig, SiteContext, SiteManifest,
    SiteManifestVersionHistory, UserRole, LOG_BATCH_SIZE,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::{ConfigWrite, HistoryWrite, LogWrite, ManifestChangeset, ManifestStore, ManifestWrite};

const MANIFEST_COLUMNS: &str =
    "id, admin_user_id, site_id, site_repo_url, owner, repo, created_at, updated_at";

const HISTORY_COLUMNS: &str = "id, site_manifest_id, added_by, validated_date, file_version, \
     manifest_file_name, latest_commit_hash, is_primary, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgManifestStore {
    pool: PgPool,
}

impl PgManifestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running manifest migrations")
    }

    async fn apply_manifest(tx: &mut Transaction<'_, Postgres>, write: &ManifestWrite) -> Result<()> {
        match write {
            ManifestWrite::Create(m) => {
                sqlx::query(
                    r#"
                    INSERT INTO site_manifest
                        (id, admin_user_id, site_id, site_repo_url, owner, repo, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(m.id)
                .bind(m.admin_user_id)
                .bind(m.site_id)
                .bind(&m.site_repo_url)
                .bind(&m.owner)
                .bind(&m.repo)
                .bind(m.created_at)
                .bind(m.updated_at)
                .execute(&mut **tx)
                .await
                .context("inserting site_manifest")?;
            }
            ManifestWrite::Update(m) => {
                let done = sqlx::query(
                    r#"
                    UPDATE site_manifest
                       SET admin_user_id = $2,
                           site_repo_url = $3,
                           owner = $4,
                           repo = $5,
                           updated_at = $6
                     WHERE id = $1
                    "#,
                )
                .bind(m.id)
                .bind(m.admin_user_id)
                .bind(&m.site_repo_url)
                .bind(&m.owner)
                .bind(&m.repo)
                .bind(m.updated_at)
                .execute(&mut **tx)
                .await
                .context("updating site_manifest")?;
                if done.rows_affected() == 0 {
                    bail!("site manifest {} does not exist", m.id);
                }
            }
            ManifestWrite::Keep { id, site_repo_url } => {
                let stored: Option<String> = sqlx::query_scalar(
                    "SELECT site_repo_url FROM site_manifest WHERE id = $1 FOR UPDATE",
                )
                .bind(id)
                .fetch_optional(&mut **tx)
                .await
                .context("locking site_manifest")?;
                match stored {
                    None => bail!("site manifest {id} does not exist"),
                    Some(stored) if stored != *site_repo_url => bail!(
                        "site manifest {id} now points at {stored}; changeset planned for {site_repo_url} is stale"
                    ),
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    async fn apply_history(
        tx: &mut Transaction<'_, Postgres>,
        manifest_id: Uuid,
        write: &HistoryWrite,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match write {
            HistoryWrite::Clear => {
                sqlx::query("DELETE FROM site_manifest_version_history WHERE site_manifest_id = $1")
                    .bind(manifest_id)
                    .execute(&mut **tx)
                    .await
                    .context("clearing version history")?;
            }
            HistoryWrite::Delete(id) => {
                sqlx::query("DELETE FROM site_manifest_version_history WHERE id = $1")
                    .bind(id)
                    .execute(&mut **tx)
                    .await
                    .context("deleting version history row")?;
            }
            HistoryWrite::Refresh {
                id,
                latest_commit_hash,
                is_primary,
            } => {
                let done = sqlx::query(
                    r#"
                    UPDATE site_manifest_version_history
                       SET latest_commit_hash = $2,
                           is_primary = $3,
                           updated_at = $4
                     WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(latest_commit_hash)
                .bind(is_primary)
                .bind(now)
                .execute(&mut **tx)
                .await
                .context("refreshing version history row")?;
                if done.rows_affected() == 0 {
                    bail!("version history row {id} does not exist");
                }
            }
            HistoryWrite::Insert(row) => {
                sqlx::query(
                    r#"
                    INSERT INTO site_manifest_version_history
                        (id, site_manifest_id, added_by, validated_date, file_version,
                         manifest_file_name, latest_commit_hash, is_primary, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(row.id)
                .bind(row.site_manifest_id)
                .bind(row.added_by)
                .bind(row.validated_date)
                .bind(&row.file_version)
                .bind(&row.manifest_file_name)
                .bind(&row.latest_commit_hash)
                .bind(row.is_primary)
                .bind(row.created_at)
                .bind(row.updated_at)
                .execute(&mut **tx)
                .await
                .context("inserting version history row")?;
            }
        }
        Ok(())
    }

    async fn insert_config(tx: &mut Transaction<'_, Postgres>, config: &SiteConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO site_config
                (id, site_manifest_id, config_name, latest_commit_hash, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(config.id)
        .bind(config.site_manifest_id)
        .bind(&config.config_name)
        .bind(&config.latest_commit_hash)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&mut **tx)
        .await
        .context("inserting site_config")?;
        Ok(())
    }

    async fn apply_config(
        tx: &mut Transaction<'_, Postgres>,
        manifest_id: Uuid,
        write: &ConfigWrite,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match write {
            ConfigWrite::Create(config) => Self::insert_config(tx, config).await?,
            ConfigWrite::Replace(config) => {
                sqlx::query("DELETE FROM site_config WHERE site_manifest_id = $1")
                    .bind(manifest_id)
                    .execute(&mut **tx)
                    .await
                    .context("deleting site_config")?;
                Self::insert_config(tx, config).await?;
            }
            ConfigWrite::RefreshHash { latest_commit_hash } => {
                let done = sqlx::query(
                    "UPDATE site_config SET latest_commit_hash = $2, updated_at = $3 WHERE site_manifest_id = $1",
                )
                .bind(manifest_id)
                .bind(latest_commit_hash)
                .bind(now)
                .execute(&mut **tx)
                .await
                .context("refreshing site_config hash")?;
                if done.rows_affected() == 0 {
                    bail!("site manifest {manifest_id} has no config");
                }
            }
            ConfigWrite::Keep => {}
        }
        Ok(())
    }

    async fn apply_logs(
        tx: &mut Transaction<'_, Postgres>,
        site_id: i64,
        write: &LogWrite,
    ) -> Result<()> {
        match write {
            LogWrite::ClearSite => {
                let done = sqlx::query("DELETE FROM manifest_log WHERE site_id = $1")
                    .bind(site_id)
                    .execute(&mut **tx)
                    .await
                    .context("clearing site manifest logs")?;
                debug!(site_id, deleted = done.rows_affected(), "cleared manifest logs for site");
            }
            LogWrite::ClearFile(name) => {
                sqlx::query("DELETE FROM manifest_log WHERE site_id = $1 AND manifest_file_name = $2")
                    .bind(site_id)
                    .bind(name)
                    .execute(&mut **tx)
                    .await
                    .with_context(|| format!("clearing manifest logs for {name}"))?;
            }
            LogWrite::Insert(rows) => {
                for batch in rows.chunks(LOG_BATCH_SIZE) {
                    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                        "INSERT INTO manifest_log (id, site_id, subtopic_bit_no, subtopic_reported_on, \
                         file_version, manifest_file_name, data, created_at, updated_at) ",
                    );
                    builder.push_values(batch, |mut b, row| {
                        b.push_bind(row.id)
                            .push_bind(row.site_id)
                            .push_bind(row.subtopic_bit_no)
                            .push_bind(row.subtopic_reported_on.clone())
                            .push_bind(row.file_version.clone())
                            .push_bind(row.manifest_file_name.clone())
                            .push_bind(row.data.clone())
                            .push_bind(row.created_at)
                            .push_bind(row.updated_at);
                    });
                    builder
                        .build()
                        .execute(&mut **tx)
                        .await
                        .context("inserting manifest log batch")?;
                }
            }
        }
        Ok(())
    }
}

fn manifest_from_row(row: &PgRow) -> Result<SiteManifest> {
    Ok(SiteManifest {
        id: row.try_get("id")?,
        admin_user_id: row.try_get("admin_user_id")?,
        site_id: row.try_get("site_id")?,
        site_repo_url: row.try_get("site_repo_url")?,
        owner: row.try_get("owner")?,
        repo: row.try_get("repo")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn history_from_row(row: &PgRow) -> Result<SiteManifestVersionHistory> {
    Ok(SiteManifestVersionHistory {
        id: row.try_get("id")?,
        site_manifest_id: row.try_get("site_manifest_id")?,
        added_by: row.try_get("added_by")?,
        validated_date: row.try_get("validated_date")?,
        file_version: row.try_get("file_version")?,
        manifest_file_name: row.try_get("manifest_file_name")?,
        latest_commit_hash: row.try_get("latest_commit_hash")?,
        is_primary: row.try_get("is_primary")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn log_from_row(row: &PgRow) -> Result<ManifestLog> {
    Ok(ManifestLog {
        id: row.try_get("id")?,
        site_id: row.try_get("site_id")?,
        subtopic_bit_no: row.try_get("subtopic_bit_no")?,
        subtopic_reported_on: row.try_get("subtopic_reported_on")?,
        file_version: row.try_get("file_version")?,
        manifest_file_name: row.try_get("manifest_file_name")?,
        data: row.try_get("data")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn cron_from_row(row: &PgRow) -> Result<CronConfig> {
    Ok(CronConfig {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ManifestStore for PgManifestStore {
    async fn site_context(&self, site_id: i64) -> Result<Option<SiteContext>> {
        let row = sqlx::query(
            r#"
            SELECT s.id AS site_id,
                   COALESCE(s.name, '') AS site_name,
                   s.manifest_config_name AS site_manifest_config_name,
                   c.id AS company_id,
                   COALESCE(c.name, '') AS company_name,
                   c.manifest_config_name AS company_manifest_config_name
              FROM site s
              JOIN company c ON c.id = s.company_id
             WHERE s.id = $1
            "#,
        )
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading site context")?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(SiteContext {
            site_id: row.try_get("site_id")?,
            site_name: row.try_get("site_name")?,
            site_manifest_config_name: row.try_get("site_manifest_config_name")?,
            company_id: row.try_get("company_id")?,
            company_name: row.try_get("company_name")?,
            company_manifest_config_name: row.try_get("company_manifest_config_name")?,
        }))
    }

    async fn user(&self, user_id: i64) -> Result<Option<PortalUser>> {
        let row = sqlx::query(
            "SELECT id, first_name, last_name, email, user_type FROM portal_user WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading portal user")?;

        let Some(row) = row else { return Ok(None) };
        let user_type: i16 = row.try_get("user_type")?;
        let role = UserRole::from_id(user_type)
            .with_context(|| format!("user {user_id} has unknown user_type {user_type}"))?;
        Ok(Some(PortalUser {
            id: row.try_get("id")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            email: row.try_get("email")?,
            role,
        }))
    }

    async fn manifest_for_site(&self, site_id: i64) -> Result<Option<SiteManifest>> {
        let row = sqlx::query(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM site_manifest WHERE site_id = $1"
        ))
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading site manifest")?;
        row.as_ref().map(manifest_from_row).transpose()
    }

    async fn manifests(&self) -> Result<Vec<SiteManifest>> {
        let rows = sqlx::query(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM site_manifest ORDER BY site_id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing site manifests")?;
        rows.iter().map(manifest_from_row).collect()
    }

    async fn version_history(
        &self,
        site_manifest_id: Uuid,
    ) -> Result<Vec<SiteManifestVersionHistory>> {
        let rows = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM site_manifest_version_history \
              WHERE site_manifest_id = $1 \
              ORDER BY file_version DESC, manifest_file_name ASC"
        ))
        .bind(site_manifest_id)
        .fetch_all(&self.pool)
        .await
        .context("loading version history")?;
        rows.iter().map(history_from_row).collect()
    }

    async fn site_config(&self, site_manifest_id: Uuid) -> Result<Option<SiteConfig>> {
        let row = sqlx::query(
            r#"
            SELECT id, site_manifest_id, config_name, latest_commit_hash, created_at, updated_at
              FROM site_config
             WHERE site_manifest_id = $1
            "#,
        )
        .bind(site_manifest_id)
        .fetch_optional(&self.pool)
        .await
        .context("loading site config")?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(SiteConfig {
            id: row.try_get("id")?,
            site_manifest_id: row.try_get("site_manifest_id")?,
            config_name: row.try_get("config_name")?,
            latest_commit_hash: row.try_get("latest_commit_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn manifest_logs(
        &self,
        site_id: i64,
        manifest_file_name: Option<&str>,
    ) -> Result<Vec<ManifestLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, site_id, subtopic_bit_no, subtopic_reported_on, file_version,
                   manifest_file_name, data, created_at, updated_at
              FROM manifest_log
             WHERE site_id = $1
               AND ($2::text IS NULL OR manifest_file_name = $2)
             ORDER BY manifest_file_name, subtopic_bit_no
            "#,
        )
        .bind(site_id)
        .bind(manifest_file_name)
        .fetch_all(&self.pool)
        .await
        .context("loading manifest logs")?;
        rows.iter().map(log_from_row).collect()
    }

    async fn apply(&self, changeset: ManifestChangeset) -> Result<SiteManifest> {
        let manifest_id = changeset.manifest_id();
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("opening transaction")?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(changeset.site_id)
            .execute(&mut *tx)
            .await
            .context("locking site for reconciliation")?;

        Self::apply_manifest(&mut tx, &changeset.manifest).await?;
        for write in &changeset.history {
            Self::apply_history(&mut tx, manifest_id, write, now).await?;
        }
        Self::apply_config(&mut tx, manifest_id, &changeset.config, now).await?;
        for write in &changeset.logs {
            Self::apply_logs(&mut tx, changeset.site_id, write).await?;
        }

        let row = sqlx::query(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM site_manifest WHERE id = $1"
        ))
        .bind(manifest_id)
        .fetch_optional(&mut *tx)
        .await
        .context("reloading site manifest")?
        .with_context(|| format!("site manifest {manifest_id} does not exist"))?;
        let manifest = manifest_from_row(&row)?;

        tx.commit().await.context("committing manifest changeset")?;
        debug!(
            site_id = changeset.site_id,
            %manifest_id,
            log_rows = changeset.inserted_log_rows(),
            "manifest changeset committed"
        );
        Ok(manifest)
    }

    async fn cron_config(&self, name: &str) -> Result<Option<CronConfig>> {
        let row = sqlx::query("SELECT id, name, created_at, updated_at FROM cron_config WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("loading cron config")?;
        row.as_ref().map(cron_from_row).transpose()
    }

    async fn touch_cron_config(&self, name: &str, at: DateTime<Utc>) -> Result<CronConfig> {
        let row = sqlx::query(
            r#"
            INSERT INTO cron_config (id, name, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (name) DO UPDATE SET updated_at = EXCLUDED.updated_at
            RETURNING id, name, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .context("upserting cron config")?;
        cron_from_row(&row)
    }
}
