//! Core domain model, naming rules and error taxonomy for the portal manifest subsystem.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "portal-core";

pub const LOG_BATCH_SIZE: usize = 1000;

pub const CRON_LAST_RUN: &str = "cron last run datetime";

/// History listing date format (MM-DD-YYYY).
pub const DATE_FORMAT: &str = "%m-%d-%Y";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("validation failed{}: {message}", field_suffix(.field))]
    Validation {
        field: Option<String>,
        message: String,
    },
    #[error("missing local record: {0}")]
    MissingLocal(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn field_suffix(field: &Option<String>) -> String {
    field
        .as_deref()
        .map(|f| format!(" on {f}"))
        .unwrap_or_default()
}

impl ManifestError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            field: None,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::AuthFailed(_) => 401,
            Self::PermissionDenied(_) | Self::Forbidden(_) => 403,
            Self::RateLimited(_) | Self::Validation { .. } => 400,
            Self::MissingLocal(_) => 404,
            Self::Internal(_) => 500,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

pub type ManifestResult<T> = Result<T, ManifestError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    Admin = 1,
    Staff = 2,
    Customer = 3,
}

impl UserRole {
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(Self::Admin),
            2 => Some(Self::Staff),
            3 => Some(Self::Customer),
            _ => None,
        }
    }

    pub fn id(self) -> i16 {
        self as i16
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalUser {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub role: UserRole,
}

impl PortalUser {
    pub fn require_admin(&self) -> ManifestResult<()> {
        if self.role == UserRole::Admin {
            Ok(())
        } else {
            Err(ManifestError::Forbidden(
                "only admins can manage site manifests".to_string(),
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteContext {
    pub site_id: i64,
    pub site_name: String,
    pub site_manifest_config_name: Option<String>,
    pub company_id: i64,
    pub company_name: String,
    pub company_manifest_config_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteManifest {
    pub id: Uuid,
    pub admin_user_id: i64,
    pub site_id: i64,
    pub site_repo_url: String,
    pub owner: String,
    pub repo: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteManifestVersionHistory {
    pub id: Uuid,
    pub site_manifest_id: Uuid,
    pub added_by: Option<i64>,
    pub validated_date: Option<NaiveDate>,
    pub file_version: String,
    pub manifest_file_name: String,
    pub latest_commit_hash: String,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub id: Uuid,
    pub site_manifest_id: Uuid,
    pub config_name: String,
    pub latest_commit_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestLog {
    pub id: Uuid,
    pub site_id: i64,
    pub subtopic_bit_no: Option<i64>,
    pub subtopic_reported_on: Option<String>,
    pub file_version: String,
    pub manifest_file_name: String,
    pub data: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManifestLog {
    /// Natural key; `None` when a key part is null (null parts never collide).
    pub fn natural_key(&self) -> Option<(i64, &str, i64, &str)> {
        Some((
            self.subtopic_bit_no?,
            self.subtopic_reported_on.as_deref()?,
            self.site_id,
            self.file_version.as_str(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronConfig {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<Map<String, JsonValue>>,
}

impl CsvTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCsvFile {
    pub name: String,
    pub commit_hash: String,
    pub table: CsvTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    pub config: JsonValue,
    pub config_name: String,
    pub config_commit_hash: String,
    pub csv_files: Vec<RemoteCsvFile>,
}

impl RepoSnapshot {
    pub fn csv_file(&self, name: &str) -> Option<&RemoteCsvFile> {
        self.csv_files.iter().find(|f| f.name == name)
    }

    pub fn csv_file_names(&self) -> impl Iterator<Item = &str> {
        self.csv_files.iter().map(|f| f.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestRules {
    pub github_domain: String,
    pub required_owner: String,
    pub repo_name_header: String,
    pub config_file_name: String,
    pub bit_number_column: String,
    pub reported_on_column: String,
}

impl Default for ManifestRules {
    fn default() -> Self {
        Self {
            github_domain: "github.com".to_string(),
            required_owner: "AquaCycl".to_string(),
            repo_name_header: "siteDeployment".to_string(),
            config_file_name: "config.json".to_string(),
            bit_number_column: "subtopicBitNumber".to_string(),
            reported_on_column: "subtopicReportedOn".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

pub fn parse_repo_url(url: &str, rules: &ManifestRules) -> ManifestResult<RepoRef> {
    let url = url.trim();
    if url.is_empty() || !url.contains(&rules.github_domain) {
        return Err(ManifestError::validation(
            "site_repo_url",
            "Please enter a valid repository link",
        ));
    }

    let path = url.trim_end_matches('/');
    let mut segments = path.rsplit('/');
    let repo = segments.next().unwrap_or_default();
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    let owner = segments.next().unwrap_or_default();
    if owner.is_empty() || repo.is_empty() || owner.contains(&rules.github_domain) {
        return Err(ManifestError::validation(
            "site_repo_url",
            "Repository link must end with <owner>/<repo>",
        ));
    }

    if owner != rules.required_owner {
        return Err(ManifestError::validation("site_repo_url", "Invalid repo owner"));
    }
    if repo.split('_').next() != Some(rules.repo_name_header.as_str()) {
        return Err(ManifestError::validation("site_repo_url", "Invalid repo header"));
    }

    Ok(RepoRef {
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}

/// Version label of a manifest file: third `_` segment without its last four characters.
pub fn file_version_from_name(file_name: &str) -> ManifestResult<String> {
    let segment = file_name.split('_').nth(2).ok_or_else(|| {
        ManifestError::validation(
            "manifest_file_name",
            format!("{file_name} does not follow <name>_<part>_<version>.csv"),
        )
    })?;
    let keep = segment.chars().count().saturating_sub(4);
    Ok(segment.chars().take(keep).collect())
}

pub fn manifest_name(file_name: &str) -> String {
    let keep = file_name.chars().count().saturating_sub(4);
    file_name.chars().take(keep).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionConfig {
    pub customer: String,
    #[serde(rename = "siteName")]
    pub site_name: String,
    #[serde(rename = "manifestCSVFilename")]
    pub manifest_csv_filename: String,
}

impl ProductionConfig {
    // Scheduled runs only need the primary file name; a config without one
    // still syncs, with no row marked primary.
    pub fn primary_file_name(config: &JsonValue) -> Option<&str> {
        config
            .get("production")?
            .get("manifestCSVFilename")?
            .as_str()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn from_config(config: &JsonValue) -> ManifestResult<Self> {
        let production = config
            .get("production")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| {
                ManifestError::validation("production", "config has no production section")
            })?;

        let required = |key: &str| -> ManifestResult<String> {
            production
                .get(key)
                .and_then(JsonValue::as_str)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    ManifestError::validation(
                        format!("production.{key}"),
                        format!("production.{key} is missing"),
                    )
                })
        };

        Ok(Self {
            customer: required("customer")?,
            site_name: required("siteName")?,
            manifest_csv_filename: required("manifestCSVFilename")?,
        })
    }

    pub fn check_site<'a>(
        &self,
        site: &SiteContext,
        mut csv_file_names: impl Iterator<Item = &'a str>,
    ) -> ManifestResult<()> {
        if site.company_manifest_config_name.as_deref() != Some(self.customer.as_str()) {
            return Err(ManifestError::validation(
                "production.customer",
                format!(
                    "customer {:?} does not match company {:?}",
                    self.customer, site.company_name
                ),
            ));
        }
        if site.site_manifest_config_name.as_deref() != Some(self.site_name.as_str()) {
            return Err(ManifestError::validation(
                "production.siteName",
                format!(
                    "siteName {:?} does not match site {:?}",
                    self.site_name, site.site_name
                ),
            ));
        }
        if !csv_file_names.any(|name| name == self.manifest_csv_filename) {
            return Err(ManifestError::validation(
                "production.manifestCSVFilename",
                format!(
                    "primary manifest {} is not in the repository root",
                    self.manifest_csv_filename
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryEntry {
    pub id: Uuid,
    pub date: Option<String>,
    pub username: Option<String>,
    pub file_version: String,
    pub company_name: String,
    pub site_name: String,
    pub manifest_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryPage {
    pub total: usize,
    pub next_offset: Option<usize>,
    pub entries: Vec<VersionHistoryEntry>,
}
