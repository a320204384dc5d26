use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use portal_adapters::{sha256_hex, DirectoryReader, RepositoryReader};
use portal_core::{
    ManifestError, ManifestResult, ManifestRules, PortalUser, RepoRef, RepoSnapshot, SiteManifest,
    UserRole, CRON_LAST_RUN,
};
use portal_storage::{CompanyRecord, ManifestStore, MemoryManifestStore, SiteRecord};
use portal_sync::{ManifestSync, ScheduledRunSummary};
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

const NORTH_URL: &str = "https://github.com/AquaCycl/siteDeployment_north";
const SOUTH_URL: &str = "https://github.com/AquaCycl/siteDeployment_south";
const SOUTH2_URL: &str = "https://github.com/AquaCycl/siteDeployment_south2";

const X_CSV: &str = "subtopicBitNumber,subtopicReportedOn,scale\n1,pump_a,0.5\n2,pump_b,1\n";
const Y_CSV: &str = "subtopicBitNumber,subtopicReportedOn,scale\n3,pump_c,2\n";

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    store: Arc<MemoryManifestStore>,
    engine: ManifestSync,
    admin: PortalUser,
}

/// Pauses fetches of one repository until released.
struct GatedReader {
    inner: DirectoryReader,
    repo: &'static str,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl RepositoryReader for GatedReader {
    async fn fetch_snapshot(&self, repo: &RepoRef) -> ManifestResult<RepoSnapshot> {
        if repo.repo == self.repo {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.fetch_snapshot(repo).await
    }
}

fn config_json(customer: &str, site: &str, primary: &str) -> String {
    format!(
        r#"{{"production": {{"customer": "{customer}", "siteName": "{site}", "manifestCSVFilename": "{primary}"}}}}"#
    )
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let store = Arc::new(MemoryManifestStore::new());
        store
            .insert_company(CompanyRecord {
                id: 1,
                name: "Acme Water".into(),
                manifest_config_name: Some("acme".into()),
            })
            .await;
        let sites = [(2, "North Plant", "northPlant"), (3, "South Plant", "southPlant")];
        for (id, name, config_name) in sites {
            store
                .insert_site(SiteRecord {
                    id,
                    company_id: 1,
                    name: name.into(),
                    manifest_config_name: Some(config_name.into()),
                })
                .await;
        }
        let admin = PortalUser {
            id: 11,
            first_name: "Ana".into(),
            last_name: "Ruiz".into(),
            email: "ana@example.com".into(),
            role: UserRole::Admin,
        };
        store.insert_user(admin.clone()).await;

        let engine = ManifestSync::new(
            store.clone(),
            Arc::new(DirectoryReader::new(root.clone(), "config.json")),
            ManifestRules::default(),
        );
        Self {
            _dir: dir,
            root,
            store,
            engine,
            admin,
        }
    }

    fn gated_engine(&self, repo: &'static str) -> (Arc<ManifestSync>, Arc<Notify>, Arc<Notify>) {
        let reached = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let reader = GatedReader {
            inner: DirectoryReader::new(self.root.clone(), "config.json"),
            repo,
            reached: reached.clone(),
            release: release.clone(),
        };
        let engine = ManifestSync::new(self.store.clone(), Arc::new(reader), ManifestRules::default());
        (Arc::new(engine), reached, release)
    }

    /// North on site 2, south (`manifest_old_001.csv`) on site 3, and a
    /// `siteDeployment_south2` repository ready for site 3 to switch to.
    async fn seed_repo_switch(&self) {
        self.seed_north();
        self.write(
            "siteDeployment_south",
            "config.json",
            &config_json("acme", "southPlant", "manifest_old_001.csv"),
        );
        self.write(
            "siteDeployment_south",
            "manifest_old_001.csv",
            "subtopicBitNumber,subtopicReportedOn\n1,tank\n",
        );
        self.write(
            "siteDeployment_south2",
            "config.json",
            &config_json("acme", "southPlant", "manifest_new_002.csv"),
        );
        self.write(
            "siteDeployment_south2",
            "manifest_new_002.csv",
            "subtopicBitNumber,subtopicReportedOn\n2,tank\n3,tank\n",
        );
        self.validate(2, NORTH_URL).await.expect("north");
        self.validate(3, SOUTH_URL).await.expect("south");
    }

    async fn assert_site_on_south2(&self) {
        let manifest = self
            .store
            .manifest_for_site(3)
            .await
            .expect("lookup")
            .expect("manifest");
        assert_eq!(manifest.repo, "siteDeployment_south2");
        assert_eq!(
            self.history_names(manifest.id).await,
            names(&["manifest_new_002.csv"])
        );
        let logs = self.store.manifest_logs(3, None).await.expect("logs");
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.manifest_file_name == "manifest_new_002.csv"));
    }

    fn repo_dir(&self, repo: &str) -> PathBuf {
        self.root.join("AquaCycl").join(repo)
    }

    fn write(&self, repo: &str, name: &str, contents: &str) {
        let dir = self.repo_dir(repo);
        std::fs::create_dir_all(&dir).expect("repo dir");
        std::fs::write(dir.join(name), contents).expect("write fixture");
    }

    fn remove(&self, repo: &str, name: &str) {
        std::fs::remove_file(self.repo_dir(repo).join(name)).expect("remove fixture");
    }

    /// North repository with two manifests, `manifest_x_001.csv` primary.
    fn seed_north(&self) {
        self.write(
            "siteDeployment_north",
            "config.json",
            &config_json("acme", "northPlant", "manifest_x_001.csv"),
        );
        self.write("siteDeployment_north", "manifest_x_001.csv", X_CSV);
        self.write("siteDeployment_north", "manifest_y_001.csv", Y_CSV);
    }

    async fn validate(&self, site_id: i64, url: &str) -> Result<SiteManifest, ManifestError> {
        self.engine
            .validate_or_update_manifest(site_id, url, &self.admin)
            .await
    }

    async fn history_names(&self, manifest_id: Uuid) -> BTreeSet<String> {
        self.store
            .version_history(manifest_id)
            .await
            .expect("history")
            .into_iter()
            .map(|row| row.manifest_file_name)
            .collect()
    }

    async fn log_ids(&self, site_id: i64, file: &str) -> BTreeSet<Uuid> {
        self.store
            .manifest_logs(site_id, Some(file))
            .await
            .expect("logs")
            .into_iter()
            .map(|log| log.id)
            .collect()
    }
}

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn first_validation_creates_manifest_history_logs_and_config() {
    let h = Harness::new().await;
    h.seed_north();

    let manifest = h.validate(2, NORTH_URL).await.expect("create");
    assert_eq!(manifest.site_id, 2);
    assert_eq!(manifest.owner, "AquaCycl");
    assert_eq!(manifest.repo, "siteDeployment_north");
    assert_eq!(manifest.admin_user_id, 11);

    let history = h.store.version_history(manifest.id).await.expect("history");
    assert_eq!(history.len(), 2);
    let primary: Vec<_> = history.iter().filter(|r| r.is_primary).collect();
    assert_eq!(primary.len(), 1);
    assert_eq!(primary[0].manifest_file_name, "manifest_x_001.csv");
    assert!(history.iter().all(|r| r.file_version == "001"));
    assert!(history.iter().all(|r| r.added_by == Some(11)));
    assert!(history
        .iter()
        .all(|r| r.validated_date == Some(Utc::now().date_naive())));
    assert_eq!(history[0].latest_commit_hash, sha256_hex(X_CSV.as_bytes()));

    let logs = h.store.manifest_logs(2, None).await.expect("logs");
    assert_eq!(logs.len(), 3);
    let pump_c = logs
        .iter()
        .find(|l| l.subtopic_reported_on.as_deref() == Some("pump_c"))
        .expect("pump_c row");
    assert_eq!(pump_c.subtopic_bit_no, Some(3));
    assert_eq!(pump_c.manifest_file_name, "manifest_y_001.csv");
    assert_eq!(pump_c.data["scale"], serde_json::json!(2));

    let config = h
        .store
        .site_config(manifest.id)
        .await
        .expect("config lookup")
        .expect("config");
    assert_eq!(config.config_name, "config.json");
    assert_eq!(
        config.latest_commit_hash,
        sha256_hex(config_json("acme", "northPlant", "manifest_x_001.csv").as_bytes())
    );
    assert_eq!(h.store.applied_changesets().await, 1);
}

#[tokio::test]
async fn revalidating_unchanged_repository_is_idempotent() {
    let h = Harness::new().await;
    h.seed_north();
    let first = h.validate(2, NORTH_URL).await.expect("create");
    let before = h.store.version_history(first.id).await.expect("history");

    let second = h.validate(2, NORTH_URL).await.expect("diff");
    assert_eq!(second.id, first.id);
    let after = h.store.version_history(first.id).await.expect("history");
    assert_eq!(before, after);
    assert_eq!(h.store.log_row_count().await, 3);
    assert_eq!(h.store.history_row_count().await, 2);
}

#[tokio::test]
async fn dropped_file_disappears_from_history_and_logs() {
    let h = Harness::new().await;
    h.seed_north();
    let manifest = h.validate(2, NORTH_URL).await.expect("create");
    let x_row = h
        .store
        .version_history(manifest.id)
        .await
        .expect("history")
        .into_iter()
        .find(|r| r.manifest_file_name == "manifest_x_001.csv")
        .expect("x row");

    h.remove("siteDeployment_north", "manifest_y_001.csv");
    h.write(
        "siteDeployment_north",
        "manifest_z_002.csv",
        "subtopicBitNumber,subtopicReportedOn\n9,valve\n",
    );
    h.validate(2, NORTH_URL).await.expect("diff");

    assert_eq!(
        h.history_names(manifest.id).await,
        names(&["manifest_x_001.csv", "manifest_z_002.csv"])
    );
    let history = h.store.version_history(manifest.id).await.expect("history");
    assert_eq!(history[0].manifest_file_name, "manifest_z_002.csv");
    assert!(history.iter().any(|r| r.id == x_row.id));
    assert!(h.log_ids(2, "manifest_y_001.csv").await.is_empty());
    assert_eq!(h.log_ids(2, "manifest_z_002.csv").await.len(), 1);
}

#[tokio::test]
async fn exactly_one_row_is_primary_after_primary_moves() {
    let h = Harness::new().await;
    h.seed_north();
    let manifest = h.validate(2, NORTH_URL).await.expect("create");

    h.write(
        "siteDeployment_north",
        "config.json",
        &config_json("acme", "northPlant", "manifest_y_001.csv"),
    );
    h.validate(2, NORTH_URL).await.expect("diff");

    let history = h.store.version_history(manifest.id).await.expect("history");
    let primary: Vec<_> = history.iter().filter(|r| r.is_primary).collect();
    assert_eq!(primary.len(), 1);
    assert_eq!(primary[0].manifest_file_name, "manifest_y_001.csv");
}

#[tokio::test]
async fn new_repository_url_replaces_rather_than_merges() {
    let h = Harness::new().await;
    h.seed_north();
    let first = h.validate(2, NORTH_URL).await.expect("create");
    let old_ids: BTreeSet<Uuid> = h
        .store
        .version_history(first.id)
        .await
        .expect("history")
        .into_iter()
        .map(|r| r.id)
        .collect();

    h.write(
        "siteDeployment_south",
        "config.json",
        &config_json("acme", "northPlant", "manifest_s_003.csv"),
    );
    h.write(
        "siteDeployment_south",
        "manifest_s_003.csv",
        "subtopicBitNumber,subtopicReportedOn\n40,tank\n41,tank\n",
    );

    let replaced = h.validate(2, SOUTH_URL).await.expect("replace");
    assert_eq!(replaced.id, first.id);
    assert_eq!(replaced.site_repo_url, SOUTH_URL);
    assert_eq!(replaced.repo, "siteDeployment_south");

    let history = h.store.version_history(first.id).await.expect("history");
    assert_eq!(
        history.iter().map(|r| r.manifest_file_name.clone()).collect::<BTreeSet<_>>(),
        names(&["manifest_s_003.csv"])
    );
    assert!(history.iter().all(|r| !old_ids.contains(&r.id)));

    let logs = h.store.manifest_logs(2, None).await.expect("logs");
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|l| l.manifest_file_name == "manifest_s_003.csv"));
}

#[tokio::test]
async fn customer_mismatch_is_rejected_without_writes() {
    let h = Harness::new().await;
    h.seed_north();
    h.write(
        "siteDeployment_north",
        "config.json",
        &config_json("globex", "northPlant", "manifest_x_001.csv"),
    );

    let err = h.validate(2, NORTH_URL).await.expect_err("mismatch");
    assert_eq!(err.field(), Some("production.customer"));
    assert_eq!(h.store.applied_changesets().await, 0);
    assert!(h.store.manifest_for_site(2).await.expect("lookup").is_none());
    assert_eq!(h.store.log_row_count().await, 0);
}

#[tokio::test]
async fn missing_primary_file_and_unversioned_names_are_rejected() {
    let h = Harness::new().await;
    h.seed_north();
    h.write(
        "siteDeployment_north",
        "config.json",
        &config_json("acme", "northPlant", "manifest_q_001.csv"),
    );
    let err = h.validate(2, NORTH_URL).await.expect_err("primary missing");
    assert_eq!(err.field(), Some("production.manifestCSVFilename"));

    h.seed_north();
    h.write("siteDeployment_north", "notes.csv", "a\n1\n");
    let err = h.validate(2, NORTH_URL).await.expect_err("no version");
    assert_eq!(err.field(), Some("manifest_file_name"));
    assert_eq!(h.store.applied_changesets().await, 0);
}

#[tokio::test]
async fn empty_csv_aborts_validation() {
    let h = Harness::new().await;
    h.seed_north();
    h.write(
        "siteDeployment_north",
        "manifest_e_001.csv",
        "subtopicBitNumber,subtopicReportedOn\n",
    );
    let err = h.validate(2, NORTH_URL).await.expect_err("empty csv");
    assert_eq!(err.field(), Some("manifest_e_001.csv"));
    assert_eq!(h.store.applied_changesets().await, 0);
}

#[tokio::test]
async fn non_admin_is_rejected_before_any_io() {
    let h = Harness::new().await;
    let staff = PortalUser {
        role: UserRole::Staff,
        ..h.admin.clone()
    };
    let err = h
        .engine
        .validate_or_update_manifest(2, NORTH_URL, &staff)
        .await
        .expect_err("staff");
    assert!(matches!(err, ManifestError::Forbidden(_)));
    assert_eq!(h.store.applied_changesets().await, 0);
}

#[tokio::test]
async fn duplicate_keys_roll_back_and_keep_previous_rows() {
    let h = Harness::new().await;
    h.seed_north();
    let manifest = h.validate(2, NORTH_URL).await.expect("create");
    let history_before = h.store.version_history(manifest.id).await.expect("history");
    let x_before = h.log_ids(2, "manifest_x_001.csv").await;

    h.write(
        "siteDeployment_north",
        "manifest_x_001.csv",
        "subtopicBitNumber,subtopicReportedOn\n1,pump_a\n1,pump_a\n",
    );
    let err = h.validate(2, NORTH_URL).await.expect_err("duplicate key");
    assert!(err.to_string().contains("duplicate manifest log key"));

    assert_eq!(h.log_ids(2, "manifest_x_001.csv").await, x_before);
    assert_eq!(h.store.log_row_count().await, 3);
    assert_eq!(
        h.store.version_history(manifest.id).await.expect("history"),
        history_before
    );
}

#[tokio::test]
async fn scheduled_run_reingests_only_changed_files() {
    let h = Harness::new().await;
    h.seed_north();
    let manifest = h.validate(2, NORTH_URL).await.expect("create");
    let x_before = h.log_ids(2, "manifest_x_001.csv").await;
    let y_before = h.log_ids(2, "manifest_y_001.csv").await;

    h.write(
        "siteDeployment_north",
        "manifest_y_001.csv",
        "subtopicBitNumber,subtopicReportedOn,scale\n3,pump_c,4\n5,pump_d,1\n",
    );
    h.write(
        "siteDeployment_north",
        "manifest_w_004.csv",
        "subtopicBitNumber,subtopicReportedOn\n7,mixer\n",
    );

    let summary = h.engine.run_scheduled_reconciliation().await.expect("run");
    assert_eq!(summary.sites_total, 1);
    assert_eq!(summary.sites_synced, 1);
    assert_eq!(summary.sites_failed, 0);
    assert_eq!(summary.files_added, 1);
    assert_eq!(summary.files_reingested, 2);
    assert_eq!(summary.files_removed, 0);

    assert_eq!(h.log_ids(2, "manifest_x_001.csv").await, x_before);
    let y_after = h.log_ids(2, "manifest_y_001.csv").await;
    assert_eq!(y_after.len(), 2);
    assert!(y_after.is_disjoint(&y_before));
    assert_eq!(h.log_ids(2, "manifest_w_004.csv").await.len(), 1);

    let history = h.store.version_history(manifest.id).await.expect("history");
    let w = history
        .iter()
        .find(|r| r.manifest_file_name == "manifest_w_004.csv")
        .expect("w row");
    assert_eq!(w.added_by, None);
    let y = history
        .iter()
        .find(|r| r.manifest_file_name == "manifest_y_001.csv")
        .expect("y row");
    assert_eq!(
        y.latest_commit_hash,
        sha256_hex(b"subtopicBitNumber,subtopicReportedOn,scale\n3,pump_c,4\n5,pump_d,1\n")
    );

    let again = h.engine.run_scheduled_reconciliation().await.expect("rerun");
    assert_eq!(again.files_reingested, 0);
    assert_eq!(again.files_added, 0);
}

#[tokio::test]
async fn scheduled_run_removes_logs_of_deleted_files() {
    let h = Harness::new().await;
    h.seed_north();
    let manifest = h.validate(2, NORTH_URL).await.expect("create");

    h.remove("siteDeployment_north", "manifest_y_001.csv");
    let summary = h.engine.run_scheduled_reconciliation().await.expect("run");
    assert_eq!(summary.files_removed, 1);
    assert!(h.log_ids(2, "manifest_y_001.csv").await.is_empty());
    assert_eq!(
        h.history_names(manifest.id).await,
        names(&["manifest_x_001.csv"])
    );
}

#[tokio::test]
async fn scheduled_failure_on_one_site_does_not_stop_others() {
    let h = Harness::new().await;
    h.seed_north();
    h.write(
        "siteDeployment_south",
        "config.json",
        &config_json("acme", "southPlant", "manifest_s_001.csv"),
    );
    h.write(
        "siteDeployment_south",
        "manifest_s_001.csv",
        "subtopicBitNumber,subtopicReportedOn\n1,tank\n",
    );
    h.validate(2, NORTH_URL).await.expect("north");
    h.validate(3, SOUTH_URL).await.expect("south");

    std::fs::remove_dir_all(h.repo_dir("siteDeployment_south")).expect("drop south");
    h.write(
        "siteDeployment_north",
        "manifest_x_001.csv",
        "subtopicBitNumber,subtopicReportedOn,scale\n1,pump_a,9\n",
    );

    let summary = h.engine.run_scheduled_reconciliation().await.expect("run");
    assert_eq!(summary.sites_total, 2);
    assert_eq!(summary.sites_synced, 1);
    assert_eq!(summary.sites_failed, 1);
    assert_eq!(h.log_ids(2, "manifest_x_001.csv").await.len(), 1);
    assert_eq!(h.log_ids(3, "manifest_s_001.csv").await.len(), 1);

    let marker = h
        .store
        .cron_config(CRON_LAST_RUN)
        .await
        .expect("lookup")
        .expect("marker");
    assert_eq!(marker.updated_at, summary.finished_at);
}

#[tokio::test]
async fn history_page_formats_entries_and_pages() {
    let h = Harness::new().await;
    h.seed_north();
    h.write(
        "siteDeployment_north",
        "manifest_z_002.csv",
        "subtopicBitNumber,subtopicReportedOn\n9,valve\n",
    );
    h.validate(2, NORTH_URL).await.expect("create");

    let page = h
        .engine
        .version_history_page(2, 0, 2, &h.admin)
        .await
        .expect("page");
    assert_eq!(page.total, 3);
    assert_eq!(page.next_offset, Some(2));
    assert_eq!(page.entries.len(), 2);
    let first = &page.entries[0];
    assert_eq!(first.manifest_name, "manifest_z_002");
    assert_eq!(first.file_version, "002");
    assert_eq!(first.username.as_deref(), Some("Ana"));
    assert_eq!(first.company_name, "Acme Water");
    assert_eq!(first.site_name, "North Plant");
    assert_eq!(
        first.date.as_deref(),
        Some(Utc::now().date_naive().format("%m-%d-%Y").to_string().as_str())
    );

    let last = h
        .engine
        .version_history_page(2, 2, 2, &h.admin)
        .await
        .expect("page");
    assert_eq!(last.entries.len(), 1);
    assert_eq!(last.next_offset, None);
}

#[tokio::test]
async fn scheduled_run_follows_repo_switch_made_mid_run() {
    let h = Harness::new().await;
    h.seed_repo_switch().await;
    let (scheduled, reached, release) = h.gated_engine("siteDeployment_north");

    let run = tokio::spawn({
        let scheduled = scheduled.clone();
        async move { scheduled.run_scheduled_reconciliation().await }
    });
    reached.notified().await;
    h.validate(3, SOUTH2_URL).await.expect("switch");
    release.notify_one();

    let summary: ScheduledRunSummary = run.await.expect("join").expect("run");
    assert_eq!(summary.sites_synced, 2);
    assert_eq!(summary.sites_failed, 0);
    h.assert_site_on_south2().await;
}

#[tokio::test]
async fn scheduled_plan_for_replaced_repo_is_not_applied() {
    let h = Harness::new().await;
    h.seed_repo_switch().await;
    h.write(
        "siteDeployment_south",
        "manifest_old_001.csv",
        "subtopicBitNumber,subtopicReportedOn\n1,tank\n4,tank\n",
    );
    let (scheduled, reached, release) = h.gated_engine("siteDeployment_south");

    let run = tokio::spawn({
        let scheduled = scheduled.clone();
        async move { scheduled.run_scheduled_reconciliation().await }
    });
    reached.notified().await;
    h.validate(3, SOUTH2_URL).await.expect("switch");
    release.notify_one();

    let summary = run.await.expect("join").expect("run");
    assert_eq!(summary.sites_synced, 1);
    assert_eq!(summary.sites_failed, 1);
    h.assert_site_on_south2().await;
}

#[tokio::test]
async fn scheduled_run_only_needs_primary_file_name_from_config() {
    let h = Harness::new().await;
    h.seed_north();
    let manifest = h.validate(2, NORTH_URL).await.expect("create");

    h.write(
        "siteDeployment_north",
        "config.json",
        r#"{"production": {"siteName": "northPlant", "manifestCSVFilename": "manifest_x_001.csv"}}"#,
    );
    h.write(
        "siteDeployment_north",
        "manifest_m_002.csv",
        "subtopicBitNumber,subtopicReportedOn\n8,blower\n",
    );
    let summary = h.engine.run_scheduled_reconciliation().await.expect("run");
    assert_eq!(summary.sites_synced, 1);
    assert_eq!(summary.files_added, 1);
    assert_eq!(h.log_ids(2, "manifest_m_002.csv").await.len(), 1);

    h.write("siteDeployment_north", "config.json", r#"{"production": {}}"#);
    let summary = h.engine.run_scheduled_reconciliation().await.expect("run");
    assert_eq!(summary.sites_failed, 0);
    let history = h.store.version_history(manifest.id).await.expect("history");
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|r| !r.is_primary));
}
