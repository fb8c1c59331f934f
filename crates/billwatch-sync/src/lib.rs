//! Sync pipeline: scrape the chamber listing, reconcile it with the tracking
//! sheet and apply the resulting writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use billwatch_adapters::{adapter_for_chamber, load_listing_file, ChamberAdapter, FetchedPage, ListingTarget};
use billwatch_core::{ScrapedRecord, StoreSnapshot};
use billwatch_storage::{
    HttpClientConfig, HttpFetcher, LocalSheetStore, SheetStore, SheetsApiConfig,
    SheetsApiStore,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod notify;
pub mod reconcile;

pub use config::SyncConfig;
pub use notify::{notify_best_effort, LogNotifier, Notifier, NotifyError, WebhookNotifier};
pub use reconcile::{
    apply_plan, find_match, reconcile, IdCounter, IdentifierAllocator, PlanCounts, PlanOutcome,
    ReconcileError, RowUpdate, WritePlan,
};

pub const CRATE_NAME: &str = "billwatch-sync";

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub chamber: String,
    pub outcome: PlanOutcome,
    pub counts: PlanCounts,
    pub message: String,
    pub report_path: Option<String>,
}

/// Scrape plus the plan it would produce, without any writes.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedRun {
    pub chamber: String,
    pub outcome: PlanOutcome,
    pub scraped: Vec<ScrapedRecord>,
    pub plan: WritePlan,
}

pub fn summary_message(origin_label: &str, plan: &WritePlan) -> String {
    let c = plan.counts;
    match plan.outcome() {
        PlanOutcome::NoData => format!(
            "[ADVISORY] {origin_label} scrape returned no projects; the sheet was left untouched."
        ),
        PlanOutcome::NothingToDo => format!(
            "{origin_label} run complete: no changes ({} unchanged).",
            c.skipped
        ),
        PlanOutcome::Changes => format!(
            "{origin_label} run complete. New: {}, Updated: {}, Unchanged: {}.",
            c.new, c.updated, c.skipped
        ),
    }
}

pub fn critical_message(origin_label: &str, err: &anyhow::Error) -> String {
    format!("[CRITICAL] {origin_label} sync failed: {err:#}")
}

pub fn build_notifier(config: &SyncConfig) -> Result<Arc<dyn Notifier>> {
    match &config.notify_webhook_url {
        Some(url) => {
            let notifier =
                WebhookNotifier::new(url.clone(), Duration::from_secs(config.http_timeout_secs))
                    .context("building webhook notifier")?;
            Ok(Arc::new(notifier))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

fn http_config(config: &SyncConfig) -> HttpClientConfig {
    HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    }
}

pub fn build_store(config: &SyncConfig) -> Result<Arc<dyn SheetStore>> {
    if let Some(path) = &config.local_store {
        info!(path = %path.display(), "using local sheet file");
        return Ok(Arc::new(LocalSheetStore::new(path.clone())));
    }
    let http = HttpFetcher::new(http_config(config))?;
    let store = SheetsApiStore::new(
        http,
        SheetsApiConfig {
            base_url: config.sheets_api_base.clone(),
            spreadsheet_id: config.spreadsheet_id.clone(),
            worksheet: config.worksheet.clone(),
            access_token: config.sheets_access_token.clone(),
            service_account_json: config.service_account_json()?,
        },
    )
    .context("opening spreadsheet")?;
    Ok(Arc::new(store))
}

fn resolve_adapter(chamber: &str) -> Result<Box<dyn ChamberAdapter>> {
    adapter_for_chamber(chamber).with_context(|| format!("no adapter registered for {chamber}"))
}

/// Saved snapshot when `listing_file` is set, otherwise a live fetch.
async fn acquire_listing(
    config: &SyncConfig,
    adapter: &dyn ChamberAdapter,
    http: &HttpFetcher,
) -> Result<FetchedPage> {
    if let Some(path) = &config.listing_file {
        return load_listing_file(path).context("loading listing snapshot");
    }
    let url = config
        .listing_url
        .clone()
        .unwrap_or_else(|| adapter.default_listing_url().to_string());
    info!(%url, "fetching listing");
    adapter
        .fetch_listing(http, &ListingTarget { url })
        .await
        .context("fetching listing")
}

fn parse_page(adapter: &dyn ChamberAdapter, page: &FetchedPage) -> Result<Vec<ScrapedRecord>> {
    let records = adapter.parse_listing(page).context("parsing listing")?;
    info!(records = records.len(), "extracted projects");
    Ok(records)
}

/// Scrape only. Needs no spreadsheet configuration.
pub async fn extract_listing(config: &SyncConfig) -> Result<Vec<ScrapedRecord>> {
    let adapter = resolve_adapter(&config.chamber)?;
    let http = HttpFetcher::new(http_config(config))?;
    let page = acquire_listing(config, adapter.as_ref(), &http).await?;
    parse_page(adapter.as_ref(), &page)
}

pub struct SyncPipeline {
    config: SyncConfig,
    adapter: Box<dyn ChamberAdapter>,
    http: HttpFetcher,
    store: Arc<dyn SheetStore>,
    notifier: Arc<dyn Notifier>,
    allocator: IdentifierAllocator,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let store = build_store(&config)?;
        Self::with_store(config, store, notifier)
    }

    pub fn with_store(
        config: SyncConfig,
        store: Arc<dyn SheetStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let adapter = resolve_adapter(&config.chamber)?;
        let http = HttpFetcher::new(http_config(&config))?;
        let allocator = IdentifierAllocator::new(config.id_format, config.id_prefix.clone());
        Ok(Self {
            config,
            adapter,
            http,
            store,
            notifier,
            allocator,
        })
    }

    /// Full run: scrape, reconcile, write, report, notify. Hard failures are
    /// announced as critical before being returned.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id, chamber = self.adapter.chamber());

        match self.execute(run_id, started_at).instrument(span).await {
            Ok(summary) => {
                notify_best_effort(self.notifier.as_ref(), &summary.message).await;
                Ok(summary)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "sync run failed");
                let message = critical_message(self.adapter.origin_label(), &err);
                notify_best_effort(self.notifier.as_ref(), &message).await;
                Err(err)
            }
        }
    }

    /// Scrape and reconcile without touching the sheet.
    pub async fn plan_only(&self) -> Result<PlannedRun> {
        let scraped = self.extract().await?;
        let snapshot = self.read_snapshot().await?;
        let plan = reconcile(&scraped, &snapshot, &self.allocator)?;
        Ok(PlannedRun {
            chamber: self.adapter.chamber().to_string(),
            outcome: plan.outcome(),
            scraped,
            plan,
        })
    }

    pub async fn extract(&self) -> Result<Vec<ScrapedRecord>> {
        let page = self.acquire_listing().await?;
        parse_page(self.adapter.as_ref(), &page)
    }

    async fn execute(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncRunSummary> {
        let page = self.acquire_listing().await?;
        let scraped = parse_page(self.adapter.as_ref(), &page)?;

        let snapshot = self.read_snapshot().await?;
        let plan = reconcile(&scraped, &snapshot, &self.allocator)?;
        let outcome = plan.outcome();

        if outcome == PlanOutcome::NoData {
            warn!("scrape produced no records; skipping writes");
        } else {
            apply_plan(self.store.as_ref(), &plan)
                .await
                .context("writing to spreadsheet")?;
        }

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            chamber: self.adapter.chamber().to_string(),
            outcome,
            counts: plan.counts,
            message: summary_message(self.adapter.origin_label(), &plan),
            report_path: None,
        };
        info!(
            new = plan.counts.new,
            updated = plan.counts.updated,
            skipped = plan.counts.skipped,
            "run finished"
        );
        summary.report_path = self.write_report(&summary, &plan).await;
        Ok(summary)
    }

    async fn acquire_listing(&self) -> Result<FetchedPage> {
        acquire_listing(&self.config, self.adapter.as_ref(), &self.http).await
    }

    async fn read_snapshot(&self) -> Result<StoreSnapshot> {
        let table = self
            .store
            .read_table()
            .await
            .context("reading spreadsheet")?;
        let snapshot = StoreSnapshot::from_table(&table);
        if !snapshot.has_case_id_column && !snapshot.is_empty() {
            warn!("sheet has no case id column; every scraped project will be treated as new");
        }
        info!(rows = snapshot.rows.len(), "read sheet snapshot");
        Ok(snapshot)
    }

    async fn write_report(&self, summary: &SyncRunSummary, plan: &WritePlan) -> Option<String> {
        let reports_root = self.config.reports_dir.as_ref()?;
        match write_run_report(reports_root, summary, plan).await {
            Ok(path) => Some(path.display().to_string()),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not write run report");
                None
            }
        }
    }
}

async fn write_run_report(
    reports_root: &Path,
    summary: &SyncRunSummary,
    plan: &WritePlan,
) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let bytes = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "plan": plan,
    }))
    .context("serializing run report")?;
    let path = run_dir.join("run.json");
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Build everything from `config` and run once. Setup failures after the
/// notifier exists are announced as critical too.
pub async fn run_sync_once(config: SyncConfig) -> Result<SyncRunSummary> {
    let notifier = build_notifier(&config)?;
    let origin = adapter_for_chamber(&config.chamber)
        .map(|a| a.origin_label())
        .unwrap_or("billwatch");
    let pipeline = match SyncPipeline::new(config, notifier.clone()) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!(error = %format!("{err:#}"), "sync setup failed");
            notify_best_effort(notifier.as_ref(), &critical_message(origin, &err)).await;
            return Err(err);
        }
    };
    pipeline.run_once().await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(SyncConfig::from_env()?).await
}
