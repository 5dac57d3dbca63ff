//! Reconciliation engine and watch-run orchestration.
//!
//! [`Reconciler::reconcile`] merges one source's freshly observed snapshot
//! against the persisted catalog and classifies the delta (new / changed /
//! removed). [`WatchPipeline`] wires fetch -> parse -> reconcile per enabled
//! source, and [`build_scheduler`] runs the pipeline on a cron cadence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lsig_adapters::{parser_for_source, HttpClientConfig, HttpFetcher};
use lsig_catalog::{CatalogError, CatalogStore};
use lsig_core::{fingerprint, Delta, Entity};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lsig-sync";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("catalog unavailable during reconciliation: {0}")]
    Store(#[from] CatalogError),
}

/// Merges observed snapshots into the catalog, one serialized run per source.
///
/// The engine never retries: a store failure aborts the run, the transaction
/// rolls back, and the next scheduled tick is the retry mechanism.
pub struct Reconciler {
    store: CatalogStore,
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(store: CatalogStore) -> Self {
        Self {
            store,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    async fn run_lock(&self, source: &str) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        locks
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reconciles one source's full current universe of entities against the
    /// persisted catalog.
    ///
    /// The snapshot must contain every entity currently visible on the
    /// source: anything active in the catalog for this source but absent
    /// from the snapshot is classified as removed.
    ///
    /// Classification rules, per entity in snapshot order:
    /// - no record for the url: `new`
    /// - record with a different stored fingerprint: `changed`
    /// - record with an equal fingerprint: no event; `last_seen` and
    ///   `is_active` are still refreshed, so a previously removed identifier
    ///   that reappears unchanged is silently reactivated.
    ///
    /// Malformed entities (missing url or name) are excluded from the
    /// snapshot with a warning rather than fingerprinted with missing data.
    pub async fn reconcile(
        &self,
        source: &str,
        snapshot: &[Entity],
        now: DateTime<Utc>,
    ) -> Result<Delta, ReconcileError> {
        // Overlapping runs for one source (slow run + next tick) would race
        // on removal detection; serialize them.
        let lock = self.run_lock(source).await;
        let _run = lock.lock().await;

        let mut txn = self.store.begin().await?;
        let mut delta = Delta::default();
        let mut seen: HashSet<String> = HashSet::with_capacity(snapshot.len());

        for entity in snapshot {
            if !entity.is_well_formed() {
                warn!(
                    source,
                    url = %entity.url,
                    name = %entity.name,
                    "excluding malformed entity from snapshot"
                );
                continue;
            }

            let fp = fingerprint(entity);
            seen.insert(entity.url.clone());

            match txn.get_by_url(&entity.url).await? {
                None => delta.new.push(entity.clone()),
                Some(record) if record.fingerprint != fp => delta.changed.push(entity.clone()),
                Some(_) => {}
            }
            txn.upsert_seen(entity, &fp, now).await?;
        }

        let mut missing: Vec<String> = txn
            .list_active_urls(source)
            .await?
            .into_iter()
            .filter(|url| !seen.contains(url))
            .collect();
        missing.sort();

        for url in missing {
            txn.mark_inactive(&url).await?;
            delta.removed.push(url);
        }

        txn.commit().await?;
        Ok(delta)
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub database_url: String,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub watch_cron: String,
}

impl WatchConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://leadsignal.db".to_string()),
            sources_path: std::env::var("LSIG_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            user_agent: std::env::var("LSIG_USER_AGENT")
                .unwrap_or_else(|_| "LeadSignalBot/0.1".to_string()),
            http_timeout_secs: std::env::var("LSIG_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            watch_cron: std::env::var("LSIG_WATCH_CRON")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub base_url: String,
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry yaml")
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Outcome of one watch run across all enabled sources, handed to the
/// notification and dashboard layers read-only.
#[derive(Debug, Clone, Serialize)]
pub struct WatchRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_attempted: usize,
    pub sources_failed: usize,
    pub deltas: BTreeMap<String, Delta>,
}

impl WatchRunSummary {
    /// Total (new, changed, removed) counts across sources.
    pub fn totals(&self) -> (usize, usize, usize) {
        self.deltas.values().fold((0, 0, 0), |(n, c, r), d| {
            (n + d.new.len(), c + d.changed.len(), r + d.removed.len())
        })
    }
}

/// Fetch -> parse -> reconcile for every enabled source, once per tick.
pub struct WatchPipeline {
    registry: SourceRegistry,
    fetcher: HttpFetcher,
    reconciler: Reconciler,
}

impl WatchPipeline {
    /// Store handle is injected explicitly so tests can run against an
    /// in-memory catalog.
    pub fn new(registry: SourceRegistry, fetcher: HttpFetcher, store: CatalogStore) -> Self {
        Self {
            registry,
            fetcher,
            reconciler: Reconciler::new(store),
        }
    }

    pub async fn from_config(config: &WatchConfig) -> Result<Self> {
        let store = CatalogStore::connect(&config.database_url)
            .await
            .context("opening catalog database")?;
        store
            .initialize()
            .await
            .context("initializing catalog schema")?;
        let registry = SourceRegistry::load(&config.sources_path)?;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            backoff: Default::default(),
        })?;
        Ok(Self::new(registry, fetcher, store))
    }

    pub fn store(&self) -> &CatalogStore {
        self.reconciler.store()
    }

    /// One full watch run. A source that cannot be fetched or parsed is
    /// skipped until the next tick; a catalog failure aborts the run and the
    /// caller must treat the run as unknown partial state.
    pub async fn run_once(&self) -> Result<WatchRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut sources_attempted = 0usize;
        let mut sources_failed = 0usize;
        let mut deltas = BTreeMap::new();

        for source in self.registry.enabled() {
            sources_attempted += 1;

            let Some(parser) = parser_for_source(&source.source_id) else {
                warn!(source = %source.source_id, "no parser registered; skipping source");
                sources_failed += 1;
                continue;
            };

            let html = match self
                .fetcher
                .fetch_text(&source.source_id, &source.base_url)
                .await
            {
                Ok(html) => html,
                Err(err) => {
                    warn!(
                        source = %source.source_id,
                        error = %err,
                        "source unavailable; retrying on next tick"
                    );
                    sources_failed += 1;
                    continue;
                }
            };

            let snapshot = match parser.parse(&html, &source.base_url) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(
                        source = %source.source_id,
                        error = %err,
                        "snapshot parse failed; retrying on next tick"
                    );
                    sources_failed += 1;
                    continue;
                }
            };

            let delta = self
                .reconciler
                .reconcile(&source.source_id, &snapshot, Utc::now())
                .await
                .with_context(|| format!("reconciling source {}", source.source_id))?;

            info!(
                %run_id,
                source = %source.source_id,
                observed = snapshot.len(),
                new = delta.new.len(),
                changed = delta.changed.len(),
                removed = delta.removed.len(),
                "reconciled source"
            );
            deltas.insert(source.source_id.clone(), delta);
        }

        Ok(WatchRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources_attempted,
            sources_failed,
            deltas,
        })
    }
}

/// Periodic watch task: cron-scheduled, cancellable via
/// [`JobScheduler::shutdown`], decoupled from the reconciliation algorithm so
/// the engine stays testable without waiting on real time.
pub async fn build_scheduler(pipeline: Arc<WatchPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => {
                    let (new, changed, removed) = summary.totals();
                    info!(
                        run_id = %summary.run_id,
                        sources = summary.sources_attempted,
                        failed = summary.sources_failed,
                        new,
                        changed,
                        removed,
                        "watch run completed"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "watch run failed; next tick retries");
                }
            }
        })
    })
    .with_context(|| format!("creating watch job for cron `{cron}`"))?;
    sched.add(job).await.context("adding watch job")?;
    Ok(sched)
}
