//! Axum + Askama dashboard over the entity catalog.
//!
//! Read-only views: the catalog is written exclusively by the reconciliation
//! engine, and each row's lifecycle status is derived the same way the
//! notification layer derives it (removed / new / changed).

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use lsig_catalog::CatalogStore;
use lsig_core::CatalogRecord;
use lsig_sync::{SourceConfig, SourceRegistry};
use serde::Deserialize;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "lsig-web";

const ENTITY_PAGE_LIMIT: i64 = 100;

const APP_CSS: &str = r#"
body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 56rem; color: #0f172a; }
.caption { color: #64748b; }
.entity { border-bottom: 1px solid #e2e8f0; padding: 0.5rem 0; }
.entity .badge { text-transform: uppercase; font-size: 0.75rem; margin-right: 0.5rem; }
.entity.new .badge { color: #16a34a; }
.entity.changed .badge { color: #d97706; }
.entity.removed .badge { color: #dc2626; }
.meta { color: #64748b; margin-left: 0.5rem; }
nav a { margin-right: 1rem; }
table { border-collapse: collapse; }
td, th { border: 1px solid #e2e8f0; padding: 0.35rem 0.75rem; text-align: left; }
"#;

#[derive(Clone)]
pub struct AppState {
    pub store: CatalogStore,
    pub sources_path: PathBuf,
}

impl AppState {
    pub fn new(store: CatalogStore, sources_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            sources_path: sources_path.into(),
        }
    }
}

/// Lifecycle status shown per row, derived from the record alone: a never
/// re-seen record still reads "new", a refreshed one "changed".
pub fn lifecycle_status(record: &CatalogRecord) -> &'static str {
    if !record.is_active {
        "removed"
    } else if record.first_seen == record.last_seen {
        "new"
    } else {
        "changed"
    }
}

#[derive(Debug, Clone)]
struct EntityRow {
    status: &'static str,
    name: String,
    url: String,
    source: String,
    project: String,
    last_seen: String,
}

impl EntityRow {
    fn from_record(record: &CatalogRecord) -> Self {
        Self {
            status: lifecycle_status(record),
            name: record.name.clone(),
            url: record.url.clone(),
            source: record.source.clone(),
            project: record.project.clone(),
            last_seen: record.last_seen.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct EntitiesQuery {
    source: Option<String>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total: i64,
    active: i64,
    last_activity: String,
}

#[derive(Template)]
#[template(path = "entities.html")]
struct EntitiesTemplate {
    selected_source: String,
    rows: Vec<EntityRow>,
}

#[derive(Template)]
#[template(path = "sources.html")]
struct SourcesTemplate {
    sources: Vec<SourceConfig>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/entities", get(entities_handler))
        .route("/sources", get(sources_handler))
        .route("/api/changes", get(changes_json_handler))
        .route("/assets/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let counts = match state.store.counts().await {
        Ok(counts) => counts,
        Err(err) => return server_error(err.into()),
    };
    let last_activity = match state.store.list_recent(1).await {
        Ok(records) => records
            .first()
            .map(|r| r.last_seen.to_rfc3339())
            .unwrap_or_else(|| "n/a".to_string()),
        Err(err) => return server_error(err.into()),
    };
    render_html(IndexTemplate {
        total: counts.total,
        active: counts.active,
        last_activity,
    })
}

async fn entities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EntitiesQuery>,
) -> Response {
    let records = match state.store.list_recent(ENTITY_PAGE_LIMIT).await {
        Ok(records) => records,
        Err(err) => return server_error(err.into()),
    };
    let selected_source = query.source.unwrap_or_default();
    let rows = records
        .iter()
        .filter(|r| selected_source.is_empty() || r.source == selected_source)
        .map(EntityRow::from_record)
        .collect();
    render_html(EntitiesTemplate {
        selected_source,
        rows,
    })
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match SourceRegistry::load(&state.sources_path) {
        Ok(registry) => render_html(SourcesTemplate {
            sources: registry.sources,
        }),
        Err(err) => server_error(err),
    }
}

async fn changes_json_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_recent(ENTITY_PAGE_LIMIT).await {
        Ok(records) => {
            let payload: Vec<_> = records
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "status": lifecycle_status(r),
                        "url": r.url,
                        "name": r.name,
                        "source": r.source,
                        "project": r.project,
                        "first_seen": r.first_seen.to_rfc3339(),
                        "last_seen": r.last_seen.to_rfc3339(),
                        "is_active": r.is_active,
                    })
                })
                .collect();
            Json(payload).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn app_css_handler() -> Response {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], APP_CSS).into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use lsig_core::Entity;
    use std::io::Write;
    use tower::ServiceExt;

    fn entity(url: &str, source: &str, name: &str) -> Entity {
        Entity {
            url: url.to_string(),
            name: name.to_string(),
            description: format!("{name} description"),
            source: source.to_string(),
            project: Some("Example".to_string()),
            kind: Some("news".to_string()),
            resource: None,
        }
    }

    async fn seeded_state(sources_yaml: &std::path::Path) -> AppState {
        let store = CatalogStore::connect_in_memory().await.expect("connect");
        store.initialize().await.expect("initialize");
        let first = Utc.with_ymd_and_hms(2026, 8, 23, 9, 0, 0).single().unwrap();
        let later = Utc.with_ymd_and_hms(2026, 8, 23, 10, 0, 0).single().unwrap();
        store
            .upsert_seen(&entity("https://a.example/1", "hackernews", "Fresh Story"), "fp-1", first)
            .await
            .expect("seed new");
        store
            .upsert_seen(&entity("https://a.example/2", "hackernews", "Old Story"), "fp-2", first)
            .await
            .expect("seed old");
        store
            .upsert_seen(&entity("https://a.example/2", "hackernews", "Old Story"), "fp-2", later)
            .await
            .expect("refresh old");
        AppState::new(store, sources_yaml)
    }

    fn write_sources_yaml(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("sources.yaml");
        let mut file = std::fs::File::create(&path).expect("create sources.yaml");
        file.write_all(
            br#"
sources:
  - source_id: hackernews
    display_name: Hacker News
    enabled: true
    base_url: https://news.ycombinator.com/newest
"#,
        )
        .expect("write sources.yaml");
        path
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn lifecycle_status_matches_row_shape() {
        let first = Utc.with_ymd_and_hms(2026, 8, 23, 9, 0, 0).single().unwrap();
        let later = Utc.with_ymd_and_hms(2026, 8, 23, 10, 0, 0).single().unwrap();
        let mut record = CatalogRecord {
            url: "https://a.example/1".to_string(),
            fingerprint: "fp".to_string(),
            name: "Story".to_string(),
            description: String::new(),
            source: "hackernews".to_string(),
            project: "Hackernews".to_string(),
            kind: "news".to_string(),
            resource: None,
            first_seen: first,
            last_seen: first,
            is_active: true,
        };
        assert_eq!(lifecycle_status(&record), "new");

        record.last_seen = later;
        assert_eq!(lifecycle_status(&record), "changed");

        record.is_active = false;
        assert_eq!(lifecycle_status(&record), "removed");
    }

    #[tokio::test]
    async fn index_page_renders_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let yaml = write_sources_yaml(&dir);
        let app = app(seeded_state(&yaml).await);

        let resp = app
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("LeadSignal Notifications"));
        assert!(text.contains("Tracked entities"));
    }

    #[tokio::test]
    async fn entities_page_lists_rows_with_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let yaml = write_sources_yaml(&dir);
        let app = app(seeded_state(&yaml).await);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/entities")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Fresh Story"));
        assert!(text.contains("new"));
        assert!(text.contains("Old Story"));
        assert!(text.contains("changed"));
    }

    #[tokio::test]
    async fn entities_page_filters_by_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let yaml = write_sources_yaml(&dir);
        let app = app(seeded_state(&yaml).await);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/entities?source=unregistered")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("No entities to show yet."));
    }

    #[tokio::test]
    async fn sources_page_renders_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let yaml = write_sources_yaml(&dir);
        let app = app(seeded_state(&yaml).await);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/sources")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Hacker News"));
    }

    #[tokio::test]
    async fn changes_endpoint_returns_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let yaml = write_sources_yaml(&dir);
        let app = app(seeded_state(&yaml).await);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/changes")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let text = body_text(resp).await;
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
    }
}
