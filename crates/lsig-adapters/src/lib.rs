//! Source collaborators: HTTP retrieval and site-specific snapshot parsers.
//!
//! Each monitored site gets one [`SourceParser`] implementation, registered
//! explicitly in [`parser_for_source`]. Parsers turn raw markup into the
//! full set of entities currently visible on that source; lifecycle handling
//! happens downstream in the reconciliation engine.

use std::time::Duration;

use anyhow::Context;
use lsig_core::Entity;
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::info_span;

pub const CRATE_NAME: &str = "lsig-adapters";

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("unexpected document shape for {source_id}: {detail}")]
    DocumentShape {
        source_id: &'static str,
        detail: String,
    },
}

/// Capability of producing entities from raw source content, one
/// implementation per monitored site.
pub trait SourceParser: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn parse(&self, html: &str, base_url: &str) -> Result<Vec<Entity>, ParserError>;
}

/// Explicit registry; sources are looked up by id, never by convention.
pub fn parser_for_source(source_id: &str) -> Option<Box<dyn SourceParser>> {
    match source_id {
        "hackernews" => Some(Box::new(HackerNewsParser)),
        "timetohire" => Some(Box::new(TimeToHireParser)),
        _ => None,
    }
}

fn selector(raw: &str) -> Result<Selector, ParserError> {
    Selector::parse(raw).map_err(|e| ParserError::Selector {
        selector: raw.to_string(),
        message: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn absolutize(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), href.trim_start_matches('/'))
    }
}

/// Hacker News "newest" listing. The feed is unbounded; one snapshot is
/// capped at the top stories so a run stays a bounded universe.
const HACKERNEWS_SNAPSHOT_CAP: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct HackerNewsParser;

impl SourceParser for HackerNewsParser {
    fn source_id(&self) -> &'static str {
        "hackernews"
    }

    fn parse(&self, html: &str, base_url: &str) -> Result<Vec<Entity>, ParserError> {
        let document = Html::parse_document(html);
        let story_sel = selector("tr.athing")?;
        let title_sel = selector("span.titleline > a")?;

        let mut entities = Vec::new();
        for story in document.select(&story_sel) {
            let Some(link) = story.select(&title_sel).next() else {
                continue;
            };
            let name = element_text(link);
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            entities.push(Entity {
                url: absolutize(base_url, href),
                description: name.clone(),
                name,
                source: self.source_id().to_string(),
                project: Some("Hackernews".to_string()),
                kind: Some("news".to_string()),
                resource: None,
            });
            if entities.len() == HACKERNEWS_SNAPSHOT_CAP {
                break;
            }
        }
        // An empty snapshot would read as mass removal downstream; a listing
        // page with no story rows means the markup changed, not the content.
        if entities.is_empty() {
            return Err(ParserError::DocumentShape {
                source_id: self.source_id(),
                detail: "no story rows matched tr.athing".to_string(),
            });
        }
        Ok(entities)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeToHireParser;

impl SourceParser for TimeToHireParser {
    fn source_id(&self) -> &'static str {
        "timetohire"
    }

    fn parse(&self, html: &str, base_url: &str) -> Result<Vec<Entity>, ParserError> {
        let document = Html::parse_document(html);
        let card_sel = selector("div.VacatureList__Wrapper__Mk_7J")?;
        let title_sel = selector("h3.VacatureList__Title__u4746")?;
        let link_sel = selector("a.VacatureList__LinkBtn__3_4n3")?;
        let desc_sel = selector("div.VacatureList__Content__mfD1j p")?;

        let mut entities = Vec::new();
        for card in document.select(&card_sel) {
            let name = card
                .select(&title_sel)
                .next()
                .map(element_text)
                .unwrap_or_else(|| "No title".to_string());
            let href = card
                .select(&link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
                .unwrap_or("#");
            let description = card
                .select(&desc_sel)
                .next()
                .map(element_text)
                .unwrap_or_default();

            entities.push(Entity {
                url: absolutize(base_url, href),
                name,
                description,
                source: self.source_id().to_string(),
                project: Some("TTH".to_string()),
                kind: Some("job_board".to_string()),
                resource: None,
            });
        }
        if entities.is_empty() {
            return Err(ParserError::DocumentShape {
                source_id: self.source_id(),
                detail: "no vacancy cards matched the listing wrapper".to_string(),
            });
        }
        Ok(entities)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "LeadSignalBot/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Listing-page fetcher: one GET per source per tick, with exponential
/// backoff on retryable failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<String, FetchError> {
        let span = info_span!("source_fetch", source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
