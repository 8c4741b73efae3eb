use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gateway::{ModelGateway, OutputContract};

// ─── Domain enums ───

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    Global,
    Asia,
    Indonesia,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Global => "Global",
            Region::Asia => "Asia",
            Region::Indonesia => "Indonesia",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.as_str();
        write!(f, "{s}")
    }
}

/// Top-level GICS sectors, plus Unknown for anything the classifier
/// could not place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sector {
    Energy,
    Materials,
    Industrials,
    #[serde(rename = "Consumer Discretionary")]
    ConsumerDiscretionary,
    #[serde(rename = "Consumer Staples")]
    ConsumerStaples,
    #[serde(rename = "Health Care")]
    HealthCare,
    Financials,
    #[serde(rename = "Information Technology")]
    InformationTechnology,
    #[serde(rename = "Communication Services")]
    CommunicationServices,
    Utilities,
    #[serde(rename = "Real Estate")]
    RealEstate,
    Unknown,
}

impl Sector {
    /// The closed set offered to the model. Unknown is a coercion
    /// target, never offered.
    pub const ALLOWED: [Sector; 11] = [
        Sector::Energy,
        Sector::Materials,
        Sector::Industrials,
        Sector::ConsumerDiscretionary,
        Sector::ConsumerStaples,
        Sector::HealthCare,
        Sector::Financials,
        Sector::InformationTechnology,
        Sector::CommunicationServices,
        Sector::Utilities,
        Sector::RealEstate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sector::Energy => "Energy",
            Sector::Materials => "Materials",
            Sector::Industrials => "Industrials",
            Sector::ConsumerDiscretionary => "Consumer Discretionary",
            Sector::ConsumerStaples => "Consumer Staples",
            Sector::HealthCare => "Health Care",
            Sector::Financials => "Financials",
            Sector::InformationTechnology => "Information Technology",
            Sector::CommunicationServices => "Communication Services",
            Sector::Utilities => "Utilities",
            Sector::RealEstate => "Real Estate",
            Sector::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Sector> {
        let s = s.trim();
        Sector::ALLOWED
            .iter()
            .copied()
            .find(|sec| sec.as_str().eq_ignore_ascii_case(s))
            .or(if s.eq_ignore_ascii_case("Unknown") {
                Some(Sector::Unknown)
            } else {
                None
            })
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub const ALLOWED: [Sentiment; 3] =
        [Sentiment::Positive, Sentiment::Negative, Sentiment::Neutral];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "Positive",
            Sentiment::Negative => "Negative",
            Sentiment::Neutral => "Neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Sentiment> {
        let s = s.trim();
        Sentiment::ALLOWED
            .iter()
            .copied()
            .find(|sn| sn.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─── NewsItem ───

/// One fetched article, mutated in place by the enrichment stages.
/// `sector`/`sentiment` are `None` only mid-pipeline; the classifier's
/// final sweep guarantees concrete values before composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub headline: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub source: String,
    pub region: Region,
    #[serde(default)]
    pub sector: Option<Sector>,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub theme: String,
}

impl NewsItem {
    pub fn new(headline: impl Into<String>, url: impl Into<String>, region: Region) -> Self {
        NewsItem {
            headline: headline.into(),
            url: url.into(),
            content: String::new(),
            source: String::new(),
            region,
            sector: None,
            sentiment: None,
            priority: 0.0,
            theme: String::new(),
        }
    }

    /// Text handed to the classifiers: headline only, or headline plus
    /// the first 160 chars of content.
    pub fn classification_text(&self, headline_only: bool) -> String {
        if headline_only || self.content.is_empty() {
            self.headline.clone()
        } else {
            let snippet: String = self.content.chars().take(160).collect();
            format!("{} {}", self.headline, snippet)
        }
    }
}

/// Domain name as a human-readable source (reuters.com -> Reuters).
pub fn extract_source(url: &str) -> String {
    let re = Regex::new(r"^https?://([^/]+)").expect("static regex");
    let domain = re
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or("source");
    let domain = domain.trim_start_matches("www.");
    let name = domain.split('.').next().unwrap_or("source");
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => "Source".to_string(),
    }
}

/// Keyword-based region refinement over the query-origin default.
pub fn detect_region(
    text: &str,
    default: Region,
    asia_keywords: &[String],
    indonesia_keywords: &[String],
) -> Region {
    let lower = text.to_lowercase();
    if indonesia_keywords.iter().any(|k| lower.contains(k.as_str())) {
        return Region::Indonesia;
    }
    if asia_keywords.iter().any(|k| lower.contains(k.as_str())) {
        return Region::Asia;
    }
    default
}

/// Remove duplicates by (url, lowercased trimmed headline) and cap at
/// `limit`. First-seen order preserved.
pub fn dedupe_and_trim(items: Vec<NewsItem>, limit: usize) -> Vec<NewsItem> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut unique = Vec::new();
    for item in items {
        let key = (item.url.clone(), item.headline.trim().to_lowercase());
        if !seen.insert(key) {
            continue;
        }
        unique.push(item);
        if unique.len() >= limit {
            break;
        }
    }
    unique
}

// ─── Fetcher ───

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub url: String,
}

pub struct NewsFetcher {
    client: Client,
    search_max_results: usize,
    fetch_workers: usize,
    max_articles_total: usize,
    global_query: String,
    local_query: String,
    asia_keywords: Vec<String>,
    indonesia_keywords: Vec<String>,
}

impl NewsFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0")
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .context("Failed to build fetcher HTTP client")?;

        Ok(NewsFetcher {
            client,
            search_max_results: config.search_max_results,
            fetch_workers: config.fetch_workers,
            max_articles_total: config.max_articles_total,
            global_query: config.global_query.clone(),
            local_query: config.local_query.clone(),
            asia_keywords: config.asia_keywords.clone(),
            indonesia_keywords: config.indonesia_keywords.clone(),
        })
    }

    /// Ask the model backend for recent headlines for `query`. A failed
    /// or malformed search yields an empty list, never an abort.
    pub async fn search_headlines(&self, gateway: &ModelGateway, query: &str) -> Vec<SearchHit> {
        let prompt = format!(
            "Return ONLY a JSON object {{\"results\": [{{\"headline\": \"...\", \"url\": \"...\"}}]}} \
             with the top {} recent, reputable news headlines about: {}. \
             No extra text.",
            self.search_max_results, query
        );

        let reply = match gateway
            .complete(&prompt, &OutputContract::JsonObject, 600)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Headline search failed for '{}': {}", query, e);
                return Vec::new();
            }
        };

        let json = match reply.into_json() {
            Some(v) => v,
            None => return Vec::new(),
        };
        // Accept either the requested object shape or a bare array.
        let arr = json
            .get("results")
            .cloned()
            .unwrap_or_else(|| json.clone());
        let hits: Vec<SearchHit> = serde_json::from_value(arr).unwrap_or_default();
        hits.into_iter()
            .filter(|h| !h.url.is_empty())
            .take(self.search_max_results)
            .collect()
    }

    /// Fetch one article body: paragraph text joined and truncated to
    /// 1000 chars. Timeouts, non-200s and parse failures all yield
    /// empty content, localized to the single item.
    pub async fn fetch_article(&self, url: &str) -> String {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("Fetch failed for {}: {}", url, e);
                return String::new();
            }
        };
        if !response.status().is_success() {
            debug!("Fetch for {} returned {}", url, response.status());
            return String::new();
        }
        let html = match response.text().await {
            Ok(t) => t,
            Err(_) => return String::new(),
        };
        extract_paragraphs(&html)
    }

    /// Search both queries, fetch bodies with a bounded worker pool,
    /// dedupe, cap, and drop items with no usable content.
    pub async fn fetch_all(&self, gateway: &ModelGateway) -> Vec<NewsItem> {
        let global_hits = self.search_headlines(gateway, &self.global_query).await;
        let local_hits = self.search_headlines(gateway, &self.local_query).await;
        info!(
            "Search returned {} global and {} local headlines",
            global_hits.len(),
            local_hits.len()
        );

        let mut items: Vec<NewsItem> = Vec::new();
        for hit in global_hits {
            let region = detect_region(
                &hit.headline,
                Region::Global,
                &self.asia_keywords,
                &self.indonesia_keywords,
            );
            items.push(NewsItem::new(hit.headline, hit.url, region));
        }
        for hit in local_hits {
            let region = detect_region(
                &hit.headline,
                Region::Indonesia,
                &self.asia_keywords,
                &self.indonesia_keywords,
            );
            items.push(NewsItem::new(hit.headline, hit.url, region));
        }

        // Bounded, order-preserving fan-out over the article bodies.
        let items: Vec<NewsItem> = stream::iter(items.into_iter().map(|mut item| async move {
            item.content = self.fetch_article(&item.url).await;
            item.source = extract_source(&item.url);
            item
        }))
        .buffered(self.fetch_workers)
        .collect()
        .await;

        let before = items.len();
        let items = dedupe_and_trim(items, self.max_articles_total);
        let deduped = items.len();
        let items: Vec<NewsItem> = items
            .into_iter()
            .filter(|it| !it.content.is_empty())
            .collect();
        info!(
            "Fetched {} articles -> {} after dedupe/cap -> {} with usable content",
            before,
            deduped,
            items.len()
        );
        items
    }
}

fn extract_paragraphs(html: &str) -> String {
    let doc = Html::parse_document(html);
    let selector = Selector::parse("p").expect("static selector");
    let mut text = String::new();
    for p in doc.select(&selector) {
        let chunk = p.text().collect::<Vec<_>>().join(" ");
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(chunk);
        if text.len() > 4000 {
            break; // plenty beyond the trim point
        }
    }
    text.chars().take(1000).collect()
}
