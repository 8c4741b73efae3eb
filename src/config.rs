use anyhow::{Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    // Model backend
    pub api_url: String,
    pub api_key: String,
    /// Ordered candidates for classification calls, primary first.
    pub models_classify: Vec<String>,
    /// Ordered candidates for reasoning calls (themes, summaries).
    pub models_reason: Vec<String>,
    pub gateway_max_attempts: u32,
    pub gateway_base_delay_ms: u64,
    pub gateway_max_delay_ms: u64,
    pub max_completion_tokens: u32,
    // News fetch
    pub global_query: String,
    pub local_query: String,
    pub search_max_results: usize,
    pub fetch_timeout_secs: u64,
    pub fetch_workers: usize,
    pub max_articles_total: usize,
    // Classification
    pub max_per_batch: usize,
    pub headline_only: bool,
    // Themes & summaries
    pub themes_max: usize,
    pub summary_items_per_region: usize,
    // Paths
    pub cache_path: String,
    pub output_dir: String,
    pub watchlist_path: String,
    // Region detection
    pub asia_keywords: Vec<String>,
    pub indonesia_keywords: Vec<String>,
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Don't fail if .env missing

        Ok(Config {
            api_url: env::var("OPENAI_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            models_classify: parse_list(
                &env::var("MODELS_CLASSIFY").unwrap_or_else(|_| "gpt-5-mini,gpt-5".to_string()),
            ),
            models_reason: parse_list(
                &env::var("MODELS_REASON").unwrap_or_else(|_| "gpt-5,gpt-5-mini".to_string()),
            ),
            gateway_max_attempts: env::var("GATEWAY_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "6".to_string())
                .parse()
                .context("Failed to parse GATEWAY_MAX_ATTEMPTS")?,
            gateway_base_delay_ms: env::var("GATEWAY_BASE_DELAY_MS")
                .unwrap_or_else(|_| "350".to_string())
                .parse()
                .context("Failed to parse GATEWAY_BASE_DELAY_MS")?,
            gateway_max_delay_ms: env::var("GATEWAY_MAX_DELAY_MS")
                .unwrap_or_else(|_| "6000".to_string())
                .parse()
                .context("Failed to parse GATEWAY_MAX_DELAY_MS")?,
            max_completion_tokens: env::var("MAX_COMPLETION_TOKENS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .context("Failed to parse MAX_COMPLETION_TOKENS")?,
            global_query: env::var("GLOBAL_QUERY")
                .unwrap_or_else(|_| "global market news Asia overnight".to_string()),
            local_query: env::var("LOCAL_QUERY")
                .unwrap_or_else(|_| "Indonesia market news today".to_string()),
            search_max_results: env::var("SEARCH_MAX_RESULTS")
                .unwrap_or_else(|_| "6".to_string())
                .parse()
                .context("Failed to parse SEARCH_MAX_RESULTS")?,
            fetch_timeout_secs: env::var("FETCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "12".to_string())
                .parse()
                .context("Failed to parse FETCH_TIMEOUT_SECS")?,
            fetch_workers: env::var("FETCH_WORKERS")
                .unwrap_or_else(|_| "6".to_string())
                .parse()
                .context("Failed to parse FETCH_WORKERS")?,
            max_articles_total: env::var("MAX_ARTICLES_TOTAL")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Failed to parse MAX_ARTICLES_TOTAL")?,
            max_per_batch: env::var("MAX_PER_BATCH")
                .unwrap_or_else(|_| "6".to_string())
                .parse()
                .context("Failed to parse MAX_PER_BATCH")?,
            headline_only: env::var("HEADLINE_ONLY")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Failed to parse HEADLINE_ONLY")?,
            themes_max: env::var("THEMES_MAX")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Failed to parse THEMES_MAX")?,
            summary_items_per_region: env::var("SUMMARY_ITEMS_PER_REGION")
                .unwrap_or_else(|_| "6".to_string())
                .parse()
                .context("Failed to parse SUMMARY_ITEMS_PER_REGION")?,
            cache_path: env::var("CACHE_PATH")
                .unwrap_or_else(|_| "outputs/model_cache.json".to_string()),
            output_dir: env::var("OUTPUT_DIR").unwrap_or_else(|_| "outputs".to_string()),
            watchlist_path: env::var("WATCHLIST_PATH")
                .unwrap_or_else(|_| "data/watchlist_curated.json".to_string()),
            asia_keywords: parse_list(&env::var("ASIA_KEYWORDS").unwrap_or_else(|_| {
                "asia,china,japan,korea,nikkei,hang seng,shanghai".to_string()
            })),
            indonesia_keywords: parse_list(
                &env::var("INDONESIA_KEYWORDS")
                    .unwrap_or_else(|_| "indonesia,jakarta,idx,rupiah,bank indonesia".to_string()),
            ),
        })
    }
}
