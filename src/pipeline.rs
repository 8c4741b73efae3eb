use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::cache::{CacheEntry, ResultCache};
use crate::classifier::BatchClassifier;
use crate::composer::{render_markdown, Brief, BriefComposer, SentimentCounts};
use crate::config::Config;
use crate::gateway::ModelGateway;
use crate::news::{NewsFetcher, NewsItem, Sector, Sentiment};
use crate::schema::validate_brief;
use crate::themes::{check_curated_watchlist, find_dynamic_trends, load_watchlist, ThemeExtractor};

const DYNAMIC_TRENDS_MAX: usize = 3;

pub struct RunOutput {
    pub brief: Brief,
    pub json_path: PathBuf,
    pub md_path: PathBuf,
}

/// The whole morning run, end to end. Every stage degrades rather than
/// aborts: the run always produces both output files, with deterministic
/// fallbacks standing in wherever the model backend was unavailable.
pub struct Pipeline {
    config: Config,
    classify_gateway: ModelGateway,
    reason_gateway: ModelGateway,
    fetcher: NewsFetcher,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        let classify_gateway = ModelGateway::new(&config, &config.models_classify)
            .context("Failed to build classification gateway")?;
        let reason_gateway = ModelGateway::new(&config, &config.models_reason)
            .context("Failed to build reasoning gateway")?;
        let fetcher = NewsFetcher::new(&config)?;
        Ok(Pipeline {
            config,
            classify_gateway,
            reason_gateway,
            fetcher,
        })
    }

    pub async fn run(&self) -> Result<RunOutput> {
        let date = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();
        self.run_for_date(&date).await
    }

    pub async fn run_for_date(&self, date: &str) -> Result<RunOutput> {
        info!("Generating morning brief for {}", date);

        // 1. Fetch
        let mut items = self.fetcher.fetch_all(&self.classify_gateway).await;

        // 2. Cache prefill
        let mut cache = ResultCache::load(&self.config.cache_path);
        let hits = prefill_from_cache(&cache, &mut items);
        info!("Cache prefill: {} of {} items already labeled", hits, items.len());

        // 3-4. Classify
        let classifier = BatchClassifier::new(&self.classify_gateway, &self.config);
        classifier.assign::<Sector>(&mut items).await;
        classifier.assign::<Sentiment>(&mut items).await;

        // 5. Group and aggregate
        let news_by_sector = group_by_sector(&items);
        let sentiment_indicators: BTreeMap<String, SentimentCounts> = news_by_sector
            .iter()
            .map(|(sector, items)| (sector.clone(), SentimentCounts::tally(items)))
            .collect();

        // 6. Watchlist alerts
        let watchlist = load_watchlist(&self.config.watchlist_path);
        let mut alerts = check_curated_watchlist(&watchlist, &items);
        alerts.extend(find_dynamic_trends(&items, &watchlist, DYNAMIC_TRENDS_MAX));
        info!("Watchlist alerts: {}", alerts.len());

        // 7. Themes
        let themes = ThemeExtractor::new(&self.reason_gateway, &self.config)
            .extract(&items, &watchlist)
            .await;

        // 8. Compose
        let composer = BriefComposer::new(&self.reason_gateway, &self.config);
        let brief = composer
            .compose(
                date,
                &items,
                &news_by_sector,
                Vec::new(),
                alerts,
                themes,
                sentiment_indicators,
            )
            .await;

        // 9. Validate (advisory)
        let brief_json = serde_json::to_value(&brief).context("Failed to serialize brief")?;
        match validate_brief(&brief_json) {
            Ok(()) => info!("Brief validation succeeded"),
            Err(errors) => error!("Brief validation failed: {}", errors.join("; ")),
        }

        // 10. Persist outputs
        let (json_path, md_path) = self.write_outputs(date, &brief_json, &brief)?;
        info!("Morning brief saved: {}, {}", json_path.display(), md_path.display());

        // 11. Cache writeback
        write_back_cache(&mut cache, &items);
        if let Err(e) = cache.persist() {
            warn!("Failed to persist result cache: {}", e);
        }

        Ok(RunOutput { brief, json_path, md_path })
    }

    fn write_outputs(
        &self,
        date: &str,
        brief_json: &serde_json::Value,
        brief: &Brief,
    ) -> Result<(PathBuf, PathBuf)> {
        let out_dir = PathBuf::from(&self.config.output_dir);
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("Failed to create output dir {}", out_dir.display()))?;

        let json_path = out_dir.join(format!("{}_brief.json", date));
        fs::write(&json_path, serde_json::to_string_pretty(brief_json)?)
            .with_context(|| format!("Failed to write {}", json_path.display()))?;

        let md_path = out_dir.join(format!("{}_brief.md", date));
        fs::write(&md_path, render_markdown(brief))
            .with_context(|| format!("Failed to write {}", md_path.display()))?;

        Ok((json_path, md_path))
    }
}

/// Apply cached labels before classification so already-seen URLs never
/// hit the model again.
pub fn prefill_from_cache(cache: &ResultCache, items: &mut [NewsItem]) -> usize {
    let mut hits = 0usize;
    for item in items.iter_mut() {
        let Some(entry) = cache.get(&item.url) else {
            continue;
        };
        let mut hit = false;
        if item.sector.is_none() {
            if let Some(sector) = entry.sector.as_deref().and_then(Sector::parse) {
                item.sector = Some(sector);
                hit = true;
            }
        }
        if item.sentiment.is_none() {
            if let Some(sentiment) = entry.sentiment.as_deref().and_then(Sentiment::parse) {
                item.sentiment = Some(sentiment);
                hit = true;
            }
        }
        if hit {
            hits += 1;
        }
    }
    hits
}

pub fn write_back_cache(cache: &mut ResultCache, items: &[NewsItem]) {
    for item in items {
        cache.set(
            &item.url,
            CacheEntry {
                sector: item.sector.map(|s| s.as_str().to_string()),
                sentiment: item.sentiment.map(|s| s.as_str().to_string()),
            },
        );
    }
}

fn group_by_sector(items: &[NewsItem]) -> BTreeMap<String, Vec<NewsItem>> {
    let mut groups: BTreeMap<String, Vec<NewsItem>> = BTreeMap::new();
    for item in items {
        let sector = item.sector.unwrap_or(Sector::Unknown).as_str().to_string();
        groups.entry(sector).or_default().push(item.clone());
    }
    groups
}
