use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gateway::{ModelGateway, OutputContract};
use crate::news::NewsItem;

const MAX_RELATED: usize = 5;
const TRENDING_POOL: usize = 12;
const STOP_WORDS: [&str; 6] = ["The", "This", "That", "Market", "Global", "Today"];

/// A cross-cutting theme, grounded in the fetched item set. `support`
/// holds the 1-based indices of the supporting items and is never empty;
/// it stays internal and is not serialized into the brief.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    pub theme: String,
    pub description: String,
    pub region: String,
    pub priority: f64,
    pub related_news: Vec<String>,
    #[serde(skip)]
    pub support: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistAlert {
    pub alert: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_url: Option<String>,
}

/// Best-effort load of the curated watchlist (a JSON array of strings).
/// A missing or malformed file just means no curated terms.
pub fn load_watchlist(path: impl AsRef<Path>) -> Vec<String> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(terms) => {
                debug!("Loaded {} curated watchlist terms from {}", terms.len(), path.display());
                terms
            }
            Err(e) => {
                warn!("Watchlist file {} is malformed, ignoring: {}", path.display(), e);
                Vec::new()
            }
        },
        Err(_) => {
            debug!("No watchlist file at {}", path.display());
            Vec::new()
        }
    }
}

/// Case-insensitive match of each curated term against headline+content.
/// One story gets the headline wording, several get a count.
pub fn check_curated_watchlist(watchlist: &[String], items: &[NewsItem]) -> Vec<WatchlistAlert> {
    let mut alerts = Vec::new();
    for term in watchlist {
        let needle = term.to_lowercase();
        let hits: Vec<&NewsItem> = items
            .iter()
            .filter(|it| {
                format!("{} {}", it.headline, it.content).to_lowercase().contains(&needle)
            })
            .collect();
        if hits.is_empty() {
            continue;
        }
        let url = hits[0].url.clone();
        let alert = if hits.len() == 1 {
            format!("{}: {}", term, hits[0].headline)
        } else {
            format!("{}: Mentioned in {} stories", term, hits.len())
        };
        alerts.push(WatchlistAlert {
            alert,
            reference_url: if url.is_empty() { None } else { Some(url) },
        });
    }
    alerts
}

/// Capitalized tokens of four or more letters occurring more than once
/// across headlines, minus stop-words and curated terms.
fn trending_terms(items: &[NewsItem], watchlist: &[String], top_n: usize) -> Vec<(String, usize)> {
    let text: String = items
        .iter()
        .map(|it| it.headline.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let re = Regex::new(r"\b[A-Z][a-z]{3,}\b").expect("trending regex");

    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    for (pos, m) in re.find_iter(&text).enumerate() {
        let word = m.as_str().to_string();
        *counts.entry(word.clone()).or_insert(0) += 1;
        first_seen.entry(word).or_insert(pos);
    }

    let curated: Vec<String> = watchlist.iter().map(|w| w.to_lowercase()).collect();
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| first_seen[&a.0].cmp(&first_seen[&b.0])));
    ranked
        .into_iter()
        .take(TRENDING_POOL)
        .filter(|(w, c)| {
            *c > 1 && !curated.contains(&w.to_lowercase()) && !STOP_WORDS.contains(&w.as_str())
        })
        .take(top_n)
        .collect()
}

/// Trending terms rendered as watchlist alerts, each pointing at the
/// first headline that mentions the term.
pub fn find_dynamic_trends(
    items: &[NewsItem],
    watchlist: &[String],
    top_n: usize,
) -> Vec<WatchlistAlert> {
    trending_terms(items, watchlist, top_n)
        .into_iter()
        .map(|(term, count)| {
            let url = items
                .iter()
                .find(|it| it.headline.contains(&term))
                .map(|it| it.url.clone());
            WatchlistAlert {
                alert: format!("{}: Trending in news (mentioned {} times)", term, count),
                reference_url: url.filter(|u| !u.is_empty()),
            }
        })
        .collect()
}

fn majority_region(support: &[usize], items: &[NewsItem]) -> String {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for &i in support {
        if let Some(item) = items.get(i - 1) {
            *counts.entry(item.region.as_str()).or_insert(0) += 1;
        }
    }
    let Some(&max) = counts.values().max() else {
        return "Mixed".to_string();
    };
    let leaders: Vec<&str> = counts
        .iter()
        .filter(|(_, &c)| c == max)
        .map(|(&r, _)| r)
        .collect();
    if leaders.len() == 1 {
        leaders[0].to_string()
    } else {
        // No single majority region
        "Mixed".to_string()
    }
}

fn related_from_support(support: &[usize], items: &[NewsItem]) -> Vec<String> {
    support
        .iter()
        .filter_map(|&i| items.get(i - 1))
        .map(|it| it.headline.clone())
        .filter(|h| !h.is_empty())
        .take(MAX_RELATED)
        .collect()
}

fn priority_for(support_len: usize) -> f64 {
    if support_len >= 4 {
        1.0
    } else if support_len >= 3 {
        0.7
    } else {
        0.5
    }
}

/// Theme extraction: an LLM pass over the indexed item set whose output
/// is only trusted where it cites valid indices, with a trending-term
/// heuristic as the degraded path.
pub struct ThemeExtractor<'a> {
    gateway: &'a ModelGateway,
    themes_max: usize,
    max_tokens: u32,
}

impl<'a> ThemeExtractor<'a> {
    pub fn new(gateway: &'a ModelGateway, config: &Config) -> Self {
        ThemeExtractor {
            gateway,
            themes_max: config.themes_max,
            max_tokens: config.max_completion_tokens,
        }
    }

    pub async fn extract(&self, items: &[NewsItem], watchlist: &[String]) -> Vec<Theme> {
        if items.is_empty() {
            return Vec::new();
        }
        match self.extract_with_model(items).await {
            Some(themes) if !themes.is_empty() => {
                info!("Extracted {} grounded themes", themes.len());
                themes
            }
            _ => {
                info!("Theme extraction falling back to trending terms");
                self.fallback_themes(items, watchlist)
            }
        }
    }

    async fn extract_with_model(&self, items: &[NewsItem]) -> Option<Vec<Theme>> {
        let lines: Vec<String> = items
            .iter()
            .enumerate()
            .map(|(i, it)| {
                format!(
                    "{}. [{}] {} ({}, {})",
                    i + 1,
                    it.region,
                    it.headline,
                    it.sector.map(|s| s.as_str()).unwrap_or("Unknown"),
                    it.sentiment.map(|s| s.as_str()).unwrap_or("Neutral"),
                )
            })
            .collect();
        let prompt = format!(
            "You are an equity research assistant. From the following indexed headlines, \
             propose up to {} emerging themes that appear across multiple items. \
             Use only the provided headlines; do not invent facts or URLs.\n\n\
             Return ONLY a JSON object with this schema:\n\
             {{\"themes\":[{{\"theme\":\"short title\",\"description\":\"one-sentence explanation\",\
             \"support\":[<index>, <index>]}}]}}\n\
             support = 2-5 indices from the list that justify the theme.\n\n\
             Indexed headlines:\n{}",
            self.themes_max,
            lines.join("\n")
        );

        let reply = match self
            .gateway
            .complete(&prompt, &OutputContract::JsonObject, self.max_tokens)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Theme model call failed: {}", e);
                return None;
            }
        };
        let json = reply.into_json()?;
        Some(self.ground_themes(&json, items))
    }

    /// Enforce grounding: keep only indices that point into the item set,
    /// drop any theme with no surviving support.
    fn ground_themes(&self, json: &Value, items: &[NewsItem]) -> Vec<Theme> {
        let raw = json.get("themes").and_then(|v| v.as_array());
        let mut out = Vec::new();
        for t in raw.into_iter().flatten() {
            let support: Vec<usize> = t
                .get("support")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_u64())
                        .map(|v| v as usize)
                        .filter(|&i| i >= 1 && i <= items.len())
                        .collect()
                })
                .unwrap_or_default();
            if support.is_empty() {
                debug!("Dropping ungrounded theme: {:?}", t.get("theme"));
                continue;
            }
            let title: String = t
                .get("theme")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .chars()
                .take(140)
                .collect();
            let description = t
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            out.push(Theme {
                theme: title,
                description,
                region: majority_region(&support, items),
                priority: priority_for(support.len()),
                related_news: related_from_support(&support, items),
                support,
            });
            if out.len() >= self.themes_max {
                break;
            }
        }
        out
    }

    fn fallback_themes(&self, items: &[NewsItem], watchlist: &[String]) -> Vec<Theme> {
        trending_terms(items, watchlist, self.themes_max)
            .into_iter()
            .map(|(term, _)| {
                let support: Vec<usize> = items
                    .iter()
                    .enumerate()
                    .filter(|(_, it)| it.headline.contains(&term))
                    .map(|(i, _)| i + 1)
                    .collect();
                Theme {
                    description: format!("Multiple headlines reference {}.", term),
                    region: majority_region(&support, items),
                    priority: 0.5,
                    related_news: related_from_support(&support, items),
                    support,
                    theme: term,
                }
            })
            .collect()
    }
}
