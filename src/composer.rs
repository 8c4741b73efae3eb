use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::config::Config;
use crate::gateway::{ModelGateway, OutputContract};
use crate::news::{extract_source, NewsItem, Region, Sentiment};
use crate::themes::{Theme, WatchlistAlert};

const SUMMARY_MAX_TOKENS: u32 = 350;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSummaries {
    pub global: String,
    pub asia: String,
    pub indonesia: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
}

/// Per-sector sentiment counts, serialized with the label names as keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentimentCounts {
    #[serde(rename = "Positive")]
    pub positive: usize,
    #[serde(rename = "Negative")]
    pub negative: usize,
    #[serde(rename = "Neutral")]
    pub neutral: usize,
}

impl SentimentCounts {
    pub fn tally(items: &[NewsItem]) -> Self {
        let mut counts = SentimentCounts::default();
        for item in items {
            match item.sentiment.unwrap_or(Sentiment::Neutral) {
                Sentiment::Positive => counts.positive += 1,
                Sentiment::Negative => counts.negative += 1,
                Sentiment::Neutral => counts.neutral += 1,
            }
        }
        counts
    }
}

/// One news item as it appears in the brief. All labels are concrete
/// strings here; the pipeline's final sweep guarantees that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefItem {
    pub headline: String,
    pub source: String,
    pub url: String,
    pub region: String,
    pub sentiment: String,
    pub priority: f64,
    pub theme: String,
}

impl From<&NewsItem> for BriefItem {
    fn from(it: &NewsItem) -> Self {
        BriefItem {
            headline: it.headline.clone(),
            source: if it.source.is_empty() {
                extract_source(&it.url)
            } else {
                it.source.clone()
            },
            url: it.url.clone(),
            region: it.region.to_string(),
            sentiment: it.sentiment.unwrap_or(Sentiment::Neutral).as_str().to_string(),
            priority: it.priority,
            theme: it.theme.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Brief {
    pub date: String,
    pub market_summaries: MarketSummaries,
    pub economic_events: Vec<EconomicEvent>,
    pub news_by_sector: BTreeMap<String, Vec<BriefItem>>,
    pub watchlist_alerts: Vec<WatchlistAlert>,
    pub emerging_themes: Vec<Theme>,
    pub sentiment_indicators: BTreeMap<String, SentimentCounts>,
}

/// Deterministic template used whenever the model cannot provide a
/// region summary.
pub fn fallback_summary(items: &[&NewsItem], label: &str) -> String {
    let mut counts = SentimentCounts::default();
    for it in items {
        match it.sentiment.unwrap_or(Sentiment::Neutral) {
            Sentiment::Positive => counts.positive += 1,
            Sentiment::Negative => counts.negative += 1,
            Sentiment::Neutral => counts.neutral += 1,
        }
    }
    format!(
        "{} headlines: {} items (Positive {}, Negative {}, Neutral {}).",
        label,
        items.len(),
        counts.positive,
        counts.negative,
        counts.neutral
    )
}

fn partition_by_region(items: &[NewsItem]) -> (Vec<&NewsItem>, Vec<&NewsItem>, Vec<&NewsItem>) {
    let pick = |r: Region| items.iter().filter(move |it| it.region == r).collect();
    (pick(Region::Global), pick(Region::Asia), pick(Region::Indonesia))
}

/// Builds the brief document. Region summaries come from the model
/// constrained to a per-region digest; everything else is assembled
/// strictly from pipeline inputs, so no URL can appear that was not
/// fetched.
pub struct BriefComposer<'a> {
    gateway: &'a ModelGateway,
    items_per_region: usize,
}

impl<'a> BriefComposer<'a> {
    pub fn new(gateway: &'a ModelGateway, config: &Config) -> Self {
        BriefComposer {
            gateway,
            items_per_region: config.summary_items_per_region,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn compose(
        &self,
        date: &str,
        items: &[NewsItem],
        news_by_sector: &BTreeMap<String, Vec<NewsItem>>,
        economic_events: Vec<EconomicEvent>,
        watchlist_alerts: Vec<WatchlistAlert>,
        emerging_themes: Vec<Theme>,
        sentiment_indicators: BTreeMap<String, SentimentCounts>,
    ) -> Brief {
        let market_summaries = self.summarize_regions(items).await;
        let news_by_sector = news_by_sector
            .iter()
            .map(|(sector, items)| {
                (sector.clone(), items.iter().map(BriefItem::from).collect())
            })
            .collect();
        Brief {
            date: date.to_string(),
            market_summaries,
            economic_events,
            news_by_sector,
            watchlist_alerts,
            emerging_themes,
            sentiment_indicators,
        }
    }

    async fn summarize_regions(&self, items: &[NewsItem]) -> MarketSummaries {
        let (global, asia, indonesia) = partition_by_region(items);
        let digest = |items: &[&NewsItem]| -> String {
            let bullets: Vec<String> = items
                .iter()
                .take(self.items_per_region)
                .map(|it| {
                    format!(
                        "- [{}/{}] {}",
                        it.sector.map(|s| s.as_str()).unwrap_or("Unknown"),
                        it.sentiment.map(|s| s.as_str()).unwrap_or("Neutral"),
                        it.headline
                    )
                })
                .collect();
            if bullets.is_empty() {
                "(no items)".to_string()
            } else {
                bullets.join("\n")
            }
        };
        let prompt = format!(
            "Write concise, factual summaries (1-2 sentences each) for Global, Asia, and \
             Indonesia based only on the bullets below. Do not invent facts.\n\
             Return ONLY JSON: {{\"global\":\"...\",\"asia\":\"...\",\"indonesia\":\"...\"}}\n\n\
             Global:\n{}\n\nAsia:\n{}\n\nIndonesia:\n{}\n",
            digest(&global),
            digest(&asia),
            digest(&indonesia)
        );

        let model_fields = match self
            .gateway
            .complete(&prompt, &OutputContract::JsonObject, SUMMARY_MAX_TOKENS)
            .await
        {
            Ok(reply) => reply.into_json(),
            Err(e) => {
                warn!("Summary model call failed, using templated summaries: {}", e);
                None
            }
        };

        // Per-field fallback: a missing or empty field degrades alone.
        let field = |key: &str| -> Option<String> {
            model_fields
                .as_ref()
                .and_then(|j| j.get(key))
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        MarketSummaries {
            global: field("global").unwrap_or_else(|| fallback_summary(&global, "Global")),
            asia: field("asia").unwrap_or_else(|| fallback_summary(&asia, "Asia")),
            indonesia: field("indonesia")
                .unwrap_or_else(|| fallback_summary(&indonesia, "Indonesia")),
        }
    }
}

/// Pure Markdown render of a composed brief. Never calls the model.
pub fn render_markdown(brief: &Brief) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("# Morning Market Brief — {}", brief.date));
    lines.push(String::new());

    lines.push("## Market Summaries".to_string());
    lines.push(format!("- **Global:** {}", brief.market_summaries.global));
    lines.push(format!("- **Asia:** {}", brief.market_summaries.asia));
    lines.push(format!("- **Indonesia:** {}", brief.market_summaries.indonesia));
    lines.push(String::new());

    lines.push("## Economic Events".to_string());
    if brief.economic_events.is_empty() {
        lines.push("- None".to_string());
    } else {
        for e in &brief.economic_events {
            match &e.impact {
                Some(impact) if !impact.is_empty() => {
                    lines.push(format!("- {} — {}", e.event, impact))
                }
                _ => lines.push(format!("- {}", e.event)),
            }
        }
    }
    lines.push(String::new());

    lines.push("## News by Sector".to_string());
    for (sector, items) in &brief.news_by_sector {
        lines.push(format!("### {}", sector));
        if items.is_empty() {
            lines.push("- None".to_string());
        } else {
            for it in items {
                lines.push(format!(
                    "- [{}] {} ({}) — [{}]({})",
                    it.region, it.headline, it.sentiment, it.source, it.url
                ));
            }
        }
        lines.push(String::new());
    }

    lines.push("## Watchlist Alerts".to_string());
    if brief.watchlist_alerts.is_empty() {
        lines.push("- None".to_string());
    } else {
        for a in &brief.watchlist_alerts {
            match &a.reference_url {
                Some(url) => lines.push(format!("- {} — [source]({})", a.alert, url)),
                None => lines.push(format!("- {}", a.alert)),
            }
        }
    }
    lines.push(String::new());

    lines.push("## Emerging Themes".to_string());
    if brief.emerging_themes.is_empty() {
        lines.push("- None".to_string());
    } else {
        for t in &brief.emerging_themes {
            lines.push(format!("- **{}** [{}]: {}", t.theme, t.region, t.description));
        }
    }
    lines.push(String::new());

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_gateway(uri: &str) -> ModelGateway {
        let mut config = Config::from_env().unwrap();
        config.api_url = uri.to_string();
        config.api_key = "test-key".to_string();
        config.gateway_max_attempts = 2;
        config.gateway_base_delay_ms = 1;
        config.gateway_max_delay_ms = 2;
        ModelGateway::new(&config, &["gpt-5".to_string()]).unwrap()
    }

    fn chat_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-test",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        })
    }

    fn labeled(headline: &str, url: &str, region: Region, sentiment: Sentiment) -> NewsItem {
        let mut item = NewsItem::new(headline.to_string(), url.to_string(), region);
        item.sentiment = Some(sentiment);
        item
    }

    #[test]
    fn test_fallback_summary_template() {
        let items = vec![
            labeled("a", "u1", Region::Global, Sentiment::Positive),
            labeled("b", "u2", Region::Global, Sentiment::Negative),
            labeled("c", "u3", Region::Global, Sentiment::Neutral),
            labeled("d", "u4", Region::Global, Sentiment::Neutral),
        ];
        let refs: Vec<&NewsItem> = items.iter().collect();
        assert_eq!(
            fallback_summary(&refs, "Global"),
            "Global headlines: 4 items (Positive 1, Negative 1, Neutral 2)."
        );
    }

    #[test]
    fn test_fallback_summary_empty_region() {
        assert_eq!(
            fallback_summary(&[], "Asia"),
            "Asia headlines: 0 items (Positive 0, Negative 0, Neutral 0)."
        );
    }

    #[test]
    fn test_sentiment_counts_default_neutral_for_unlabeled() {
        let items = vec![
            NewsItem::new("x", "u1", Region::Global),
            labeled("y", "u2", Region::Global, Sentiment::Positive),
        ];
        let counts = SentimentCounts::tally(&items);
        assert_eq!(counts.positive, 1);
        assert_eq!(counts.neutral, 1);
        assert_eq!(counts.negative, 0);
    }

    #[test]
    fn test_sentiment_counts_serialize_with_label_keys() {
        let counts = SentimentCounts { positive: 2, negative: 1, neutral: 3 };
        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json["Positive"], 2);
        assert_eq!(json["Negative"], 1);
        assert_eq!(json["Neutral"], 3);
    }

    #[test]
    fn test_brief_item_derives_source_from_url() {
        let item = NewsItem::new("h", "https://www.reuters.com/markets/x", Region::Global);
        let brief_item = BriefItem::from(&item);
        assert_eq!(brief_item.source, "Reuters");
        assert_eq!(brief_item.sentiment, "Neutral");
    }

    #[tokio::test]
    async fn test_compose_with_model_summaries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(
                r#"{"global":"Stocks rose.","asia":"Nikkei gained.","indonesia":""}"#,
            )))
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri());
        let config = Config::from_env().unwrap();
        let composer = BriefComposer::new(&gateway, &config);

        let items = vec![
            labeled("US stocks rally", "https://a.com/1", Region::Global, Sentiment::Positive),
            labeled("IDX flat", "https://b.id/2", Region::Indonesia, Sentiment::Neutral),
        ];
        let mut by_sector = BTreeMap::new();
        by_sector.insert("Unknown".to_string(), items.clone());

        let brief = composer
            .compose("2026-08-28", &items, &by_sector, vec![], vec![], vec![], BTreeMap::new())
            .await;

        assert_eq!(brief.market_summaries.global, "Stocks rose.");
        assert_eq!(brief.market_summaries.asia, "Nikkei gained.");
        // Empty field degrades to the template on its own.
        assert_eq!(
            brief.market_summaries.indonesia,
            "Indonesia headlines: 1 items (Positive 0, Negative 0, Neutral 1)."
        );
        assert_eq!(brief.news_by_sector["Unknown"].len(), 2);
    }

    #[tokio::test]
    async fn test_compose_all_fallback_when_gateway_down() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("down"))
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri());
        let config = Config::from_env().unwrap();
        let composer = BriefComposer::new(&gateway, &config);

        let items = vec![labeled("IDX flat", "https://b.id/2", Region::Indonesia, Sentiment::Neutral)];
        let brief = composer
            .compose("2026-08-28", &items, &BTreeMap::new(), vec![], vec![], vec![], BTreeMap::new())
            .await;

        assert_eq!(
            brief.market_summaries.global,
            "Global headlines: 0 items (Positive 0, Negative 0, Neutral 0)."
        );
        assert_eq!(
            brief.market_summaries.indonesia,
            "Indonesia headlines: 1 items (Positive 0, Negative 0, Neutral 1)."
        );
    }

    #[test]
    fn test_render_markdown_layout() {
        let mut by_sector = BTreeMap::new();
        by_sector.insert(
            "Energy".to_string(),
            vec![BriefItem {
                headline: "Oil climbs".to_string(),
                source: "Reuters".to_string(),
                url: "https://reuters.com/1".to_string(),
                region: "Global".to_string(),
                sentiment: "Positive".to_string(),
                priority: 0.0,
                theme: String::new(),
            }],
        );
        let brief = Brief {
            date: "2026-08-28".to_string(),
            market_summaries: MarketSummaries {
                global: "g".to_string(),
                asia: "a".to_string(),
                indonesia: "i".to_string(),
            },
            economic_events: vec![],
            news_by_sector: by_sector,
            watchlist_alerts: vec![WatchlistAlert {
                alert: "Nickel: Mentioned in 2 stories".to_string(),
                reference_url: Some("https://a.id/1".to_string()),
            }],
            emerging_themes: vec![],
            sentiment_indicators: BTreeMap::new(),
        };

        let md = render_markdown(&brief);
        assert!(md.starts_with("# Morning Market Brief — 2026-08-28"));
        assert!(md.contains("## Market Summaries"));
        assert!(md.contains("- **Global:** g"));
        assert!(md.contains("## Economic Events\n- None"));
        assert!(md.contains("### Energy"));
        assert!(md.contains("- [Global] Oil climbs (Positive) — [Reuters](https://reuters.com/1)"));
        assert!(md.contains("- Nickel: Mentioned in 2 stories — [source](https://a.id/1)"));
        assert!(md.contains("## Emerging Themes\n- None"));
    }

    #[test]
    fn test_render_markdown_theme_lines() {
        let brief = Brief {
            date: "2026-08-28".to_string(),
            market_summaries: MarketSummaries {
                global: String::new(),
                asia: String::new(),
                indonesia: String::new(),
            },
            economic_events: vec![EconomicEvent {
                event: "FOMC minutes".to_string(),
                impact: Some("High".to_string()),
            }],
            news_by_sector: BTreeMap::new(),
            watchlist_alerts: vec![],
            emerging_themes: vec![Theme {
                theme: "Chip demand".to_string(),
                description: "AI capex lifts chipmakers.".to_string(),
                region: "Asia".to_string(),
                priority: 0.7,
                related_news: vec![],
                support: vec![1, 2, 3],
            }],
            sentiment_indicators: BTreeMap::new(),
        };
        let md = render_markdown(&brief);
        assert!(md.contains("- FOMC minutes — High"));
        assert!(md.contains("- **Chip demand** [Asia]: AI capex lifts chipmakers."));
        assert!(md.contains("## Watchlist Alerts\n- None"));
    }
}
