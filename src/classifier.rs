use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gateway::{GatewayError, ModelGateway, OutputContract};
use crate::news::{NewsItem, Sector, Sentiment};

/// One discrete label family (sector or sentiment). The classifier is
/// generic over this seam so both instances share the same batching,
/// fallback and sweep machinery.
pub trait Label: Copy + PartialEq + std::fmt::Debug {
    /// JSON key in mapping entries ("sector" / "sentiment").
    const FIELD: &'static str;
    fn allowed_labels() -> Vec<&'static str>;
    fn fallback() -> Self;
    fn parse(s: &str) -> Option<Self>;
    fn get(item: &NewsItem) -> Option<Self>;
    fn set(item: &mut NewsItem, value: Self);
    /// Prompt preamble for a multi-item batch.
    fn batch_instructions() -> String;
    /// Prompt for a single-item fallback call.
    fn item_prompt(text: &str) -> String;
}

impl Label for Sector {
    const FIELD: &'static str = "sector";

    fn allowed_labels() -> Vec<&'static str> {
        Sector::ALLOWED.iter().map(|s| s.as_str()).collect()
    }

    fn fallback() -> Self {
        Sector::Unknown
    }

    fn parse(s: &str) -> Option<Self> {
        Sector::parse(s)
    }

    fn get(item: &NewsItem) -> Option<Self> {
        item.sector
    }

    fn set(item: &mut NewsItem, value: Self) {
        item.sector = Some(value);
    }

    fn batch_instructions() -> String {
        format!(
            "Assign exactly one GICS sector to each headline from this set:\n{}\n\n\
             Return ONLY a JSON object:\n\
             {{\"mapping\":[{{\"i\": <absolute_index>, \"sector\": \"<sector>\"}}]}}\n\
             Use <absolute_index> as the 1-based index shown before each headline.\n\n",
            Self::allowed_labels().join(", ")
        )
    }

    fn item_prompt(text: &str) -> String {
        format!(
            "Assign exactly one GICS sector from this set: {}.\n\
             Return ONLY a JSON object: {{\"sector\": \"<sector>\"}}\n\n\
             Headline: {}",
            Self::allowed_labels().join(", "),
            text
        )
    }
}

impl Label for Sentiment {
    const FIELD: &'static str = "sentiment";

    fn allowed_labels() -> Vec<&'static str> {
        Sentiment::ALLOWED.iter().map(|s| s.as_str()).collect()
    }

    fn fallback() -> Self {
        Sentiment::Neutral
    }

    fn parse(s: &str) -> Option<Self> {
        Sentiment::parse(s)
    }

    fn get(item: &NewsItem) -> Option<Self> {
        item.sentiment
    }

    fn set(item: &mut NewsItem, value: Self) {
        item.sentiment = Some(value);
    }

    fn batch_instructions() -> String {
        "For each headline, assign sentiment strictly as one of: Positive, Negative, Neutral.\n\
         Return ONLY a JSON object:\n\
         {\"mapping\":[{\"i\": <absolute_index>, \"sentiment\": \"Positive|Negative|Neutral\"}]}\n\
         Use <absolute_index> as the 1-based index shown before each headline.\n\n"
            .to_string()
    }

    fn item_prompt(text: &str) -> String {
        format!(
            "Assign sentiment strictly as one of: Positive, Negative, Neutral.\n\
             Return ONLY a JSON object: {{\"sentiment\": \"<sentiment>\"}}\n\n\
             Headline: {}",
            text
        )
    }
}

fn mapping_schema<L: Label>() -> Value {
    let mut entry_props = serde_json::Map::new();
    entry_props.insert("i".to_string(), json!({"type": "integer"}));
    entry_props.insert(
        L::FIELD.to_string(),
        json!({"type": "string", "enum": L::allowed_labels()}),
    );
    json!({
        "type": "object",
        "properties": {
            "mapping": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": Value::Object(entry_props),
                    "required": ["i", L::FIELD],
                    "additionalProperties": false
                }
            }
        },
        "required": ["mapping"],
        "additionalProperties": false
    })
}

/// Batched label assignment with per-item fallback and an unconditional
/// final sweep. Postcondition: every item carries a label of type `L`
/// when `assign` returns, even under total backend failure.
pub struct BatchClassifier<'a> {
    gateway: &'a ModelGateway,
    batch_size: usize,
    headline_only: bool,
    workers: usize,
    max_tokens: u32,
}

impl<'a> BatchClassifier<'a> {
    pub fn new(gateway: &'a ModelGateway, config: &Config) -> Self {
        BatchClassifier {
            gateway,
            batch_size: config.max_per_batch.max(1),
            headline_only: config.headline_only,
            workers: config.fetch_workers.max(1),
            max_tokens: config.max_completion_tokens,
        }
    }

    pub async fn assign<L: Label>(&self, items: &mut [NewsItem]) {
        if items.is_empty() {
            return;
        }
        let targets: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, it)| L::get(it).is_none())
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            info!("All {} items already carry a {}", items.len(), L::FIELD);
            return;
        }
        info!(
            "Classifying {} of {} items ({}, batches of {})",
            targets.len(),
            items.len(),
            L::FIELD,
            self.batch_size
        );

        for batch in targets.chunks(self.batch_size) {
            match self.classify_batch::<L>(items, batch).await {
                Ok(applied) => {
                    debug!("Batch of {} applied {} {} labels", batch.len(), applied, L::FIELD);
                }
                Err(e) => {
                    warn!(
                        "Batch {} classification failed ({}), falling back per-item",
                        L::FIELD, e
                    );
                    self.classify_per_item::<L>(items, batch).await;
                }
            }
        }

        // Final sweep: the postcondition holds even if every call failed.
        let mut defaulted = 0usize;
        for item in items.iter_mut() {
            if L::get(item).is_none() {
                L::set(item, L::fallback());
                defaulted += 1;
            }
        }
        if defaulted > 0 {
            info!("Defaulted {} to {:?} ({})", defaulted, L::fallback(), L::FIELD);
        }
    }

    /// One multi-item call. Labels apply by absolute 1-based index:
    /// out-of-range indices are ignored, duplicates last-write-wins,
    /// labels outside the allowed set coerce to the fallback.
    async fn classify_batch<L: Label>(
        &self,
        items: &mut [NewsItem],
        batch: &[usize],
    ) -> Result<usize, GatewayError> {
        let lines: Vec<String> = batch
            .iter()
            .map(|&i| format!("{}. {}", i + 1, items[i].classification_text(self.headline_only)))
            .collect();
        let prompt = format!("{}{}", L::batch_instructions(), lines.join("\n"));

        let contract = OutputContract::JsonSchema {
            name: "mapping",
            schema: mapping_schema::<L>(),
        };
        let reply = self.gateway.complete(&prompt, &contract, self.max_tokens).await?;
        let json = reply.into_json().ok_or(GatewayError::MalformedOutput)?;
        let mapping = json
            .get("mapping")
            .and_then(|v| v.as_array())
            .ok_or(GatewayError::MalformedOutput)?;

        let mut applied = 0usize;
        for entry in mapping {
            let idx = entry.get("i").and_then(|v| v.as_i64()).unwrap_or(0) - 1;
            if idx < 0 || idx as usize >= items.len() {
                continue;
            }
            let raw = entry.get(L::FIELD).and_then(|v| v.as_str()).unwrap_or("");
            let label = L::parse(raw).unwrap_or_else(L::fallback);
            L::set(&mut items[idx as usize], label);
            applied += 1;
        }
        Ok(applied)
    }

    /// Per-item fallback for one failed batch: bounded fan-out, one call
    /// per item. Individual failures leave the item for the final sweep.
    async fn classify_per_item<L: Label>(&self, items: &mut [NewsItem], batch: &[usize]) {
        let texts: Vec<(usize, String)> = batch
            .iter()
            .map(|&i| (i, items[i].classification_text(self.headline_only)))
            .collect();

        let results: Vec<(usize, Option<L>)> =
            stream::iter(texts.into_iter().map(|(i, text)| async move {
                (i, self.classify_one::<L>(&text).await)
            }))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut applied = 0usize;
        for (i, label) in results {
            if let Some(label) = label {
                L::set(&mut items[i], label);
                applied += 1;
            }
        }
        info!(
            "Per-item fallback labeled {}/{} items ({})",
            applied,
            batch.len(),
            L::FIELD
        );
    }

    async fn classify_one<L: Label>(&self, text: &str) -> Option<L> {
        let prompt = L::item_prompt(text);
        match self
            .gateway
            .complete(&prompt, &OutputContract::JsonObject, 120)
            .await
        {
            Ok(reply) => reply
                .into_json()
                .and_then(|j| j.get(L::FIELD).and_then(|v| v.as_str()).map(String::from))
                .map(|s| L::parse(&s).unwrap_or_else(L::fallback)),
            Err(e) => {
                debug!("Per-item {} call failed: {}", L::FIELD, e);
                None
            }
        }
    }
}
