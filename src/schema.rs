//! Fixed shape check for the serialized brief. Validation is advisory:
//! the pipeline logs failures and still writes both output files, so a
//! drifting field never blocks the morning run.

use serde_json::Value;

const SENTIMENT_KEYS: [&str; 3] = ["Positive", "Negative", "Neutral"];

/// Check the serialized brief against the fixed document shape.
/// Returns every problem found, not just the first.
pub fn validate_brief(brief: &Value) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    let Some(root) = brief.as_object() else {
        return Err(vec!["brief is not a JSON object".to_string()]);
    };

    for key in [
        "date",
        "market_summaries",
        "economic_events",
        "news_by_sector",
        "watchlist_alerts",
        "emerging_themes",
        "sentiment_indicators",
    ] {
        if !root.contains_key(key) {
            errors.push(format!("missing required field: {}", key));
        }
    }

    if let Some(date) = root.get("date") {
        if !date.is_string() {
            errors.push("date must be a string".to_string());
        }
    }

    if let Some(ms) = root.get("market_summaries") {
        match ms.as_object() {
            Some(map) => {
                for key in ["global", "asia", "indonesia"] {
                    if !map.get(key).map(Value::is_string).unwrap_or(false) {
                        errors.push(format!("market_summaries.{} must be a string", key));
                    }
                }
            }
            None => errors.push("market_summaries must be an object".to_string()),
        }
    }

    if let Some(events) = root.get("economic_events") {
        if !events.is_array() {
            errors.push("economic_events must be an array".to_string());
        }
    }

    if let Some(nbs) = root.get("news_by_sector") {
        match nbs.as_object() {
            Some(map) => {
                for (sector, items) in map {
                    let Some(items) = items.as_array() else {
                        errors.push(format!("news_by_sector.{} must be an array", sector));
                        continue;
                    };
                    for (i, item) in items.iter().enumerate() {
                        validate_news_item(sector, i, item, &mut errors);
                    }
                }
            }
            None => errors.push("news_by_sector must be an object".to_string()),
        }
    }

    if let Some(alerts) = root.get("watchlist_alerts") {
        match alerts.as_array() {
            Some(list) => {
                for (i, alert) in list.iter().enumerate() {
                    if !alert
                        .get("alert")
                        .map(Value::is_string)
                        .unwrap_or(false)
                    {
                        errors.push(format!("watchlist_alerts[{}].alert must be a string", i));
                    }
                }
            }
            None => errors.push("watchlist_alerts must be an array".to_string()),
        }
    }

    if let Some(themes) = root.get("emerging_themes") {
        match themes.as_array() {
            Some(list) => {
                for (i, theme) in list.iter().enumerate() {
                    validate_theme(i, theme, &mut errors);
                }
            }
            None => errors.push("emerging_themes must be an array".to_string()),
        }
    }

    if let Some(si) = root.get("sentiment_indicators") {
        match si.as_object() {
            Some(map) => {
                for (sector, counts) in map {
                    let Some(counts) = counts.as_object() else {
                        errors.push(format!("sentiment_indicators.{} must be an object", sector));
                        continue;
                    };
                    for key in SENTIMENT_KEYS {
                        if !counts.get(key).map(Value::is_u64).unwrap_or(false) {
                            errors.push(format!(
                                "sentiment_indicators.{}.{} must be a non-negative integer",
                                sector, key
                            ));
                        }
                    }
                }
            }
            None => errors.push("sentiment_indicators must be an object".to_string()),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_news_item(sector: &str, index: usize, item: &Value, errors: &mut Vec<String>) {
    let at = |field: &str| format!("news_by_sector.{}[{}].{}", sector, index, field);
    for field in ["headline", "source", "url", "region", "sentiment", "theme"] {
        if !item.get(field).map(Value::is_string).unwrap_or(false) {
            errors.push(format!("{} must be a string", at(field)));
        }
    }
    if !item.get("priority").map(Value::is_number).unwrap_or(false) {
        errors.push(format!("{} must be a number", at("priority")));
    }
}

fn validate_theme(index: usize, theme: &Value, errors: &mut Vec<String>) {
    let at = |field: &str| format!("emerging_themes[{}].{}", index, field);
    for field in ["theme", "description", "region"] {
        if !theme.get(field).map(Value::is_string).unwrap_or(false) {
            errors.push(format!("{} must be a string", at(field)));
        }
    }
    if !theme.get("priority").map(Value::is_number).unwrap_or(false) {
        errors.push(format!("{} must be a number", at("priority")));
    }
    match theme.get("related_news").and_then(Value::as_array) {
        Some(related) => {
            if related.iter().any(|v| !v.is_string()) {
                errors.push(format!("{} entries must be strings", at("related_news")));
            }
        }
        None => errors.push(format!("{} must be an array", at("related_news"))),
    }
}
