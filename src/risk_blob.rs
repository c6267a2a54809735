//! Builds the text that gets embedded for a risk assessment object.

use serde_json::Value;

/// Separator between a category score and its note. Vectors already in the
/// index were built from text using this exact character.
const NOTE_SEPARATOR: &str = " \u{2014} ";

/// Headline fields pulled from a risk object, tolerant of key spellings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskHeadline {
    pub risk_level: Option<String>,
    pub aggregated_score: Option<f64>,
}

pub fn risk_headline(risk: &Value) -> RiskHeadline {
    let aggregated_score = first_present(risk, &["aggregated_score", "risk_score", "aggregatedScore"])
        .and_then(Value::as_f64);
    let risk_level = first_present(risk, &["risk_level", "riskLevel"]).map(display_value);

    RiskHeadline {
        risk_level,
        aggregated_score,
    }
}

/// Renders summary, overall level and per-category notes as plain lines.
pub fn build_risk_blob(risk: &Value) -> String {
    let mut parts = Vec::<String>::new();

    if let Some(summary) = risk
        .get("summary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        parts.push(format!("Summary: {summary}"));
    }

    let score = first_present(risk, &["aggregated_score", "risk_score", "aggregatedScore"]);
    let level = first_present(risk, &["risk_level", "riskLevel"]);
    if score.is_some() || level.is_some() {
        parts.push(format!(
            "Overall: {} ({}%)",
            level.map(display_value).unwrap_or_else(|| "Unknown".to_string()),
            score.map(display_value).unwrap_or_else(|| "N/A".to_string()),
        ));
    }

    match risk.get("category_scores").and_then(Value::as_object) {
        Some(categories) if !categories.is_empty() => {
            parts.push("Category details:".to_string());
            for (category, value) in categories {
                parts.push(category_line(category, value));
            }
        }
        _ => parts.push("No category breakdown available.".to_string()),
    }

    parts.join("\n").trim().to_string()
}

fn category_line(category: &str, value: &Value) -> String {
    match value {
        Value::Object(fields) => {
            let score = fields
                .get("score")
                .filter(|score| !score.is_null())
                .map(display_value)
                .unwrap_or_else(|| "N/A".to_string());
            let note = ["note", "reason"]
                .iter()
                .filter_map(|key| fields.get(*key).and_then(Value::as_str))
                .find(|note| !note.trim().is_empty())
                .unwrap_or("");
            format!("- {category}: {score}%{NOTE_SEPARATOR}{note}")
        }
        other => format!(
            "- {category}: {}%{NOTE_SEPARATOR}No reasoning available",
            display_value(other)
        ),
    }
}

fn first_present<'a>(risk: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| risk.get(*key))
        .find(|value| !value.is_null() && value.as_str() != Some(""))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
