use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::cli::NormalizeArgs;
use crate::util::{utc_compact_string, write_json_pretty};

const IMPORTED_NOTE: &str = "Imported from original application; reasoning not recorded.";
const MISSING_NOTE: &str = "No reasoning available";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeCounts {
    pub applications: usize,
    pub patched_applications: usize,
    pub patched_risk_files: usize,
    pub unreadable_risk_files: usize,
}

pub fn run(args: NormalizeArgs) -> Result<()> {
    let stamp = utc_compact_string(Utc::now());
    info!(
        applications = %args.applications_path.display(),
        apply = args.apply,
        patch_risk_files = args.patch_risk_files,
        "normalizing category scores"
    );

    let counts = normalize(&args, &stamp)?;

    if counts.patched_applications == 0 && counts.patched_risk_files == 0 {
        info!(applications = counts.applications, "no records required normalizing");
    } else if args.apply {
        info!(
            patched_applications = counts.patched_applications,
            patched_risk_files = counts.patched_risk_files,
            backup_suffix = %format!(".bak.{stamp}"),
            "normalization applied"
        );
    } else {
        info!(
            patched_applications = counts.patched_applications,
            patched_risk_files = counts.patched_risk_files,
            "normalization dry-run complete; nothing written (use --apply)"
        );
    }

    Ok(())
}

fn normalize(args: &NormalizeArgs, stamp: &str) -> Result<NormalizeCounts> {
    let path = &args.applications_path;
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut applications: Vec<Value> = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let mut counts = NormalizeCounts {
        applications: applications.len(),
        ..NormalizeCounts::default()
    };

    for application in &mut applications {
        if patch_application(application) {
            counts.patched_applications += 1;
            info!(
                record_id = application_id(application).unwrap_or("<unknown>"),
                apply = args.apply,
                "category scores converted to object form"
            );
        }
    }

    if args.patch_risk_files {
        for application in &applications {
            let Some(record_id) = application_id(application) else {
                continue;
            };
            let risk_path = args.risk_dir.join(format!("{record_id}.json"));
            if !risk_path.is_file() {
                continue;
            }

            match patch_risk_file(&risk_path, args.apply, stamp) {
                Ok(true) => {
                    counts.patched_risk_files += 1;
                    info!(path = %risk_path.display(), apply = args.apply, "risk file normalized");
                }
                Ok(false) => {}
                Err(err) => {
                    counts.unreadable_risk_files += 1;
                    warn!(path = %risk_path.display(), error = %format!("{err:#}"), "skipping risk file");
                }
            }
        }
    }

    if args.apply && counts.patched_applications > 0 {
        let backup = backup_file(path, stamp)?;
        write_json_pretty(path, &applications)?;
        info!(path = %path.display(), backup = %backup.display(), "applications rewritten");
    }

    Ok(counts)
}

fn application_id(application: &Value) -> Option<&str> {
    ["id", "application_id"]
        .iter()
        .filter_map(|key| application.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

/// Normalizes `risk.category_scores` and lifts the headline score and level
/// onto the application when it lacks them.
fn patch_application(application: &mut Value) -> bool {
    let Some(risk) = application.get_mut("risk") else {
        return false;
    };
    let Some(scores) = risk
        .get_mut("category_scores")
        .and_then(Value::as_object_mut)
    else {
        return false;
    };
    if !normalize_category_scores(scores) {
        return false;
    }

    let aggregated = risk.get("aggregated_score").cloned();
    let level = risk.get("risk_level").cloned();
    if let Some(fields) = application.as_object_mut() {
        for (key, value) in [("risk_score", aggregated), ("risk_level", level)] {
            if let Some(value) = value {
                if is_blank(fields.get(key)) {
                    fields.insert(key.to_string(), value);
                }
            }
        }
    }

    true
}

fn patch_risk_file(path: &Path, apply: bool, stamp: &str) -> Result<bool> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut data: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let root = if data.get("model_response").is_some() {
        &mut data["model_response"]
    } else {
        &mut data
    };
    let Some(scores) = root
        .get_mut("category_scores")
        .and_then(Value::as_object_mut)
    else {
        return Ok(false);
    };
    if !normalize_category_scores(scores) {
        return Ok(false);
    }

    if apply {
        backup_file(path, stamp)?;
        write_json_pretty(path, &data)?;
    }
    Ok(true)
}

/// Rewrites every category into `{score, note}` form when any of them is
/// not already in it. Returns whether anything changed.
pub(crate) fn normalize_category_scores(scores: &mut Map<String, Value>) -> bool {
    if scores.is_empty() {
        return false;
    }

    let mut changed = false;
    let mut normalized = Map::with_capacity(scores.len());
    for (category, value) in scores.iter() {
        let (value, category_changed) = normalize_category(value);
        changed |= category_changed;
        normalized.insert(category.clone(), value);
    }

    if changed {
        *scores = normalized;
    }
    changed
}

fn normalize_category(value: &Value) -> (Value, bool) {
    match value {
        Value::Number(_) => (json!({"score": value, "note": IMPORTED_NOTE}), true),
        Value::Object(fields) => {
            let score = fields
                .get("score")
                .filter(|score| !score.is_null())
                .or_else(|| fields.get("value").filter(|value| value.is_number()))
                .cloned()
                .unwrap_or_else(|| json!(0));
            let note = ["note", "reason"]
                .iter()
                .filter_map(|key| fields.get(*key))
                .find(|note| !is_blank(Some(note)))
                .cloned()
                .unwrap_or_else(|| json!(MISSING_NOTE));
            let changed = !fields.contains_key("score") || !fields.contains_key("note");
            (json!({"score": score, "note": note}), changed)
        }
        other => (
            json!({"score": 0, "note": format!("Unrecognized original value: {other}")}),
            true,
        ),
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => true,
        Some(Value::String(text)) => text.is_empty(),
        Some(Value::Number(number)) => number.as_f64() == Some(0.0),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(fields)) => fields.is_empty(),
        Some(_) => false,
    }
}

fn backup_file(path: &Path, stamp: &str) -> Result<PathBuf> {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".bak.{stamp}"));
    let backup = PathBuf::from(name);
    fs::copy(path, &backup).with_context(|| {
        format!(
            "failed to back up {} to {}",
            path.display(),
            backup.display()
        )
    })?;
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(dir: &Path, apply: bool, patch_risk_files: bool) -> NormalizeArgs {
        NormalizeArgs {
            apply,
            dry_run: !apply,
            applications_path: dir.join("applications.json"),
            risk_dir: dir.join("risk"),
            patch_risk_files,
        }
    }

    fn write_fixture(dir: &Path) {
        fs::write(
            dir.join("applications.json"),
            json!([
                {
                    "id": "APP-1",
                    "risk": {
                        "aggregated_score": 40,
                        "risk_level": "Medium",
                        "category_scores": {"licensing": 70, "sanctions": {"score": 5, "note": "clear"}}
                    }
                },
                {
                    "id": "APP-2",
                    "risk": {"category_scores": {"licensing": {"score": 10, "note": "ok"}}}
                }
            ])
            .to_string(),
        )
        .unwrap();
        fs::create_dir_all(dir.join("risk")).unwrap();
        fs::write(
            dir.join("risk").join("APP-1.json"),
            json!({"model_response": {"category_scores": {"licensing": {"reason": "lapsed"}}}})
                .to_string(),
        )
        .unwrap();
    }

    #[test]
    fn categories_are_normalized_to_score_and_note() {
        let mut scores = json!({
            "flat": 12,
            "reasoned": {"score": 3, "reason": "because"},
            "valued": {"value": 8},
            "odd": "high"
        })
        .as_object()
        .cloned()
        .unwrap();

        assert!(normalize_category_scores(&mut scores));
        assert_eq!(scores["flat"], json!({"score": 12, "note": IMPORTED_NOTE}));
        assert_eq!(scores["reasoned"], json!({"score": 3, "note": "because"}));
        assert_eq!(scores["valued"], json!({"score": 8, "note": MISSING_NOTE}));
        assert_eq!(
            scores["odd"],
            json!({"score": 0, "note": "Unrecognized original value: \"high\""})
        );

        assert!(!normalize_category_scores(&mut scores));
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let before = fs::read(dir.path().join("applications.json")).unwrap();
        let risk_before = fs::read(dir.path().join("risk").join("APP-1.json")).unwrap();

        let counts = normalize(&args(dir.path(), false, true), "20250101T000000Z").unwrap();

        assert_eq!(counts.applications, 2);
        assert_eq!(counts.patched_applications, 1);
        assert_eq!(counts.patched_risk_files, 1);
        assert_eq!(fs::read(dir.path().join("applications.json")).unwrap(), before);
        assert_eq!(
            fs::read(dir.path().join("risk").join("APP-1.json")).unwrap(),
            risk_before
        );
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn apply_rewrites_with_backups_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let original = fs::read(dir.path().join("applications.json")).unwrap();

        let counts = normalize(&args(dir.path(), true, true), "20250101T000000Z").unwrap();
        assert_eq!(counts.patched_applications, 1);
        assert_eq!(counts.patched_risk_files, 1);

        let backup = dir.path().join("applications.json.bak.20250101T000000Z");
        assert_eq!(fs::read(&backup).unwrap(), original);
        assert!(
            dir.path()
                .join("risk")
                .join("APP-1.json.bak.20250101T000000Z")
                .is_file()
        );

        let applications: Value =
            serde_json::from_slice(&fs::read(dir.path().join("applications.json")).unwrap())
                .unwrap();
        assert_eq!(
            applications[0]["risk"]["category_scores"]["licensing"],
            json!({"score": 70, "note": IMPORTED_NOTE})
        );
        assert_eq!(applications[0]["risk_score"], json!(40));
        assert_eq!(applications[0]["risk_level"], json!("Medium"));

        let risk: Value = serde_json::from_slice(
            &fs::read(dir.path().join("risk").join("APP-1.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(
            risk["model_response"]["category_scores"]["licensing"],
            json!({"score": 0, "note": "lapsed"})
        );

        let again = normalize(&args(dir.path(), true, true), "20250102T000000Z").unwrap();
        assert_eq!(again.patched_applications, 0);
        assert_eq!(again.patched_risk_files, 0);
        assert!(
            !dir.path()
                .join("applications.json.bak.20250102T000000Z")
                .exists()
        );
    }
}
