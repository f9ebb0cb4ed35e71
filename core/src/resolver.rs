//! Dependency Resolver (C3, spec §4.3). Pure and side-effect-free: given a
//! job's declared params and a map of completed-dependency results, produce
//! the effective params with dependency sentinels substituted.

use serde_json::Value;

use crate::error::CoreError;
use crate::types::{DepResults, JobResult, MediaType};

const SENTINEL_ANY: &str = "_jobDependency:";
const SENTINEL_IMAGE: &str = "_imageJobDependency:";
const SENTINEL_VIDEO: &str = "_videoJobDependency:";
const SENTINEL_AUDIO: &str = "_audioJobDependency:";
const SENTINEL_TRANSCRIPT: &str = "_transcriptJobDependency:";

/// Parameter keys/positions the resolver scans, per spec §4.3 rule 4
/// ("no global substitution sweep — limit the blast radius"). Array-typed
/// params get their elements scanned at `.url`/`.media`.
const SCANNED_KEYS: &[&str] = &["image", "audio", "video", "transcript", "background"];
const ARRAY_ELEMENT_KEYS: &[&str] = &["url", "media"];

enum Sentinel<'a> {
    Any(&'a str),
    Image(&'a str),
    Video(&'a str),
    Audio(&'a str),
    Transcript(&'a str),
}

fn parse_sentinel(s: &str) -> Option<Sentinel<'_>> {
    if let Some(id) = s.strip_prefix(SENTINEL_IMAGE) {
        Some(Sentinel::Image(id))
    } else if let Some(id) = s.strip_prefix(SENTINEL_VIDEO) {
        Some(Sentinel::Video(id))
    } else if let Some(id) = s.strip_prefix(SENTINEL_AUDIO) {
        Some(Sentinel::Audio(id))
    } else if let Some(id) = s.strip_prefix(SENTINEL_TRANSCRIPT) {
        Some(Sentinel::Transcript(id))
    } else if let Some(id) = s.strip_prefix(SENTINEL_ANY) {
        Some(Sentinel::Any(id))
    } else {
        None
    }
}

fn sentinel_repr(s: &Sentinel<'_>) -> String {
    match s {
        Sentinel::Any(id) => format!("{SENTINEL_ANY}{id}"),
        Sentinel::Image(id) => format!("{SENTINEL_IMAGE}{id}"),
        Sentinel::Video(id) => format!("{SENTINEL_VIDEO}{id}"),
        Sentinel::Audio(id) => format!("{SENTINEL_AUDIO}{id}"),
        Sentinel::Transcript(id) => format!("{SENTINEL_TRANSCRIPT}{id}"),
    }
}

fn dep_id(s: &Sentinel<'_>) -> &str {
    match s {
        Sentinel::Any(id)
        | Sentinel::Image(id)
        | Sentinel::Video(id)
        | Sentinel::Audio(id)
        | Sentinel::Transcript(id) => id,
    }
}

fn resolve_one(sentinel: Sentinel<'_>, dep_results: &DepResults) -> Result<String, CoreError> {
    let id = dep_id(&sentinel);
    let result: &JobResult = dep_results
        .get(id)
        .ok_or_else(|| CoreError::DependencyMissing(id.to_string()))?;

    let required_type = match sentinel {
        Sentinel::Any(_) => None,
        Sentinel::Image(_) => Some(MediaType::Image),
        Sentinel::Video(_) => Some(MediaType::Video),
        Sentinel::Audio(_) => Some(MediaType::Audio),
        Sentinel::Transcript(_) => Some(MediaType::Transcript),
    };

    let url = match required_type {
        None => result.primary_url().map(|s| s.to_string()),
        Some(kind) => result
            .output_of_type(kind)
            .map(|o| o.url.clone())
            .or_else(|| {
                // Legacy rows carry no `outputs[]`; a bare legacy `url`
                // satisfies a typed sentinel too (spec §4.3 rule 3).
                if result.outputs.is_empty() {
                    result.url.clone()
                } else {
                    None
                }
            }),
    };

    url.ok_or_else(|| CoreError::DependencyShape {
        dep_id: id.to_string(),
        sentinel: sentinel_repr(&match required_type {
            None => Sentinel::Any(id),
            Some(MediaType::Image) => Sentinel::Image(id),
            Some(MediaType::Video) => Sentinel::Video(id),
            Some(MediaType::Audio) => Sentinel::Audio(id),
            Some(MediaType::Transcript) => Sentinel::Transcript(id),
        }),
    })
}

/// Substitute a single string value if it is entirely a sentinel (rule 1).
/// Returns `None` (pass through unchanged) for non-sentinel strings.
fn substitute_string(s: &str, dep_results: &DepResults) -> Result<Option<String>, CoreError> {
    match parse_sentinel(s) {
        Some(sentinel) => Ok(Some(resolve_one(sentinel, dep_results)?)),
        None => Ok(None),
    }
}

/// Rewrite one scanned value in place: a bare string is substituted
/// wholesale; an array has each element substituted element-wise (rule 2),
/// examining `.url`/`.media` on object elements.
fn substitute_value(value: &mut Value, dep_results: &DepResults) -> Result<(), CoreError> {
    match value {
        Value::String(s) => {
            if let Some(resolved) = substitute_string(s, dep_results)? {
                *value = Value::String(resolved);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                match item {
                    Value::String(s) => {
                        if let Some(resolved) = substitute_string(s, dep_results)? {
                            *item = Value::String(resolved);
                        }
                    }
                    Value::Object(map) => {
                        for key in ARRAY_ELEMENT_KEYS {
                            if let Some(Value::String(s)) = map.get(*key) {
                                if let Some(resolved) = substitute_string(s, dep_results)? {
                                    map.insert((*key).to_string(), Value::String(resolved));
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Produce the effective params for a job by substituting dependency
/// sentinels. Deterministic and side-effect-free (spec §4.3 "Determinism").
pub fn resolve_params(
    params: &serde_json::Value,
    dep_results: &DepResults,
) -> Result<serde_json::Value, CoreError> {
    let mut effective = params.clone();
    if let Value::Object(map) = &mut effective {
        for key in SCANNED_KEYS {
            if let Some(value) = map.get_mut(*key) {
                substitute_value(value, dep_results)?;
            }
        }
        if let Some(Value::Array(items)) = map.get_mut("items") {
            for item in items.iter_mut() {
                if let Value::Object(obj) = item {
                    for key in ARRAY_ELEMENT_KEYS {
                        if let Some(Value::String(s)) = obj.get(*key) {
                            if let Some(resolved) = substitute_string(s, dep_results)? {
                                obj.insert((*key).to_string(), Value::String(resolved));
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(effective)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaOutput;
    use serde_json::json;

    fn outputs_dep(id: &str, kind: MediaType, url: &str) -> (String, JobResult) {
        (
            id.to_string(),
            JobResult::completed(vec![MediaOutput {
                kind,
                url: url.to_string(),
                mime_type: None,
            }]),
        )
    }

    #[test]
    fn substitutes_whole_string_sentinel() {
        let mut deps = DepResults::new();
        let (id, res) = outputs_dep("img", MediaType::Image, "https://cdn/img.png");
        deps.insert(id, res);

        let params = json!({"image": "_imageJobDependency:img", "prompt": "a cat"});
        let effective = resolve_params(&params, &deps).unwrap();
        assert_eq!(effective["image"], "https://cdn/img.png");
        assert_eq!(effective["prompt"], "a cat");
    }

    #[test]
    fn wrong_type_sentinel_is_dependency_shape_error() {
        let mut deps = DepResults::new();
        let (id, res) = outputs_dep("img", MediaType::Image, "https://cdn/img.png");
        deps.insert(id, res);
        let params = json!({"video": "_videoJobDependency:img"});
        let err = resolve_params(&params, &deps).unwrap_err();
        assert!(matches!(err, CoreError::DependencyShape { .. }));
    }

    #[test]
    fn missing_dependency_is_fatal() {
        let deps = DepResults::new();
        let params = json!({"image": "_imageJobDependency:ghost"});
        let err = resolve_params(&params, &deps).unwrap_err();
        assert!(matches!(err, CoreError::DependencyMissing(_)));
    }

    #[test]
    fn array_items_resolved_element_wise() {
        let mut deps = DepResults::new();
        let (a_id, a_res) = outputs_dep("a", MediaType::Video, "https://cdn/a.mp4");
        let (b_id, b_res) = outputs_dep("b", MediaType::Video, "https://cdn/b.mp4");
        deps.insert(a_id, a_res);
        deps.insert(b_id, b_res);

        let params = json!({
            "items": [
                {"type": "video", "url": "_videoJobDependency:a"},
                {"type": "video", "url": "_videoJobDependency:b"}
            ]
        });
        let effective = resolve_params(&params, &deps).unwrap();
        assert_eq!(effective["items"][0]["url"], "https://cdn/a.mp4");
        assert_eq!(effective["items"][1]["url"], "https://cdn/b.mp4");
    }

    #[test]
    fn legacy_shape_satisfies_typed_sentinel() {
        let mut deps = DepResults::new();
        let legacy = JobResult {
            url: Some("https://cdn/legacy.mp4".to_string()),
            ..Default::default()
        };
        deps.insert("a".to_string(), legacy);
        let params = json!({"video": "_videoJobDependency:a"});
        let effective = resolve_params(&params, &deps).unwrap();
        assert_eq!(effective["video"], "https://cdn/legacy.mp4");
    }

    #[test]
    fn non_sentinel_strings_pass_through() {
        let deps = DepResults::new();
        let params = json!({"prompt": "a beautiful sunset", "image": "https://example.com/already-a-url.png"});
        let effective = resolve_params(&params, &deps).unwrap();
        assert_eq!(effective, params);
    }
}
