// Models asked for "JSON only" still wrap it in prose or code fences now and
// then. Recover the object with an ordered cascade; the first candidate that
// parses to a JSON object wins.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::AnalyzerError;

const PREVIEW_CHARS: usize = 500;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```json\s*([\s\S]*?)\s*```").expect("valid regex"));
static FENCED_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```\s*([\s\S]*?)\s*```").expect("valid regex"));
static OUTER_BRACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{[\s\S]*\}").expect("valid regex"));

pub fn recover_json(response: &str) -> Result<Value, AnalyzerError> {
    let candidates = [
        Some(response.trim()),
        FENCED_JSON.captures(response).and_then(|c| c.get(1)).map(|m| m.as_str()),
        FENCED_ANY.captures(response).and_then(|c| c.get(1)).map(|m| m.as_str()),
        OUTER_BRACES.find(response).map(|m| m.as_str()),
    ];

    candidates
        .into_iter()
        .flatten()
        .find_map(|candidate| match serde_json::from_str::<Value>(candidate) {
            Ok(value) if value.is_object() => Some(value),
            _ => None,
        })
        .ok_or_else(|| AnalyzerError::Parse {
            preview: response.chars().take(PREVIEW_CHARS).collect(),
        })
}
