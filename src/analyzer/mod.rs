// =============================================================================
// analyzer - THE EXPENSIVE PART
// =============================================================================
//
// One disclosure in, one AnalysisResult out. The analyzer owns:
//
//   - the modality decision: each provider declares whether it prefers the
//     raw PDF or the extracted text; the other modality is the fallback when
//     the first yields nothing parseable
//   - the retry loop: only rate-limit errors are retried, sleeping for the
//     delay the provider hinted at (clamped), everything else fails fast
//   - response recovery and normalisation against the framework
//
// Providers themselves are thin HTTP clients behind `LlmProvider`, so the
// whole loop can be exercised with a scripted fake.
// =============================================================================

pub mod claude;
pub mod gemini;
pub mod json_recovery;
pub mod prompt;
pub mod retry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::AnalyzerError;
use crate::extractor::TEXT_THRESHOLD_CHARS;
use crate::rate_budget::RateBudget;
use crate::framework::Framework;
use crate::models::{AnalysisResult, AnalysisSummary, ItemAnalysis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Modality {
    /// The raw PDF is attached to the request.
    Document,
    /// Only the extracted text is sent.
    Text,
}

impl Modality {
    pub fn other(self) -> Self {
        match self {
            Modality::Document => Modality::Text,
            Modality::Text => Modality::Document,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Document => write!(f, "document"),
            Modality::Text => write!(f, "text"),
        }
    }
}

/// One provider call. `document` is set only for the document modality.
#[derive(Debug)]
pub struct LlmRequest<'a> {
    pub system: &'a str,
    pub user: String,
    pub document: Option<&'a [u8]>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn primary_modality(&self) -> Modality;

    /// Raw response text, or a classified error. HTTP 429 and provider
    /// rate-limit codes must come back as `AnalyzerError::RateLimited`.
    async fn complete(&self, request: &LlmRequest<'_>) -> Result<String, AnalyzerError>;
}

/// What the analyzer gets to work with for one disclosure.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisInput<'a> {
    pub company: &'a str,
    pub text: &'a str,
    pub document: Option<&'a [u8]>,
    /// Charged against the per-minute budget on every provider call.
    pub estimated_tokens: u64,
}

impl AnalysisInput<'_> {
    fn supports(&self, modality: Modality) -> bool {
        match modality {
            Modality::Document => self.document.is_some_and(|d| !d.is_empty()),
            Modality::Text => self.text.chars().count() >= TEXT_THRESHOLD_CHARS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub result: AnalysisResult,
    pub modality: Modality,
}

pub struct StructuredAnalyzer {
    provider: Arc<dyn LlmProvider>,
    max_attempts: u32,
    budget: Option<Arc<RateBudget>>,
}

impl StructuredAnalyzer {
    pub fn new(provider: Arc<dyn LlmProvider>, max_attempts: u32) -> Self {
        Self {
            provider,
            max_attempts: max_attempts.max(1),
            budget: None,
        }
    }

    /// Every provider request, retries and the fallback modality included,
    /// waits for room in `budget` first.
    pub fn with_budget(mut self, budget: Arc<RateBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Requests and tokens booked in the current budget window.
    pub fn budget_usage(&self) -> Option<(u32, u64)> {
        self.budget.as_ref().map(|b| b.usage())
    }

    pub async fn analyze(
        &self,
        input: AnalysisInput<'_>,
        framework: &Framework,
    ) -> Result<AnalysisOutcome, AnalyzerError> {
        let primary = self.provider.primary_modality();
        let mut last_error = None;

        for modality in [primary, primary.other()] {
            if !input.supports(modality) {
                continue;
            }
            info!(
                provider = self.provider.name(),
                company = input.company,
                %modality,
                "Requesting structured analysis"
            );
            match self.attempt(modality, input, framework).await {
                Ok(result) => {
                    info!(
                        company = input.company,
                        %modality,
                        mentioned = result.summary.total_items_mentioned,
                        core = result.summary.core_items_mentioned,
                        "Analysis complete"
                    );
                    return Ok(AnalysisOutcome { result, modality });
                }
                Err(e) => {
                    warn!(company = input.company, %modality, error = %e, "Analysis attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(AnalyzerError::NoInput))
    }

    async fn attempt(
        &self,
        modality: Modality,
        input: AnalysisInput<'_>,
        framework: &Framework,
    ) -> Result<AnalysisResult, AnalyzerError> {
        let system = prompt::system_prompt(framework);
        let request = match modality {
            Modality::Document => LlmRequest {
                system: &system,
                user: prompt::document_prompt(input.company, framework),
                document: input.document,
            },
            Modality::Text => LlmRequest {
                system: &system,
                user: prompt::text_prompt(input.company, input.text, framework),
                document: None,
            },
        };

        let mut attempt = 1;
        loop {
            if let Some(budget) = &self.budget {
                budget.acquire(input.estimated_tokens).await;
            }
            match self.provider.complete(&request).await {
                Ok(text) => {
                    let value = json_recovery::recover_json(&text)?;
                    return Ok(normalize(value, framework));
                }
                Err(AnalyzerError::RateLimited(message)) if attempt < self.max_attempts => {
                    let wait = retry::parse_retry_delay(&message);
                    warn!(
                        provider = self.provider.name(),
                        attempt,
                        max_attempts = self.max_attempts,
                        wait_secs = wait.as_secs(),
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Shape whatever the model returned into a complete AnalysisResult.
///
/// Accepts both the full envelope (`analysis_items` + `summary`) and a bare
/// map of item id to item record. Every framework item ends up present,
/// unknown ids are dropped when a framework is loaded, and level 0 never
/// carries values. Summary counts always come from the items.
pub fn normalize(value: Value, framework: &Framework) -> AnalysisResult {
    let company_name = value
        .get("company_name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty());

    let raw_items = match value.get("analysis_items") {
        Some(Value::Object(map)) => map.clone(),
        _ => value
            .as_object()
            .map(|map| {
                map.iter()
                    .filter(|(k, v)| v.is_object() && k.as_str() != "summary")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default(),
    };

    let mut items: BTreeMap<String, ItemAnalysis> = BTreeMap::new();
    for (item_id, raw) in raw_items {
        if !framework.is_empty() && framework.item(&item_id).is_none() {
            continue;
        }
        let item = serde_json::from_value::<ItemAnalysis>(raw).unwrap_or_else(|e| {
            warn!(item_id = %item_id, error = %e, "Unreadable item record, using empty template");
            ItemAnalysis::default()
        });
        items.insert(item_id, item);
    }
    for item_id in framework.item_ids() {
        items.entry(item_id.to_string()).or_default();
    }
    for item in items.values_mut() {
        item.enforce_level_invariant();
    }

    let model_summary: AnalysisSummary = value
        .get("summary")
        .and_then(|s| serde_json::from_value(s.clone()).ok())
        .unwrap_or_default();

    let mut key_highlights: Vec<String> = model_summary
        .key_highlights
        .into_iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect();
    if key_highlights.is_empty() {
        key_highlights = items
            .iter()
            .filter(|(_, item)| item.level == 2 && !item.note.trim().is_empty())
            .map(|(_, item)| item.note.trim().to_string())
            .take(3)
            .collect();
    }

    let total = items.values().filter(|i| i.is_mentioned()).count() as u32;
    let core = items
        .iter()
        .filter(|(id, item)| item.is_mentioned() && framework.is_core(id))
        .count() as u32;

    AnalysisResult {
        company_name,
        analysis_items: items,
        summary: AnalysisSummary {
            total_items_mentioned: total,
            core_items_mentioned: core,
            key_highlights,
        },
    }
}

/// Scripted provider shared by the analyzer and pipeline tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    pub struct ScriptedProvider {
        pub primary: Modality,
        script: Mutex<VecDeque<Result<String, AnalyzerError>>>,
        /// Returned once the script runs dry.
        fallback: Option<String>,
        pub calls: Mutex<Vec<(Modality, usize)>>,
    }

    impl ScriptedProvider {
        pub fn new(primary: Modality, script: Vec<Result<String, AnalyzerError>>) -> Self {
            Self {
                primary,
                script: Mutex::new(script.into()),
                fallback: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn always(primary: Modality, response: &str) -> Self {
            Self {
                fallback: Some(response.to_string()),
                ..Self::new(primary, Vec::new())
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn primary_modality(&self) -> Modality {
            self.primary
        }

        async fn complete(&self, request: &LlmRequest<'_>) -> Result<String, AnalyzerError> {
            let modality = if request.document.is_some() { Modality::Document } else { Modality::Text };
            self.calls.lock().push((modality, request.user.len()));
            if let Some(next) = self.script.lock().pop_front() {
                return next;
            }
            match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => Err(AnalyzerError::EmptyResponse),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::ScriptedProvider;
    use super::*;
    use crate::framework::sample_rows;
    use crate::models::Figure;
    use pretty_assertions::assert_eq;

    const ROE_ONLY: &str =
        r#"{"ROE": {"level":2,"current_value":8.5,"target_value":15,"target_year":2027,"note":"ROE 15% by 2027"}}"#;

    fn framework() -> Framework {
        Framework::from_rows(&sample_rows())
    }

    fn long_text() -> String {
        "ROE 15% 목표, 2027년까지 달성. ".repeat(40)
    }

    #[test]
    fn test_normalize_bare_item_map() {
        let fw = framework();
        let result = normalize(serde_json::from_str(ROE_ONLY).unwrap(), &fw);

        assert_eq!(result.analysis_items.len(), 2);
        let roe = result.item("ROE").unwrap();
        assert_eq!(roe.level, 2);
        assert_eq!(roe.target_value, Some(Figure::Number(15.0)));
        assert_eq!(result.item("DPR").unwrap(), &ItemAnalysis::default());
        assert_eq!(result.summary.total_items_mentioned, 1);
        assert_eq!(result.summary.core_items_mentioned, 1);
        assert_eq!(result.summary.key_highlights, vec!["ROE 15% by 2027".to_string()]);
    }

    #[test]
    fn test_normalize_enforces_level_invariant_and_drops_unknown_ids() {
        let fw = framework();
        let value = serde_json::json!({
            "company_name": "한미반도체",
            "analysis_items": {
                "ROE": {"level": 0, "current_value": 3, "target_value": 10, "target_year": 2026},
                "DPR": {"level": 9, "target_value": 40},
                "BOGUS": {"level": 2}
            },
            "summary": {"total_items_mentioned": 99, "key_highlights": ["배당성향 40%"]}
        });
        let result = normalize(value, &fw);

        assert_eq!(result.company_name.as_deref(), Some("한미반도체"));
        assert!(result.item("BOGUS").is_none());
        let roe = result.item("ROE").unwrap();
        assert_eq!((roe.level, roe.current_value.clone(), roe.target_year.clone()), (0, None, None));
        assert_eq!(result.item("DPR").unwrap().level, 2);
        assert_eq!(result.summary.total_items_mentioned, 1);
        assert_eq!(result.summary.core_items_mentioned, 0);
        assert_eq!(result.summary.key_highlights, vec!["배당성향 40%".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_is_retried_with_parsed_delay() {
        let provider = Arc::new(ScriptedProvider::new(
            Modality::Document,
            vec![
                Err(AnalyzerError::RateLimited(r#"{"retryDelay": "23s"}"#.into())),
                Ok(ROE_ONLY.into()),
            ],
        ));
        let analyzer = StructuredAnalyzer::new(provider.clone(), 3);
        let pdf = b"%PDF-1.5 fake".to_vec();

        let start = tokio::time::Instant::now();
        let outcome = analyzer
            .analyze(
                AnalysisInput { company: "한미반도체", text: "", document: Some(&pdf), estimated_tokens: 0 },
                &framework(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.modality, Modality::Document);
        assert_eq!(provider.call_count(), 2);
        assert!(start.elapsed() >= std::time::Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_provider_call_is_charged_to_the_budget() {
        let provider = Arc::new(ScriptedProvider::new(
            Modality::Document,
            vec![
                Err(AnalyzerError::RateLimited("retry-after: 5".into())),
                Err(AnalyzerError::RateLimited("retry-after: 5".into())),
                Ok(ROE_ONLY.into()),
            ],
        ));
        let budget = Arc::new(RateBudget::new(60, 1_000_000));
        let analyzer = StructuredAnalyzer::new(provider.clone(), 3).with_budget(budget.clone());
        let pdf = b"%PDF-1.5 fake".to_vec();

        analyzer
            .analyze(
                AnalysisInput { company: "한미반도체", text: "", document: Some(&pdf), estimated_tokens: 1_000 },
                &framework(),
            )
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 3);
        assert_eq!(budget.usage(), (3, 3_000));
        assert_eq!(analyzer.budget_usage(), Some((3, 3_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_rate_limit_error_is_not_retried_and_falls_back() {
        let provider = Arc::new(ScriptedProvider::new(
            Modality::Document,
            vec![
                Err(AnalyzerError::Api { status: 400, body: "bad pdf".into() }),
                Ok(ROE_ONLY.into()),
            ],
        ));
        let analyzer = StructuredAnalyzer::new(provider.clone(), 3);
        let pdf = b"%PDF-1.5 fake".to_vec();
        let text = long_text();

        let outcome = analyzer
            .analyze(
                AnalysisInput { company: "한미반도체", text: &text, document: Some(&pdf), estimated_tokens: 0 },
                &framework(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.modality, Modality::Text);
        let calls = provider.calls.lock().clone();
        assert_eq!(calls.iter().map(|c| c.0).collect::<Vec<_>>(), vec![Modality::Document, Modality::Text]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_rate_limit() {
        let provider = Arc::new(ScriptedProvider::new(
            Modality::Text,
            vec![
                Err(AnalyzerError::RateLimited("429".into())),
                Err(AnalyzerError::RateLimited("429".into())),
                Err(AnalyzerError::RateLimited("429".into())),
            ],
        ));
        let analyzer = StructuredAnalyzer::new(provider.clone(), 3);
        let text = long_text();

        let err = analyzer
            .analyze(AnalysisInput { company: "x", text: &text, document: None, estimated_tokens: 0 }, &framework())
            .await
            .unwrap_err();

        assert!(err.is_rate_limit());
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_short_text_without_document_is_no_input() {
        let provider = Arc::new(ScriptedProvider::always(Modality::Text, ROE_ONLY));
        let analyzer = StructuredAnalyzer::new(provider.clone(), 3);

        let err = analyzer
            .analyze(AnalysisInput { company: "x", text: "too short", document: None, estimated_tokens: 0 }, &framework())
            .await
            .unwrap_err();

        assert!(matches!(err, AnalyzerError::NoInput));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_response_falls_back_to_other_modality() {
        let provider = Arc::new(ScriptedProvider::new(
            Modality::Text,
            vec![Ok("죄송합니다. 분석할 수 없습니다.".into()), Ok(format!("```json\n{}\n```", ROE_ONLY))],
        ));
        let analyzer = StructuredAnalyzer::new(provider.clone(), 3);
        let text = long_text();
        let pdf = b"%PDF-1.5".to_vec();

        let outcome = analyzer
            .analyze(AnalysisInput { company: "x", text: &text, document: Some(&pdf), estimated_tokens: 0 }, &framework())
            .await
            .unwrap();
        assert_eq!(outcome.modality, Modality::Document);
        assert_eq!(outcome.result.mentioned_count(), 1);
    }
}
