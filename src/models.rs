// =============================================================================
// models.rs - THE NOUNS OF THE PIPELINE
// =============================================================================
//
// A DisclosureRecord is born in the lister, enriched with links by the
// retriever and the Drive archive, and then lives forever as one row of the
// disclosure list sheet. An AnalysisResult is what the LLM tells us about
// that record, one entry per framework item, written once.
// =============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};

/// The named lookback windows offered by the KIND list page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodBucket {
    OneWeek,
    OneMonth,
    ThreeMonths,
    SixMonths,
    OneYear,
    TwoYears,
    ThreeYears,
    All,
}

impl PeriodBucket {
    pub const ALL: [PeriodBucket; 8] = [
        PeriodBucket::OneWeek,
        PeriodBucket::OneMonth,
        PeriodBucket::ThreeMonths,
        PeriodBucket::SixMonths,
        PeriodBucket::OneYear,
        PeriodBucket::TwoYears,
        PeriodBucket::ThreeYears,
        PeriodBucket::All,
    ];

    /// The button label on the KIND page.
    pub fn label(&self) -> &'static str {
        match self {
            PeriodBucket::OneWeek => "1주",
            PeriodBucket::OneMonth => "1개월",
            PeriodBucket::ThreeMonths => "3개월",
            PeriodBucket::SixMonths => "6개월",
            PeriodBucket::OneYear => "1년",
            PeriodBucket::TwoYears => "2년",
            PeriodBucket::ThreeYears => "3년",
            PeriodBucket::All => "전체",
        }
    }

    /// First day covered by this bucket, or `None` for 전체.
    pub fn lower_bound(&self, today: NaiveDate) -> Option<NaiveDate> {
        let months = match self {
            PeriodBucket::OneWeek => return today.checked_sub_days(chrono::Days::new(7)),
            PeriodBucket::OneMonth => 1,
            PeriodBucket::ThreeMonths => 3,
            PeriodBucket::SixMonths => 6,
            PeriodBucket::OneYear => 12,
            PeriodBucket::TwoYears => 24,
            PeriodBucket::ThreeYears => 36,
            PeriodBucket::All => return None,
        };
        today.checked_sub_months(Months::new(months))
    }
}

impl fmt::Display for PeriodBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for PeriodBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        PeriodBucket::ALL
            .into_iter()
            .find(|p| p.label() == trimmed)
            .ok_or_else(|| {
                let labels: Vec<&str> = PeriodBucket::ALL.iter().map(|p| p.label()).collect();
                format!("unknown period '{}', expected one of {}", trimmed, labels.join(", "))
            })
    }
}

/// How the lister should bound its walk through the list pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListWindow {
    /// Last N days. Rows older than the cutoff stop pagination.
    Days(u32),
    /// A named bucket. The server filters; we never stop early.
    Period(PeriodBucket),
}

/// One value-up filing as it appears on KIND and in the list sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisclosureRecord {
    pub number: u32,
    /// Raw `YYYY-MM-DD HH:MM` string as shown on KIND.
    pub disclosed_at: String,
    pub company: String,
    pub stock_code: String,
    pub title: String,
    /// Accession number (접수번호). Globally unique, the dedup key.
    pub acptno: String,
    pub doc_no: Option<String>,
    pub pdf_url: String,
    pub drive_link: String,
    pub collected_at: String,
    pub artifact_link: String,
}

impl DisclosureRecord {
    pub fn new(acptno: impl Into<String>, company: impl Into<String>, disclosed_at: impl Into<String>) -> Self {
        Self {
            number: 0,
            disclosed_at: disclosed_at.into(),
            company: company.into(),
            stock_code: String::new(),
            title: String::new(),
            acptno: acptno.into(),
            doc_no: None,
            pdf_url: String::new(),
            drive_link: String::new(),
            collected_at: String::new(),
            artifact_link: String::new(),
        }
    }

    /// Date part only; tolerates `YYYY-MM-DD`, `YYYY-MM-DD HH:MM` and
    /// `YYYY-MM-DD HH:MM:SS`.
    pub fn disclosed_date(&self) -> Option<NaiveDate> {
        let head = self.disclosed_at.trim().split_whitespace().next()?;
        NaiveDate::parse_from_str(head.get(..10)?, "%Y-%m-%d").ok()
    }

    /// Any link the analysis phase can use to justify fetching the document.
    pub fn has_document_link(&self) -> bool {
        !self.pdf_url.is_empty() || !self.drive_link.is_empty() || !self.artifact_link.is_empty()
    }
}

impl fmt::Display for DisclosureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({}) {}", self.acptno, self.company, self.stock_code, self.disclosed_at)
    }
}

/// A reported figure. The model answers with plain numbers most of the
/// time but sometimes with text like "308만주".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Figure {
    Number(f64),
    Text(String),
}

impl Figure {
    /// Cell text: integral numbers without a trailing `.0`.
    pub fn to_cell(&self) -> String {
        match self {
            Figure::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Figure::Number(n) => format!("{}", n),
            Figure::Text(s) => s.clone(),
        }
    }
}

/// Mention level: 0 not mentioned, 1 qualitative, 2 quantitative target.
fn deserialize_level<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    let level = match &raw {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        serde_json::Value::Bool(true) => 1.0,
        _ => 0.0,
    };
    Ok(level.clamp(0.0, 2.0) as u8)
}

/// Treat `""` and `null` the same way: absent.
fn deserialize_figure<'de, D>(deserializer: D) -> Result<Option<Figure>, D::Error>
where
    D: Deserializer<'de>,
{
    let figure = Option::<Figure>::deserialize(deserializer)?;
    Ok(match figure {
        Some(Figure::Text(s)) if s.trim().is_empty() || s.trim() == "null" => None,
        other => other,
    })
}

/// The per-item extraction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemAnalysis {
    #[serde(default, deserialize_with = "deserialize_level")]
    pub level: u8,
    #[serde(default, deserialize_with = "deserialize_figure")]
    pub current_value: Option<Figure>,
    #[serde(default, deserialize_with = "deserialize_figure")]
    pub target_value: Option<Figure>,
    #[serde(default, deserialize_with = "deserialize_figure")]
    pub target_year: Option<Figure>,
    #[serde(default)]
    pub note: String,
}

impl Default for ItemAnalysis {
    fn default() -> Self {
        Self {
            level: 0,
            current_value: None,
            target_value: None,
            target_year: None,
            note: String::new(),
        }
    }
}

impl ItemAnalysis {
    pub fn is_mentioned(&self) -> bool {
        self.level > 0
    }

    /// Level 0 means the item was not mentioned, so it carries no values.
    pub fn enforce_level_invariant(&mut self) {
        if self.level > 2 {
            self.level = 2;
        }
        if self.level == 0 {
            self.current_value = None;
            self.target_value = None;
            self.target_year = None;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    #[serde(default)]
    pub total_items_mentioned: u32,
    #[serde(default)]
    pub core_items_mentioned: u32,
    #[serde(default)]
    pub key_highlights: Vec<String>,
}

/// What the analyzer produced for one disclosure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub analysis_items: BTreeMap<String, ItemAnalysis>,
    #[serde(default)]
    pub summary: AnalysisSummary,
}

impl AnalysisResult {
    pub fn item(&self, item_id: &str) -> Option<&ItemAnalysis> {
        self.analysis_items.get(item_id)
    }

    pub fn mentioned_count(&self) -> usize {
        self.analysis_items.values().filter(|i| i.is_mentioned()).count()
    }

    pub fn quantitative_count(&self) -> usize {
        self.analysis_items.values().filter(|i| i.level == 2).count()
    }
}
