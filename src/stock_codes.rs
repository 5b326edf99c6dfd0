// =============================================================================
// stock_codes.rs - COMPANY NAME TO TICKER
// =============================================================================
//
// KIND rows usually carry the six-character stock code next to the company
// name, but not always. When it's missing we look the name up in the KRX
// listed-issue table (KOSPI + KOSDAQ) from data.krx.co.kr.
//
// The mapper is built once per run, owned by the pipeline, and dropped at
// the end. It is loaded lazily: a run that never needs a lookup never pays
// for the two market downloads.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::FetchError;

const LISTED_ISSUES_BLD: &str = "dbms/MDC/STAT/standard/MDCSTAT01901";
const MARKETS: &[(&str, &str)] = &[("STK", "KOSPI"), ("KSQ", "KOSDAQ")];

static NAME_NOISE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s()\[\].·\-]").expect("valid regex"));

#[derive(Debug, Deserialize)]
struct ListedIssues {
    #[serde(rename = "OutBlock_1", default)]
    out_block: Vec<ListedIssue>,
}

#[derive(Debug, Deserialize)]
struct ListedIssue {
    #[serde(rename = "ISU_SRT_CD", default)]
    code: String,
    #[serde(rename = "ISU_ABBRV", default)]
    name: String,
}

/// Name/code lookup tables.
#[derive(Debug, Default)]
pub struct StockCodeTable {
    by_name: HashMap<String, String>,
    codes: HashSet<String>,
    /// (normalized name, code) in load order, for partial matching.
    ordered: Vec<(String, String)>,
}

impl StockCodeTable {
    pub fn from_entries<I, N, C>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, C)>,
        N: Into<String>,
        C: Into<String>,
    {
        let mut table = StockCodeTable::default();
        for (name, code) in entries {
            table.insert(name.into(), code.into());
        }
        table
    }

    fn insert(&mut self, name: String, code: String) {
        let name = name.trim().to_string();
        let code = code.trim().to_string();
        if name.is_empty() || code.is_empty() {
            return;
        }
        let normalized = normalize_name(&name);
        self.by_name.insert(name.clone(), code.clone());
        self.by_name.insert(normalized.clone(), code.clone());
        self.ordered.push((normalized, code.clone()));
        self.codes.insert(code);
    }

    /// Exact name, then normalized name, then containment either way.
    pub fn code_for(&self, company: &str) -> Option<&str> {
        let company = company.trim();
        if company.is_empty() {
            return None;
        }
        if let Some(code) = self.by_name.get(company) {
            return Some(code);
        }
        let normalized = normalize_name(company);
        if let Some(code) = self.by_name.get(&normalized) {
            return Some(code);
        }
        if normalized.chars().count() < 2 {
            return None;
        }
        self.ordered
            .iter()
            .find(|(name, _)| name.contains(&normalized) || normalized.contains(name.as_str()))
            .map(|(_, code)| code.as_str())
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Strip whitespace and the punctuation KRX and KIND disagree about.
pub fn normalize_name(name: &str) -> String {
    NAME_NOISE.replace_all(name, "").trim().to_string()
}

pub struct StockCodeMapper {
    client: reqwest::Client,
    api_url: String,
    table: OnceCell<StockCodeTable>,
}

impl StockCodeMapper {
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            api_url: config.krx_stock_api_url.clone(),
            table: OnceCell::new(),
        }
    }

    /// A mapper with a pre-filled table; never touches the network.
    pub fn with_table(client: reqwest::Client, table: StockCodeTable) -> Self {
        Self {
            client,
            api_url: String::new(),
            table: OnceCell::new_with(Some(table)),
        }
    }

    pub async fn code_for(&self, company: &str) -> Option<String> {
        let table = self.table.get_or_init(|| self.load()).await;
        let code = table.code_for(company).map(str::to_string);
        debug!(company, ?code, "Stock code lookup");
        code
    }

    async fn load(&self) -> StockCodeTable {
        let mut table = StockCodeTable::default();
        for (market_id, market_name) in MARKETS {
            match self.fetch_market(market_id).await {
                Ok(issues) => {
                    info!(market = *market_name, issues = issues.len(), "Listed issues loaded");
                    for issue in issues {
                        table.insert(issue.name, issue.code);
                    }
                }
                Err(e) => warn!(market = *market_name, error = %e, "Listed issues unavailable"),
            }
        }
        table
    }

    async fn fetch_market(&self, market_id: &str) -> Result<Vec<ListedIssue>, FetchError> {
        let response = self
            .client
            .post(&self.api_url)
            .header("Referer", "http://data.krx.co.kr/contents/MDC/MDI/mdiLoader/index.cmd")
            .form(&[
                ("bld", LISTED_ISSUES_BLD),
                ("locale", "ko_KR"),
                ("mktId", market_id),
                ("share", "1"),
                ("csvxls_isNo", "false"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: self.api_url.clone(),
            });
        }
        let body = response.text().await?;
        let parsed: ListedIssues =
            serde_json::from_str(&body).map_err(|e| FetchError::Parse(format!("listed issues: {}", e)))?;
        Ok(parsed.out_block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn test_lookup_order() {
        let table = StockCodeTable::from_entries([
            ("한미반도체", "042700"),
            ("LG에너지솔루션", "373220"),
            ("KB금융", "105560"),
        ]);
        assert_eq!(table.code_for("한미반도체"), Some("042700"));
        assert_eq!(table.code_for(" LG 에너지솔루션 "), Some("373220"));
        assert_eq!(table.code_for("KB금융지주"), Some("105560"));
        assert_eq!(table.code_for("없는회사"), None);
        assert_eq!(table.code_for(""), None);
    }

    #[test]
    fn test_normalize_name_strips_noise() {
        assert_eq!(normalize_name("(주) 한미·반도체 [우]"), "주한미반도체우");
    }

    #[tokio::test]
    async fn test_loads_both_markets_lazily() {
        let mut server = mockito::Server::new_async().await;
        let kospi = server
            .mock("POST", "/comm/bldAttendant/getJsonData.cmd")
            .match_body(Matcher::UrlEncoded("mktId".into(), "STK".into()))
            .with_body(r#"{"OutBlock_1":[{"ISU_SRT_CD":"005930","ISU_ABBRV":"삼성전자"}]}"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/comm/bldAttendant/getJsonData.cmd")
            .match_body(Matcher::UrlEncoded("mktId".into(), "KSQ".into()))
            .with_status(500)
            .create_async()
            .await;

        let mapper = StockCodeMapper::new(reqwest::Client::new(), &Config::for_tests(&server.url()));
        assert_eq!(mapper.code_for("삼성전자").await.as_deref(), Some("005930"));
        assert_eq!(mapper.code_for("삼성 전자").await.as_deref(), Some("005930"));
        kospi.assert_async().await;
    }
}
