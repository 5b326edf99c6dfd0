// =============================================================================
// lister.rs - WALKING THE KIND VALUE-UP BOARD
// =============================================================================
//
// KIND (kind.krx.co.kr) publishes every 기업가치 제고 계획 filing in a
// paginated, server-rendered table. The page itself is a shell; the table
// comes from a form POST with the page index and date range, newest first.
//
// From each row we need the accession number (접수번호), and KIND does not
// put it anywhere polite. It lives inside an inline `onclick` handler, or
// sometimes a query string, or, on a bad day, just as a bare 14-digit run
// somewhere in the markup. So we try patterns in a fixed order and take the
// first hit. Rows where nothing matches are logged and skipped.
//
// Pagination stops on the first empty page, on max_pages, on a page that
// fails to load (keeping what we have), or, in days mode, on the first row
// older than the cutoff. The board is sorted newest first, so once one row
// falls out of the window everything after it does too.
// =============================================================================

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::FetchError;
use crate::models::{DisclosureRecord, ListWindow};

const LIST_PATH: &str = "/valueup/disclsstat.do";
const PDF_DOWNLOAD_PATH: &str = "/common/pdfDownload.do";

/// Accession-number patterns, highest confidence first.
static VIEWER_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"openDisclsViewer\s*\(\s*['"](\d+)['"]"#).expect("valid regex"));
static ACPTNO_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)acptno[='"\s:]+['"]?(\d+)"#).expect("valid regex"));
static FOURTEEN_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{14}").expect("valid regex"));
static STOCK_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Z]?\d{6}").expect("valid regex"));

/// Row selectors, tried in order until one matches anything.
const ROW_SELECTORS: &[&str] = &["table.list tbody tr", "table.tbl-list tbody tr", "div.list table tbody tr", "table tbody tr"];

/// Where candidate disclosures come from.
#[async_trait]
pub trait DisclosureSource: Send + Sync {
    async fn list(&self, window: ListWindow, max_pages: u32, today: NaiveDate) -> Vec<DisclosureRecord>;
}

pub struct KindLister {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
    request_delay: Duration,
}

impl KindLister {
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.krx_base_url.trim_end_matches('/').to_string(),
            page_size: config.list_page_size,
            request_delay: config.request_delay,
        }
    }

    async fn fetch_page(&self, page: u32, from: Option<NaiveDate>, to: NaiveDate) -> Result<String, FetchError> {
        let url = format!("{}{}", self.base_url, LIST_PATH);
        let from_date = from.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();
        let to_date = to.format("%Y-%m-%d").to_string();
        let page_index = page.to_string();
        let page_size = self.page_size.to_string();

        let form = [
            ("method", "searchValueupDisclsStatSub"),
            ("currentPageSize", page_size.as_str()),
            ("pageIndex", page_index.as_str()),
            ("orderMode", "1"),
            ("orderStat", "D"),
            ("fromDate", from_date.as_str()),
            ("toDate", to_date.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .header("Referer", format!("{}{}?method=valueupDisclsStatMain", self.base_url, LIST_PATH))
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl DisclosureSource for KindLister {
    async fn list(&self, window: ListWindow, max_pages: u32, today: NaiveDate) -> Vec<DisclosureRecord> {
        let (from, cutoff) = match window {
            ListWindow::Days(days) => {
                let from = today.checked_sub_days(chrono::Days::new(u64::from(days)));
                (from, from)
            }
            ListWindow::Period(period) => (period.lower_bound(today), None),
        };

        info!(?window, ?from, to = %today, max_pages, "Listing value-up disclosures");

        let mut collected = Vec::new();
        for page in 1..=max_pages.max(1) {
            if page > 1 && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }

            let html = match self.fetch_page(page, from, today).await {
                Ok(html) => html,
                Err(e) => {
                    warn!(page, error = %e, collected = collected.len(), "List page failed, keeping partial results");
                    break;
                }
            };

            let rows = parse_list_page(&html, &self.base_url);
            debug!(page, rows = rows.len(), "List page parsed");
            if rows.is_empty() {
                break;
            }

            match cutoff {
                Some(cutoff) => {
                    let total = rows.len();
                    // Rows with unreadable dates are kept.
                    let kept: Vec<_> = rows
                        .into_iter()
                        .filter(|r| r.disclosed_date().map_or(true, |d| d >= cutoff))
                        .collect();
                    let reached_cutoff = kept.len() < total;
                    collected.extend(kept);
                    if reached_cutoff {
                        debug!(page, %cutoff, "Reached rows older than the window, stopping");
                        break;
                    }
                }
                None => collected.extend(rows),
            }
        }

        info!(found = collected.len(), "Listing finished");
        collected
    }
}

/// Parse one list page into records. Pure; used directly by tests.
pub fn parse_list_page(html: &str, base_url: &str) -> Vec<DisclosureRecord> {
    let document = Html::parse_document(html);
    let td = match Selector::parse("td") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let rows: Vec<ElementRef> = ROW_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .map(|selector| document.select(&selector).collect::<Vec<_>>())
        .find(|rows| !rows.is_empty())
        .unwrap_or_default();

    let mut records = Vec::new();
    for row in rows {
        let cells: Vec<ElementRef> = row.select(&td).collect();
        if cells.len() < 4 {
            continue;
        }

        let Some(acptno) = extract_acptno(&row, &cells[3]) else {
            let title = element_text(&cells[3]);
            if !title.is_empty() {
                warn!(title = %title, "Row without an accession number, skipping");
            }
            continue;
        };

        let company_full = element_text(&cells[2]);
        let company = first_anchor_text(&cells[2])
            .or_else(|| company_full.split_whitespace().next().map(str::to_string))
            .unwrap_or_default();

        let mut record = DisclosureRecord::new(acptno, company, element_text(&cells[1]));
        record.number = element_text(&cells[0]).parse().unwrap_or(0);
        record.stock_code = STOCK_CODE
            .find(&company_full)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        record.title = element_text(&cells[3]);
        record.pdf_url = pdf_download_url(base_url, &record.acptno);
        records.push(record);
    }
    records
}

pub fn pdf_download_url(base_url: &str, acptno: &str) -> String {
    crate::retriever::kind_url(base_url, PDF_DOWNLOAD_PATH, &[("method", "pdfDown"), ("acptNo", acptno)])
}

/// The ordered accession cascade: title onclick, row markup, acptno
/// parameter, bare 14-digit run.
fn extract_acptno(row: &ElementRef, title_cell: &ElementRef) -> Option<String> {
    let onclick = Selector::parse("a")
        .ok()
        .and_then(|a| title_cell.select(&a).next())
        .and_then(|a| a.value().attr("onclick"))
        .unwrap_or("");
    if let Some(c) = VIEWER_CALL.captures(onclick) {
        return Some(c[1].to_string());
    }

    let row_html = row.html();
    if let Some(c) = VIEWER_CALL.captures(&row_html) {
        return Some(c[1].to_string());
    }
    if let Some(c) = ACPTNO_PARAM.captures(&row_html) {
        return Some(c[1].to_string());
    }
    FOURTEEN_DIGITS.find(&row_html).map(|m| m.as_str().to_string())
}

fn first_anchor_text(cell: &ElementRef) -> Option<String> {
    let a = Selector::parse("a").ok()?;
    let text = element_text(&cell.select(&a).next()?);
    (!text.is_empty()).then_some(text)
}

/// All descendant text, whitespace collapsed.
fn element_text(el: &ElementRef) -> String {
    el.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
pub(crate) fn list_page_html(rows: &[(&str, &str, &str, &str)]) -> String {
    let body: String = rows
        .iter()
        .enumerate()
        .map(|(i, (date, company, code, acptno))| {
            format!(
                r##"<tr>
  <td class="first txc">{n}</td>
  <td class="txc">{date}</td>
  <td><a href="#" onclick="companysummary_open('{code}');return false;" title="{company}">{company}</a> <span>{code}</span></td>
  <td><a href="#viewer" onclick="openDisclsViewer('{acptno}','');return false;">기업가치 제고 계획(자율공시)</a></td>
  <td>{company}</td>
</tr>"##,
                n = rows.len() - i
            )
        })
        .collect();
    format!(
        r#"<section class="scrarea"><table class="list type-00"><thead><tr><th>번호</th><th>공시일자</th><th>회사명</th><th>공시제목</th><th>제출인</th></tr></thead><tbody>{body}</tbody></table></section>"#
    )
}
