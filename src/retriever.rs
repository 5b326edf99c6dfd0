// =============================================================================
// retriever.rs - GETTING THE ACTUAL PDF
// =============================================================================
//
// KIND will only hand over a filing's PDF if you know two numbers: the
// accession number (from the list) and the document number (docNo), which
// only appears on the filing's viewer page. So retrieval is two steps:
//
//   1. GET the viewer page and read docNo from the `mainDoc` dropdown
//      (value looks like "20251128000575|Y"), or from a hidden input.
//   2. GET pdfDownload.do with both numbers. If that doesn't produce a PDF,
//      POST the same fields the way the viewer's download button does.
//
// Whatever comes back must start with `%PDF` and be bigger than the minimum
// size; KIND happily returns 200 OK with an HTML error page. There is no
// retry here. A failed record stays pending and the next run tries again.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::FetchError;
use crate::models::DisclosureRecord;

const VIEWER_PATH: &str = "/common/disclsviewer.do";
const PDF_DOWNLOAD_PATH: &str = "/common/pdfDownload.do";

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self, record: &DisclosureRecord) -> Result<Vec<u8>, FetchError>;
}

pub struct KindRetriever {
    client: reqwest::Client,
    base_url: String,
    min_bytes: usize,
    request_delay: Duration,
}

impl KindRetriever {
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.krx_base_url.trim_end_matches('/').to_string(),
            min_bytes: config.min_pdf_bytes,
            request_delay: config.request_delay,
        }
    }

    /// Read the document number off the viewer page.
    pub async fn resolve_doc_no(&self, acptno: &str) -> Result<Option<String>, FetchError> {
        let url = viewer_url(&self.base_url, acptno);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        let html = response.text().await?;
        Ok(parse_doc_no(&html))
    }

    async fn download_direct(&self, acptno: &str, doc_no: Option<&str>) -> Result<Vec<u8>, FetchError> {
        let mut params = vec![("method", "pdfDown"), ("acptNo", acptno)];
        if let Some(doc_no) = doc_no {
            params.push(("docNo", doc_no));
        }
        let url = kind_url(&self.base_url, PDF_DOWNLOAD_PATH, &params);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        let bytes = response.bytes().await?.to_vec();
        self.validate(bytes)
    }

    async fn download_via_form(&self, acptno: &str, doc_no: &str) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}{}", self.base_url, PDF_DOWNLOAD_PATH);
        let response = self
            .client
            .post(&url)
            .header("Referer", viewer_url(&self.base_url, acptno))
            .form(&[("method", "pdfDown"), ("acptNo", acptno), ("docNo", doc_no)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        let bytes = response.bytes().await?.to_vec();
        self.validate(bytes)
    }

    fn validate(&self, bytes: Vec<u8>) -> Result<Vec<u8>, FetchError> {
        if is_valid_pdf(&bytes, self.min_bytes) {
            Ok(bytes)
        } else {
            Err(FetchError::InvalidDocument { len: bytes.len() })
        }
    }
}

#[async_trait]
impl DocumentSource for KindRetriever {
    async fn fetch_document(&self, record: &DisclosureRecord) -> Result<Vec<u8>, FetchError> {
        let acptno = record.acptno.as_str();

        let doc_no = match record.doc_no.clone().filter(|d| !d.is_empty()) {
            Some(known) => Some(known),
            None => match self.resolve_doc_no(acptno).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(acptno, error = %e, "Viewer page failed, trying download without docNo");
                    None
                }
            },
        };

        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }

        let Some(doc_no) = doc_no else {
            return self.download_direct(acptno, None).await.map_err(|e| {
                debug!(acptno, error = %e, "Download without docNo failed");
                FetchError::MissingDocNo(acptno.to_string())
            });
        };

        match self.download_direct(acptno, Some(&doc_no)).await {
            Ok(bytes) => {
                info!(acptno, doc_no = %doc_no, bytes = bytes.len(), "PDF downloaded");
                Ok(bytes)
            }
            Err(e) => {
                debug!(acptno, error = %e, "Direct download failed, submitting the viewer form");
                let bytes = self.download_via_form(acptno, &doc_no).await?;
                info!(acptno, doc_no = %doc_no, bytes = bytes.len(), "PDF downloaded via form");
                Ok(bytes)
            }
        }
    }
}

/// The public viewer page for a filing. Also what the notifier links to.
pub fn viewer_url(base_url: &str, acptno: &str) -> String {
    kind_url(base_url, VIEWER_PATH, &[("method", "search"), ("acptno", acptno)])
}

/// `base_url` + `path` with an encoded query. A base that does not parse
/// is glued on as-is so the failure shows up at request time.
pub fn kind_url(base_url: &str, path: &str, params: &[(&str, &str)]) -> String {
    let base = base_url.trim_end_matches('/');
    match url::Url::parse(&format!("{}{}", base, path)) {
        Ok(mut url) => {
            url.query_pairs_mut().extend_pairs(params);
            url.to_string()
        }
        Err(_) => {
            let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            format!("{}{}?{}", base, path, query.join("&"))
        }
    }
}

/// `%PDF` signature and longer than `min_bytes`.
pub fn is_valid_pdf(bytes: &[u8], min_bytes: usize) -> bool {
    bytes.len() > min_bytes && bytes.starts_with(b"%PDF")
}

/// docNo from the viewer page: the selected `mainDoc` option (else the
/// second option, the first being a placeholder), then a `docNo` input.
pub fn parse_doc_no(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    let option_value = ["select#mainDoc option[selected]", "select#mainDoc option:nth-child(2)"]
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| {
            document
                .select(&selector)
                .next()
                .and_then(|o| o.value().attr("value"))
                .map(str::to_string)
        });
    if let Some(value) = option_value {
        let doc_no = value.split('|').next().unwrap_or("").trim().to_string();
        if !doc_no.is_empty() {
            return Some(doc_no);
        }
    }

    let input = Selector::parse(r#"input#docNo, input[name="docNo"]"#).ok()?;
    document
        .select(&input)
        .filter_map(|i| i.value().attr("value"))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const VIEWER_HTML: &str = r#"<html><body>
<select id="mainDoc" name="mainDoc">
  <option value="">본문선택</option>
  <option value="20251226000575|Y" selected="selected">기업가치 제고 계획(자율공시)</option>
</select></body></html>"#;

    fn fake_pdf() -> Vec<u8> {
        let mut bytes = b"%PDF-1.5\n".to_vec();
        bytes.resize(64, b'x');
        bytes
    }

    fn retriever(server: &mockito::ServerGuard) -> KindRetriever {
        KindRetriever::new(reqwest::Client::new(), &Config::for_tests(&server.url()))
    }

    #[test]
    fn test_doc_no_from_selected_option() {
        assert_eq!(parse_doc_no(VIEWER_HTML).as_deref(), Some("20251226000575"));
    }

    #[test]
    fn test_doc_no_from_second_option_then_hidden_input() {
        let html = r#"<select id="mainDoc"><option value="">선택</option><option value="20251201000001|N">본문</option></select>"#;
        assert_eq!(parse_doc_no(html).as_deref(), Some("20251201000001"));

        let html = r#"<form><input type="hidden" id="docNo" value=" 20251201000002 "></form>"#;
        assert_eq!(parse_doc_no(html).as_deref(), Some("20251201000002"));

        assert_eq!(parse_doc_no("<p>nothing</p>"), None);
    }

    #[test]
    fn test_kind_urls() {
        assert_eq!(
            viewer_url("https://kind.krx.co.kr/", "20251226000082"),
            "https://kind.krx.co.kr/common/disclsviewer.do?method=search&acptno=20251226000082"
        );
        assert_eq!(
            kind_url("https://kind.krx.co.kr", "/x.do", &[("q", "a b&c")]),
            "https://kind.krx.co.kr/x.do?q=a+b%26c"
        );
    }

    #[test]
    fn test_pdf_validity() {
        assert!(is_valid_pdf(&fake_pdf(), 16));
        assert!(!is_valid_pdf(b"%PDF", 16));
        assert!(!is_valid_pdf(&[b'<'; 64], 16));
    }

    #[test]
    fn test_pdf_exactly_at_minimum_is_rejected() {
        let mut at_minimum = b"%PDF-1.5\n".to_vec();
        at_minimum.resize(16, b'x');
        assert!(!is_valid_pdf(&at_minimum, 16));
        at_minimum.push(b'x');
        assert!(is_valid_pdf(&at_minimum, 16));
    }

    #[tokio::test]
    async fn test_viewer_then_direct_download() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", VIEWER_PATH)
            .match_query(Matcher::UrlEncoded("acptno".into(), "20251226000082".into()))
            .with_body(VIEWER_HTML)
            .create_async()
            .await;
        let download = server
            .mock("GET", PDF_DOWNLOAD_PATH)
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("acptNo".into(), "20251226000082".into()),
                Matcher::UrlEncoded("docNo".into(), "20251226000575".into()),
            ]))
            .with_body(fake_pdf())
            .create_async()
            .await;

        let record = DisclosureRecord::new("20251226000082", "한미반도체", "2025-12-26 09:11");
        let bytes = retriever(&server).fetch_document(&record).await.unwrap();

        assert_eq!(bytes, fake_pdf());
        download.assert_async().await;
    }

    #[tokio::test]
    async fn test_html_error_page_falls_back_to_form_post() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PDF_DOWNLOAD_PATH)
            .match_query(Matcher::Any)
            .with_body("<html>세션이 만료되었습니다</html>")
            .create_async()
            .await;
        let form = server
            .mock("POST", PDF_DOWNLOAD_PATH)
            .match_body(Matcher::UrlEncoded("docNo".into(), "D1".into()))
            .with_body(fake_pdf())
            .create_async()
            .await;

        let mut record = DisclosureRecord::new("20251226000082", "한미반도체", "2025-12-26 09:11");
        record.doc_no = Some("D1".into());
        let bytes = retriever(&server).fetch_document(&record).await.unwrap();

        assert!(bytes.starts_with(b"%PDF"));
        form.assert_async().await;
    }

    #[tokio::test]
    async fn test_both_paths_invalid_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", PDF_DOWNLOAD_PATH)
            .match_query(Matcher::Any)
            .with_body("not a pdf")
            .create_async()
            .await;
        server
            .mock("POST", PDF_DOWNLOAD_PATH)
            .with_body("still not a pdf")
            .create_async()
            .await;

        let mut record = DisclosureRecord::new("1", "x", "2025-12-26");
        record.doc_no = Some("D1".into());
        let err = retriever(&server).fetch_document(&record).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidDocument { len: 15 }));
    }
}
