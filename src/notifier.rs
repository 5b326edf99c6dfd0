// =============================================================================
// notifier.rs - ONE TELEGRAM MESSAGE AT THE END OF THE RUN
// =============================================================================
//
// The bot posts a single HTML summary: counts, the first few errors, the
// new filings grouped by date with links into the KIND viewer, and a link
// to the spreadsheet. Telegram caps a message at 4096 characters, so long
// summaries go out as several messages split on line boundaries with a
// short pause in between.
//
// Nothing here can fail a run. Missing token or chat id disables the
// notifier; send errors are logged and dropped.
// =============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::NotifyError;
use crate::metrics::RunSummary;
use crate::models::DisclosureRecord;
use crate::retriever::viewer_url;

/// Telegram's per-message limit, in characters.
pub const MESSAGE_LIMIT: usize = 4096;
/// Errors shown in the summary; the rest are only counted.
const SHOWN_ERRORS: usize = 5;

pub struct TelegramNotifier {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    chat_id: Option<String>,
    krx_base_url: String,
    chunk_delay: Duration,
}

impl TelegramNotifier {
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            api_url: config.telegram_api_url.trim_end_matches('/').to_string(),
            token: config.telegram_token.clone(),
            chat_id: config.telegram_chat_id.clone(),
            krx_base_url: config.krx_base_url.clone(),
            chunk_delay: config.telegram_chunk_delay,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some() && self.chat_id.is_some()
    }

    /// Send one message of at most [`MESSAGE_LIMIT`] characters.
    pub async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        let (Some(token), Some(chat_id)) = (&self.token, &self.chat_id) else {
            return Err(NotifyError::SendFailed("Telegram is not configured".into()));
        };

        let url = format!("{}/bot{}/sendMessage", self.api_url, token);
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        debug!(chars = text.chars().count(), "Sending Telegram message");
        let response = self.client.post(&url).json(&payload).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 429 {
            warn!("Telegram rate limit hit");
            return Err(NotifyError::RateLimited);
        }

        let body = response.text().await.unwrap_or_default();
        error!(status = status.as_u16(), body = %body, "Telegram sendMessage failed");
        Err(NotifyError::SendFailed(format!("HTTP {}: {}", status, body)))
    }

    /// Send arbitrarily long text as as many messages as it takes.
    /// Returns the number of chunks delivered.
    pub async fn send(&self, text: &str) -> Result<usize, NotifyError> {
        let chunks = split_message(text, MESSAGE_LIMIT);
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 && !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            self.send_message(chunk).await?;
            debug!(chunk = i + 1, total, "Telegram chunk sent");
        }
        Ok(total)
    }

    /// Format and send the end-of-run summary. Never fails the caller.
    pub async fn notify_run(&self, summary: &RunSummary, new_records: &[DisclosureRecord], spreadsheet_url: Option<&str>) {
        if !self.is_enabled() {
            info!("Telegram not configured, skipping notification");
            return;
        }
        let text = format_run_summary(summary, new_records, &self.krx_base_url, spreadsheet_url, chrono::Local::now().naive_local());
        match self.send(&text).await {
            Ok(chunks) => info!(chunks, "Telegram summary sent"),
            Err(e) => error!(error = %e, "Telegram summary could not be sent"),
        }
    }
}

/// Minimal escaping for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&#39;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Split on line boundaries so no chunk exceeds `limit` characters. A single
/// line longer than the limit is cut hard, but never inside a tag, an entity
/// or an open `<a>` element when an earlier cut point exists.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split('\n') {
        let line_len = line.chars().count();

        if line_len > limit {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            chunks.extend(hard_split(line, limit));
            continue;
        }

        let needed = if current.is_empty() { line_len } else { current_len + 1 + line_len };
        if needed > limit {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks
}

fn hard_split(line: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + limit).min(chars.len());
        if end < chars.len() {
            if let Some(open) = open_markup(&chars[start..end]).filter(|&i| i > 0) {
                end = start + open;
            }
        }
        pieces.push(chars[start..end].iter().collect());
        start = end;
    }
    pieces
}

/// Earliest position of markup still open at the end of `chars`: an element
/// without its closing tag, a tag without `>`, or an entity without `;`.
fn open_markup(chars: &[char]) -> Option<usize> {
    let mut element = None;
    let mut tag: Option<usize> = None;
    let mut entity = None;
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '<' => {
                tag = Some(i);
                if chars.get(i + 1) != Some(&'/') && element.is_none() {
                    element = Some(i);
                }
            }
            '>' => {
                if tag.is_some_and(|t| chars.get(t + 1) == Some(&'/')) {
                    element = None;
                }
                tag = None;
            }
            '&' if tag.is_none() => entity = Some(i),
            ';' if tag.is_none() => entity = None,
            _ => {}
        }
    }
    [element, tag, entity].into_iter().flatten().min()
}

pub fn format_run_summary(
    summary: &RunSummary,
    new_records: &[DisclosureRecord],
    krx_base_url: &str,
    spreadsheet_url: Option<&str>,
    now: chrono::NaiveDateTime,
) -> String {
    let mut lines = vec![
        "🔔 <b>밸류업 공시 모니터링</b>".to_string(),
        format!("🕐 {}", now.format("%Y-%m-%d %H:%M")),
        String::new(),
        "📊 <b>실행 결과</b>".to_string(),
        format!("• 발견: {}건", summary.total_found),
        format!("• 신규: {}건", summary.new_added),
        format!("• PDF 업로드: {}건", summary.pdf_uploaded),
        format!("• 분석 대기: {}건", summary.total_pending),
        format!("• 분석 완료: {}건", summary.analyzed),
        format!("• 오류: {}건", summary.errors),
    ];

    if summary.quota_exhausted {
        lines.push("⚠️ API 할당량 소진으로 남은 작업이 중단되었습니다.".to_string());
    }

    if !summary.error_messages.is_empty() {
        lines.push(String::new());
        lines.push("❌ <b>오류 내역</b>".to_string());
        for message in summary.error_messages.iter().take(SHOWN_ERRORS) {
            lines.push(format!("• {}", escape_html(message)));
        }
        let hidden = summary.errors.saturating_sub(SHOWN_ERRORS as u64);
        if hidden > 0 {
            lines.push(format!("... 외 {}건", hidden));
        }
    }

    if !new_records.is_empty() {
        lines.push(String::new());
        lines.push("🆕 <b>신규 공시</b>".to_string());

        let mut by_date: BTreeMap<String, Vec<&DisclosureRecord>> = BTreeMap::new();
        for record in new_records {
            let date = record
                .disclosed_date()
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "날짜 미상".to_string());
            by_date.entry(date).or_default().push(record);
        }

        for (date, records) in by_date.iter().rev() {
            lines.push(String::new());
            lines.push(format!("📅 {}", date));
            for record in records {
                let title = if record.title.is_empty() { "기업가치 제고 계획" } else { record.title.as_str() };
                lines.push(format!("• {}", escape_html(&record.company)));
                lines.push(format!(
                    "  └ <a href='{}'>{}</a>",
                    escape_html(&viewer_url(krx_base_url, &record.acptno)),
                    escape_html(title)
                ));
            }
        }
        lines.push(String::new());
        lines.push(format!("총 {}건의 신규 공시가 있습니다.", new_records.len()));
    }

    if let Some(url) = spreadsheet_url {
        lines.push(String::new());
        lines.push(format!("📎 <a href='{}'>스프레드시트 열기</a>", escape_html(url)));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use pretty_assertions::assert_eq;

    fn notifier(base: &str) -> TelegramNotifier {
        let mut config = Config::for_tests(base);
        config.telegram_token = Some("123:abc".into());
        config.telegram_chat_id = Some("-10042".into());
        TelegramNotifier::new(reqwest::Client::new(), &config)
    }

    fn record(acptno: &str, company: &str, date: &str) -> DisclosureRecord {
        let mut r = DisclosureRecord::new(acptno, company, date);
        r.title = "기업가치 제고 계획(자율공시)".into();
        r
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("S&P <500> 'q'"), "S&amp;P &lt;500&gt; &#39;q&#39;");
    }

    #[test]
    fn test_split_respects_limit_and_lines() {
        let text = "aaaa\nbbbb\ncccc";
        assert_eq!(split_message(text, 9), vec!["aaaa\nbbbb", "cccc"]);
        assert_eq!(split_message(text, 100), vec![text]);
    }

    #[test]
    fn test_split_hard_cuts_overlong_line() {
        let text = format!("head\n{}\ntail", "가".repeat(10));
        let chunks = split_message(&text, 4);
        assert_eq!(chunks, vec!["head", "가가가가", "가가가가", "가가", "tail"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
    }

    #[test]
    fn test_hard_cut_backs_off_to_markup_start() {
        let link = "<a href='https://kind.krx.co.kr/v?m=s&amp;a=1'>공시</a> 끝";
        let line = format!("{}{}", "x".repeat(30), link);
        let chunks = split_message(&line, 60);
        assert_eq!(chunks, vec!["x".repeat(30), link.to_string()]);

        let line = format!("{}&amp;zz", "y".repeat(18));
        assert_eq!(split_message(&line, 20), vec!["y".repeat(18), "&amp;zz".to_string()]);
    }

    #[test]
    fn test_summary_groups_new_disclosures_by_date() {
        let summary = RunSummary {
            total_found: 3,
            new_added: 2,
            errors: 7,
            error_messages: (0..7).map(|i| format!("회사{}: 분석 실패", i)).collect(),
            quota_exhausted: true,
            ..RunSummary::default()
        };
        let records = vec![
            record("20251226000082", "한미반도체", "2025-12-26 15:30"),
            record("20251224000011", "S&T모티브", "2025-12-24 09:00"),
        ];
        let now = chrono::NaiveDate::from_ymd_opt(2025, 12, 27).unwrap().and_hms_opt(8, 0, 0).unwrap();
        let text = format_run_summary(&summary, &records, "https://kind.krx.co.kr", Some("https://docs.google.com/spreadsheets/d/x"), now);

        assert!(text.starts_with("🔔 <b>밸류업 공시 모니터링</b>\n🕐 2025-12-27 08:00"));
        assert!(text.contains("• 신규: 2건"));
        assert!(text.contains("⚠️ API 할당량 소진"));
        assert!(text.contains("• 회사4: 분석 실패"));
        assert!(!text.contains("회사5"));
        assert!(text.contains("... 외 2건"));
        assert!(text.contains("• S&amp;T모티브"));
        assert!(text.contains(
            "  └ <a href='https://kind.krx.co.kr/common/disclsviewer.do?method=search&amp;acptno=20251226000082'>기업가치 제고 계획(자율공시)</a>"
        ));
        let newer = text.find("📅 2025-12-26").unwrap();
        let older = text.find("📅 2025-12-24").unwrap();
        assert!(newer < older);
        assert!(text.contains("총 2건의 신규 공시가 있습니다."));
        assert!(text.ends_with("📎 <a href='https://docs.google.com/spreadsheets/d/x'>스프레드시트 열기</a>"));
    }

    #[tokio::test]
    async fn test_send_message_posts_html_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/bot123:abc/sendMessage")
            .match_body(Matcher::PartialJson(json!({
                "chat_id": "-10042",
                "text": "hello",
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            })))
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        notifier(&server.url()).send_message("hello").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_long_text_is_sent_in_chunks() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/bot123:abc/sendMessage")
            .with_body(r#"{"ok":true}"#)
            .expect(2)
            .create_async()
            .await;

        let line = "x".repeat(3000);
        let text = format!("{}\n{}", line, line);
        assert_eq!(notifier(&server.url()).send(&text).await.unwrap(), 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_and_failure_classification() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/bot123:abc/sendMessage")
            .with_status(429)
            .create_async()
            .await;
        let err = notifier(&server.url()).send_message("x").await.unwrap_err();
        assert!(matches!(err, NotifyError::RateLimited));

        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/bot123:abc/sendMessage")
            .with_status(400)
            .with_body(r#"{"ok":false,"description":"Bad Request: chat not found"}"#)
            .create_async()
            .await;
        let err = notifier(&server.url()).send_message("x").await.unwrap_err();
        assert!(matches!(err, NotifyError::SendFailed(msg) if msg.contains("chat not found")));
    }

    #[tokio::test]
    async fn test_disabled_notifier_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("POST", Matcher::Any).expect(0).create_async().await;

        let config = Config::for_tests(&server.url());
        let notifier = TelegramNotifier::new(reqwest::Client::new(), &config);
        assert!(!notifier.is_enabled());
        notifier.notify_run(&RunSummary::default(), &[], None).await;
        mock.assert_async().await;
    }
}
