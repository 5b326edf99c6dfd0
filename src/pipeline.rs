// =============================================================================
// pipeline.rs - ONE RUN, START TO FINISH
// =============================================================================
//
// Two phases, strictly one after the other, one record at a time:
//
//   MONITOR   list KIND -> drop accession numbers already on the sheet ->
//             fill stock codes -> append -> archive PDFs to Drive for every
//             row that still has no Drive link
//
//   ANALYSIS  load the Framework sheet -> pick pending rows (newest `days`,
//             not yet on the analysis sheet, capped at max_items) -> for each:
//             download -> extract -> analyse (every provider call waits
//             for the per-minute budget) -> analysis row + company
//             workbook + list meta
//
// Nothing below escapes a single record. Failures become a line in
// RunMetrics and the loop moves on; the only run-level stops are the
// quota breaker (three analysis failures in a row) and the write sentinels.
//
// Rate-limited analysis failures leave the record pending so a later run
// picks it up. Every other analysis failure writes an `error` row, which
// takes the record out of the pending set for good.
// =============================================================================

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::NaiveDate;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::analyzer::{AnalysisInput, StructuredAnalyzer};
use crate::cli::Cli;
use crate::config::Config;
use crate::dedup::AccessionIndex;
use crate::error::{AnalyzerError, FetchError, QuotaKind};
use crate::extractor;
use crate::framework::Framework;
use crate::lister::DisclosureSource;
use crate::metrics::{RunMetrics, RunSummary};
use crate::models::{AnalysisResult, DisclosureRecord, ListWindow};
use crate::quota_breaker::QuotaBreaker;
use crate::rate_budget::RateBudget;
use crate::retriever::DocumentSource;
use crate::sheets::company::CompanyWorkbooks;
use crate::sheets::ledger::{AnalysisMeta, AnalysisStatus, DisclosureLedger};
use crate::sheets::{spreadsheet_url, DriveStore, QuotaSentinel, SheetStore, PDF_MIME};
use crate::stock_codes::StockCodeMapper;

static FILENAME_NOISE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w]").expect("valid regex"));

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// What this run should do, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub window: ListWindow,
    pub days: u32,
    pub max_pages: u32,
    pub max_items: usize,
    pub dry_run: bool,
    pub skip_pdf: bool,
    pub monitor: bool,
    pub analyze: bool,
}

impl From<&Cli> for RunOptions {
    fn from(cli: &Cli) -> Self {
        Self {
            window: cli.window(),
            days: cli.days,
            max_pages: cli.max_pages,
            max_items: cli.max_items,
            dry_run: cli.dry_run,
            skip_pdf: cli.skip_pdf,
            monitor: cli.runs_monitor(),
            analyze: cli.runs_analysis(),
        }
    }
}

/// Everything the pipeline talks to. Real clients in main, fakes in tests.
pub struct Services {
    pub lister: Arc<dyn DisclosureSource>,
    pub retriever: Arc<dyn DocumentSource>,
    pub stock_codes: Arc<StockCodeMapper>,
    pub sheets: Arc<dyn SheetStore>,
    pub drive: Arc<dyn DriveStore>,
    /// `None` for monitor-only runs.
    pub analyzer: Option<StructuredAnalyzer>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    pub new_records: Vec<DisclosureRecord>,
    pub spreadsheet_url: String,
}

/// Why one record could not be analysed.
#[derive(Debug)]
enum ItemError {
    Download(FetchError),
    Analysis(AnalyzerError),
}

pub struct Pipeline {
    lister: Arc<dyn DisclosureSource>,
    retriever: Arc<dyn DocumentSource>,
    stock_codes: Arc<StockCodeMapper>,
    drive: Arc<dyn DriveStore>,
    analyzer: Option<StructuredAnalyzer>,
    ledger: DisclosureLedger,
    companies: CompanyWorkbooks,
    sentinel: Arc<QuotaSentinel>,
    index: AccessionIndex,
    spreadsheet_id: String,
    pdf_folder_id: Option<String>,
    max_consecutive_failures: u32,
    item_delay: Duration,
    request_delay: Duration,
}

impl Pipeline {
    pub fn new(config: &Config, spreadsheet_id: impl Into<String>, services: Services) -> Self {
        let spreadsheet_id = spreadsheet_id.into();
        let sentinel = Arc::new(QuotaSentinel::new());
        Self {
            ledger: DisclosureLedger::new(services.sheets.clone(), spreadsheet_id.clone(), sentinel.clone()),
            companies: CompanyWorkbooks::new(
                services.sheets,
                services.drive.clone(),
                config.archive_folder_id.clone(),
                sentinel.clone(),
            ),
            lister: services.lister,
            retriever: services.retriever,
            stock_codes: services.stock_codes,
            drive: services.drive,
            analyzer: services.analyzer.map(|analyzer| {
                analyzer.with_budget(Arc::new(RateBudget::new(config.requests_per_minute, config.tokens_per_minute)))
            }),
            sentinel,
            index: AccessionIndex::new(),
            spreadsheet_id,
            pdf_folder_id: config.pdf_folder_id.clone(),
            max_consecutive_failures: config.max_consecutive_failures,
            item_delay: config.item_delay,
            request_delay: config.request_delay,
        }
    }

    pub fn dedup_index(&self) -> &AccessionIndex {
        &self.index
    }

    pub async fn run(&self, options: &RunOptions, today: NaiveDate) -> RunReport {
        let metrics = RunMetrics::new();
        let mut new_records = Vec::new();

        if options.monitor {
            info!("========== MONITOR ==========");
            new_records = self.monitor(options, today, &metrics).await;
        }
        if options.analyze {
            info!("========== ANALYSIS ==========");
            self.analyze_pending(options, today, &metrics).await;
        }
        if self.sentinel.any_tripped() {
            metrics.mark_quota_exhausted();
        }

        let summary = metrics.snapshot();
        info!(
            found = summary.total_found,
            new = summary.new_added,
            uploaded = summary.pdf_uploaded,
            pending = summary.total_pending,
            analyzed = summary.analyzed,
            errors = summary.errors,
            quota_exhausted = summary.quota_exhausted,
            "Run finished"
        );
        RunReport {
            summary,
            new_records,
            spreadsheet_url: spreadsheet_url(&self.spreadsheet_id),
        }
    }

    // =========================================================================
    // MONITOR
    // =========================================================================

    async fn monitor(&self, options: &RunOptions, today: NaiveDate, metrics: &RunMetrics) -> Vec<DisclosureRecord> {
        let info = match self.ledger.ensure_list_sheet().await {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "Disclosure list sheet unavailable");
                metrics.record_error(format!("Google Sheets 연결 실패: {}", e));
                return Vec::new();
            }
        };
        match self.ledger.existing_acptnos().await {
            Ok(existing) => self.index.seed(existing),
            Err(e) => {
                // Without the existing keys every row would look new.
                error!(error = %e, "Could not read existing accession numbers");
                metrics.record_error(format!("Google Sheets 연결 실패: {}", e));
                return Vec::new();
            }
        }

        let mut found = self.lister.list(options.window, options.max_pages, today).await;
        metrics.add_found(found.len());
        found.retain(|r| !self.index.contains(&r.acptno));

        for record in found.iter_mut().filter(|r| r.stock_code.is_empty()) {
            if let Some(code) = self.stock_codes.code_for(&record.company).await {
                record.stock_code = code;
            }
        }

        let collected_at = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        let fresh = if options.dry_run {
            let fresh: Vec<DisclosureRecord> = found
                .into_iter()
                .filter(|r| self.index.check_and_insert(&r.acptno))
                .collect();
            info!(count = fresh.len(), "[DRY-RUN] New disclosures not written");
            fresh
        } else {
            match self.ledger.append_new(&info, &found, &self.index, &collected_at).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    error!(error = %e, "Appending disclosures failed");
                    metrics.record_error(format!("시트 저장 실패: {}", e));
                    Vec::new()
                }
            }
        };
        metrics.add_new(fresh.len());
        for record in &fresh {
            info!(acptno = %record.acptno, company = %record.company, date = %record.disclosed_at, "New disclosure");
        }
        let dedup = self.index.snapshot();
        info!(
            checks = dedup.total_checks,
            unique = dedup.unique_items,
            duplicates = dedup.duplicates_caught,
            seeded = dedup.seeded_from_sheet,
            index_size = dedup.index_size,
            "Dedup stats"
        );

        if options.skip_pdf {
            info!("PDF archive skipped (--skip-pdf)");
        } else if options.dry_run {
            info!("[DRY-RUN] PDF archive skipped");
        } else {
            self.archive_pdfs(metrics).await;
        }
        fresh
    }

    async fn archive_pdfs(&self, metrics: &RunMetrics) {
        let Some(folder) = self.pdf_folder_id.as_deref() else {
            info!("GDRIVE_FOLDER_ID not set, PDF archive skipped");
            return;
        };
        let waiting = match self.ledger.without_drive_link().await {
            Ok(waiting) => waiting,
            Err(e) => {
                warn!(error = %e, "Could not read rows without Drive links");
                return;
            }
        };
        if waiting.is_empty() {
            info!("Every row already has a Drive link");
            return;
        }
        info!(count = waiting.len(), "Archiving PDFs to Drive");

        let mut links = Vec::new();
        for (i, record) in waiting.iter().enumerate() {
            if self.sentinel.is_tripped(QuotaKind::DriveUpload) {
                warn!(remaining = waiting.len() - i, "Drive quota exhausted, leaving the rest for a later run");
                break;
            }
            if i > 0 && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }

            let bytes = match self.retriever.fetch_document(record).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(acptno = %record.acptno, error = %e, "PDF download failed");
                    metrics.record_error(format!("PDF 다운로드 실패: {}", record.acptno));
                    continue;
                }
            };

            let name = pdf_file_name(record);
            let uploaded = self
                .sentinel
                .guard(QuotaKind::DriveUpload, self.drive.upload_file(&name, Some(folder), PDF_MIME, bytes))
                .await;
            let file = match uploaded {
                Ok(file) => file,
                Err(e) => {
                    warn!(acptno = %record.acptno, error = %e, "Drive upload failed");
                    metrics.record_error(format!("Drive 업로드 실패: {}", record.acptno));
                    continue;
                }
            };
            if let Err(e) = self.drive.share_anyone_reader(&file.id).await {
                warn!(file = %file.id, error = %e, "Could not share uploaded PDF");
            }

            let link = file
                .web_view_link
                .unwrap_or_else(|| format!("https://drive.google.com/file/d/{}/view", file.id));
            info!(acptno = %record.acptno, file = %name, "PDF archived");
            metrics.increment_uploaded();
            links.push((record.acptno.clone(), link));
        }

        if let Err(e) = self.ledger.update_drive_links(&links).await {
            error!(error = %e, count = links.len(), "Writing Drive links failed");
            metrics.record_error(format!("Drive 링크 저장 실패: {}", e));
        }
    }

    // =========================================================================
    // ANALYSIS
    // =========================================================================

    async fn analyze_pending(&self, options: &RunOptions, today: NaiveDate, metrics: &RunMetrics) {
        let Some(analyzer) = &self.analyzer else {
            warn!("No analyzer configured, analysis skipped");
            return;
        };

        let framework = match self.ledger.load_framework().await {
            Ok(framework) if !framework.is_empty() => framework,
            Ok(_) => {
                error!("[오류] 프레임워크를 로드할 수 없습니다. Framework sheet has no items");
                metrics.record_error("프레임워크 로드 실패");
                return;
            }
            Err(e) => {
                error!(error = %e, "[오류] 프레임워크를 로드할 수 없습니다.");
                metrics.record_error("프레임워크 로드 실패");
                return;
            }
        };
        info!(
            version = %framework.version,
            items = framework.items.len(),
            core = framework.core_items().count(),
            "Framework loaded"
        );

        if !options.dry_run {
            if let Err(e) = self.ledger.ensure_analysis_sheet(&framework).await {
                error!(error = %e, "Analysis sheet unavailable");
                metrics.record_error(format!("Google Sheets 연결 실패: {}", e));
                return;
            }
        }

        let pending = match self.ledger.pending(options.days, today).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Could not read pending disclosures");
                metrics.record_error(format!("분석 대기 조회 실패: {}", e));
                return;
            }
        };
        metrics.set_pending(pending.len());
        if pending.is_empty() {
            info!("Nothing pending for analysis");
            return;
        }
        if pending.len() > options.max_items {
            info!(pending = pending.len(), max_items = options.max_items, "Analysing the first batch only, the rest waits for the next run");
        }

        let breaker = QuotaBreaker::new(analyzer.provider_name(), self.max_consecutive_failures);
        let batch: Vec<DisclosureRecord> = pending.into_iter().take(options.max_items).collect();
        let total = batch.len();
        let mut estimates = Vec::with_capacity(total);

        for (i, mut record) in batch.into_iter().enumerate() {
            if !breaker.allow_request() {
                break;
            }
            if i > 0 && !self.item_delay.is_zero() {
                tokio::time::sleep(self.item_delay).await;
            }
            if record.stock_code.is_empty() {
                if let Some(code) = self.stock_codes.code_for(&record.company).await {
                    record.stock_code = code;
                }
            }
            info!(n = i + 1, total, acptno = %record.acptno, company = %record.company, "Analysing disclosure");

            match self.analyze_one(analyzer, &record, &framework, &mut estimates).await {
                Ok(result) => {
                    breaker.record_success();
                    info!(
                        company = %record.company,
                        mentioned = result.mentioned_count(),
                        quantitative = result.quantitative_count(),
                        "분석 완료"
                    );
                    if options.dry_run {
                        info!(acptno = %record.acptno, "[DRY-RUN] Result not saved");
                        continue;
                    }
                    self.save_result(&record, &result, &framework, metrics).await;
                }
                Err(ItemError::Download(e)) => {
                    // Stays pending; the next run tries the download again.
                    warn!(acptno = %record.acptno, error = %e, "PDF download failed");
                    metrics.record_error(format!("{}: PDF 다운로드 실패", record.company));
                }
                Err(ItemError::Analysis(e)) => {
                    let (sheet_note, summary_line) = match &e {
                        AnalyzerError::NoInput => ("PDF 텍스트 추출 실패".to_string(), format!("{}: PDF 추출 실패", record.company)),
                        other => (
                            format!("{} 분석 실패: {}", analyzer.provider_name(), truncate(&other.to_string(), 80)),
                            format!("{}: {} 분석 실패", record.company, analyzer.provider_name()),
                        ),
                    };
                    metrics.record_error(summary_line);

                    if !matches!(e, AnalyzerError::NoInput) && breaker.record_failure(&e.to_string()) {
                        error!(provider = analyzer.provider_name(), "API quota looks exhausted, stopping analysis for this run");
                        metrics.mark_quota_exhausted();
                        break;
                    }
                    if e.is_rate_limit() {
                        debug!(acptno = %record.acptno, "Rate limited; left pending");
                        continue;
                    }
                    if !options.dry_run {
                        self.save_error(&record, &sheet_note, &framework).await;
                    }
                }
            }
        }

        let breaker_stats = breaker.snapshot();
        info!(
            provider = %breaker_stats.name,
            state = %breaker_stats.state,
            successes = breaker_stats.total_successes,
            failures = breaker_stats.total_failures,
            secs_since_trip = ?breaker_stats.secs_since_trip,
            last_error = ?breaker_stats.last_error,
            "Quota breaker stats"
        );
        if let Some((requests, tokens)) = analyzer.budget_usage() {
            info!(requests, tokens, "Per-minute budget, current window");
        }

        if !options.dry_run {
            if let Err(e) = self.ledger.update_estimated_tokens(&estimates).await {
                warn!(error = %e, "Token estimates not written");
            }
        }

        match self.ledger.analysis_summary().await {
            Ok(counts) => info!(completed = counts.completed, error = counts.error, total = counts.total, "전체 분석 현황"),
            Err(e) => debug!(error = %e, "Analysis summary unavailable"),
        }
    }

    async fn analyze_one(
        &self,
        analyzer: &StructuredAnalyzer,
        record: &DisclosureRecord,
        framework: &Framework,
        estimates: &mut Vec<(String, u64)>,
    ) -> Result<AnalysisResult, ItemError> {
        let bytes = self.retriever.fetch_document(record).await.map_err(ItemError::Download)?;
        let document = extractor::extract_async(bytes.clone()).await;
        let tokens = document.estimated_tokens();
        info!(
            chars = document.char_count(),
            pages = ?document.page_count,
            method = ?document.method,
            tokens,
            "Text extracted"
        );
        estimates.push((record.acptno.clone(), tokens));

        let input = AnalysisInput {
            company: &record.company,
            text: &document.text,
            document: Some(&bytes),
            estimated_tokens: tokens,
        };
        let outcome = analyzer.analyze(input, framework).await.map_err(ItemError::Analysis)?;
        debug!(modality = %outcome.modality, "Analysis modality used");
        Ok(outcome.result)
    }

    async fn save_result(&self, record: &DisclosureRecord, result: &AnalysisResult, framework: &Framework, metrics: &RunMetrics) {
        let analyzed_at = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        if let Err(e) = self.ledger.record_analysis(record, result, framework, &analyzed_at).await {
            error!(acptno = %record.acptno, error = %e, "Saving analysis failed");
            metrics.record_error(format!("{}: 저장 실패", record.company));
            return;
        }

        let company_sheet_url = match self.companies.add_result(record, result, framework).await {
            Ok(url) => url,
            Err(e) => {
                warn!(company = %record.company, error = %e, "Company workbook not updated");
                String::new()
            }
        };

        let meta = AnalysisMeta {
            status: AnalysisStatus::Completed,
            analyzed_at,
            items_mentioned: result.summary.total_items_mentioned,
            core_mentioned: result.summary.core_items_mentioned,
            company_sheet_url,
        };
        if let Err(e) = self.ledger.update_analysis_meta(&record.acptno, &meta).await {
            warn!(acptno = %record.acptno, error = %e, "List sheet meta not updated");
        }
        metrics.increment_analyzed();
    }

    async fn save_error(&self, record: &DisclosureRecord, message: &str, framework: &Framework) {
        let analyzed_at = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
        if let Err(e) = self.ledger.record_error(record, message, framework, &analyzed_at).await {
            warn!(acptno = %record.acptno, error = %e, "Error row not written");
            return;
        }
        let meta = AnalysisMeta {
            status: AnalysisStatus::Error,
            analyzed_at,
            items_mentioned: 0,
            core_mentioned: 0,
            company_sheet_url: String::new(),
        };
        if let Err(e) = self.ledger.update_analysis_meta(&record.acptno, &meta).await {
            warn!(acptno = %record.acptno, error = %e, "List sheet meta not updated");
        }
    }
}

/// `{YYYYMMDD}_{company}_{acptno}.pdf`, company stripped of punctuation.
pub fn pdf_file_name(record: &DisclosureRecord) -> String {
    let date: String = record.disclosed_at.chars().filter(char::is_ascii_digit).take(8).collect();
    let company = FILENAME_NOISE.replace_all(&record.company, "");
    format!("{}_{}_{}.pdf", date, company, record.acptno)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
