// =============================================================================
// cli.rs - FLAGS
// =============================================================================
//
// Every flag has an environment twin so the scheduled workflow can drive
// the binary without touching its command line.
// =============================================================================

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};

use crate::models::{ListWindow, PeriodBucket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    /// Collect new disclosures and archive their PDFs.
    Monitor,
    /// Analyse disclosures already in the sheet.
    Analyze,
    /// Monitor, then analyse.
    All,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "valueup_engine")]
#[command(about = "KRX 밸류업 공시 수집 및 분석", long_about = None)]
#[command(version)]
pub struct Cli {
    /// 조회 기간 (일). Also bounds which rows are pending for analysis.
    #[arg(long, env = "VALUEUP_DAYS", default_value_t = 7)]
    pub days: u32,

    /// 조회 기간 버튼 (1주, 1개월, 3개월, 6개월, 1년, 2년, 3년, 전체). Overrides --days for listing.
    #[arg(long, env = "VALUEUP_PERIOD")]
    pub period: Option<PeriodBucket>,

    /// 최대 페이지 수
    #[arg(long, env = "VALUEUP_MAX_PAGES", default_value_t = 10)]
    pub max_pages: u32,

    /// 분석할 최대 공시 수
    #[arg(long, env = "ANALYSIS_MAX_ITEMS", default_value_t = 10)]
    pub max_items: usize,

    /// 분석은 하되 시트에 저장하지 않음
    #[arg(long, env = "ANALYSIS_DRY_RUN", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub dry_run: bool,

    #[arg(long, env = "VALUEUP_MODE", value_enum, default_value_t = RunMode::All)]
    pub mode: RunMode,

    /// PDF를 Drive에 올리지 않음
    #[arg(long, env = "VALUEUP_SKIP_PDF", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub skip_pdf: bool,
}

impl Cli {
    pub fn window(&self) -> ListWindow {
        match self.period {
            Some(period) => ListWindow::Period(period),
            None => ListWindow::Days(self.days),
        }
    }

    pub fn runs_monitor(&self) -> bool {
        matches!(self.mode, RunMode::Monitor | RunMode::All)
    }

    pub fn runs_analysis(&self) -> bool {
        matches!(self.mode, RunMode::Analyze | RunMode::All)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["valueup_engine"]).unwrap();
        assert_eq!(cli.days, 7);
        assert_eq!(cli.max_pages, 10);
        assert_eq!(cli.max_items, 10);
        assert!(!cli.dry_run);
        assert_eq!(cli.mode, RunMode::All);
        assert_eq!(cli.window(), ListWindow::Days(7));
        assert!(cli.runs_monitor() && cli.runs_analysis());
    }

    #[test]
    fn test_period_overrides_days() {
        let cli = Cli::try_parse_from(["valueup_engine", "--days", "30", "--period", "3개월"]).unwrap();
        assert_eq!(cli.window(), ListWindow::Period(PeriodBucket::ThreeMonths));
        assert_eq!(cli.days, 30);
    }

    #[test]
    fn test_mode_and_flags() {
        let cli = Cli::try_parse_from(["valueup_engine", "--mode", "monitor", "--skip-pdf", "--dry-run"]).unwrap();
        assert!(cli.runs_monitor());
        assert!(!cli.runs_analysis());
        assert!(cli.skip_pdf && cli.dry_run);
    }

    #[test]
    fn test_unknown_period_is_rejected() {
        assert!(Cli::try_parse_from(["valueup_engine", "--period", "2주"]).is_err());
    }
}
