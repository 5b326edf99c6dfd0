// =============================================================================
// config.rs - EVERY KNOB IN ONE PLACE
// =============================================================================
//
// All values come from the environment (optionally seeded from a .env file)
// with defaults that work against the real KIND, Anthropic, Gemini, Google
// and Telegram endpoints. Endpoint overrides exist so tests can point the
// clients at a local mock server.
//
// CLI flags (days, period, pages, items, dry-run) live in cli.rs; they also
// read their own env vars through clap.
// =============================================================================

use std::env;
use std::fmt;
use std::time::Duration;

/// Which hosted model the analysis phase talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Claude,
    Gemini,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Claude => write!(f, "claude"),
            ProviderKind::Gemini => write!(f, "gemini"),
        }
    }
}

/// OAuth2 user-flow triplet for writing into a personal Drive.
#[derive(Clone)]
pub struct OAuthTriplet {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl fmt::Debug for OAuthTriplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTriplet")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("refresh_token", &"***")
            .finish()
    }
}

#[derive(Clone)]
pub struct Config {
    // =========================================================================
    // CREDENTIALS AND TARGETS
    // =========================================================================
    /// Service account JSON (GOOGLE_SERVICE).
    pub google_service_json: Option<String>,
    pub oauth: Option<OAuthTriplet>,
    /// Main spreadsheet holding the list, analysis and Framework sheets.
    pub spreadsheet_id: Option<String>,
    /// Parent folder for the ValueUp_analysis company workbooks.
    pub archive_folder_id: Option<String>,
    /// Folder for raw PDF uploads.
    pub pdf_folder_id: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub github_output: Option<String>,

    // =========================================================================
    // ENDPOINTS
    // =========================================================================
    pub krx_base_url: String,
    pub krx_stock_api_url: String,
    pub claude_api_url: String,
    pub gemini_api_url: String,
    pub sheets_api_url: String,
    pub drive_api_url: String,
    pub drive_upload_url: String,
    pub google_token_url: String,
    pub telegram_api_url: String,

    // =========================================================================
    // HTTP BEHAVIOUR
    // =========================================================================
    pub http_timeout: Duration,
    pub user_agent: String,
    /// Rows per list page requested from KIND.
    pub list_page_size: u32,
    /// Pause between KIND requests (pages, viewer, downloads).
    pub request_delay: Duration,
    pub min_pdf_bytes: usize,

    // =========================================================================
    // ANALYSIS
    // =========================================================================
    pub provider: ProviderKind,
    pub claude_model: String,
    pub gemini_model: String,
    pub max_retries: u32,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub max_consecutive_failures: u32,
    /// Pause between analysed items (API_REQUEST_WAIT).
    pub item_delay: Duration,

    // =========================================================================
    // NOTIFICATIONS AND LOGGING
    // =========================================================================
    pub telegram_chunk_delay: Duration,
    pub log_json: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("spreadsheet_id", &self.spreadsheet_id)
            .field("archive_folder_id", &self.archive_folder_id)
            .field("pdf_folder_id", &self.pdf_folder_id)
            .field("oauth", &self.oauth)
            .field("krx_base_url", &self.krx_base_url)
            .field("provider", &self.provider)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("tokens_per_minute", &self.tokens_per_minute)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from the environment, seeding it from `.env` when
    /// one exists.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let anthropic_api_key = env_opt("ANT_ANALYTIC");
        let gemini_api_key = env_opt("GEM_ANALYTIC");

        let provider = match env_or_default("ANALYSIS_PROVIDER", "").to_lowercase().as_str() {
            "gemini" => ProviderKind::Gemini,
            "claude" => ProviderKind::Claude,
            _ if anthropic_api_key.is_none() && gemini_api_key.is_some() => ProviderKind::Gemini,
            _ => ProviderKind::Claude,
        };

        let oauth = match (
            env_opt("GDRIVE_CLIENT_ID"),
            env_opt("GDRIVE_CLIENT_SECRET"),
            env_opt("GDRIVE_REFRESH_TOKEN"),
        ) {
            (Some(client_id), Some(client_secret), Some(refresh_token)) => Some(OAuthTriplet {
                client_id,
                client_secret,
                refresh_token,
            }),
            _ => None,
        };

        Config {
            google_service_json: env_opt("GOOGLE_SERVICE"),
            oauth,
            spreadsheet_id: env_opt("VALUEUP_GSPREAD_ID"),
            archive_folder_id: env_opt("VALUEUP_ARCHIVE_ID"),
            pdf_folder_id: env_opt("GDRIVE_FOLDER_ID"),
            anthropic_api_key,
            gemini_api_key,
            telegram_token: env_opt("TELEGRAM_TOKEN"),
            telegram_chat_id: env_opt("CHAT_ID"),
            github_output: env_opt("GITHUB_OUTPUT"),

            krx_base_url: env_or_default("VALUEUP_KRX_BASE_URL", "https://kind.krx.co.kr"),
            krx_stock_api_url: env_or_default(
                "VALUEUP_KRX_STOCK_API_URL",
                "http://data.krx.co.kr/comm/bldAttendant/getJsonData.cmd",
            ),
            claude_api_url: env_or_default("VALUEUP_CLAUDE_URL", "https://api.anthropic.com/v1/messages"),
            gemini_api_url: env_or_default(
                "VALUEUP_GEMINI_URL",
                "https://generativelanguage.googleapis.com/v1beta/models",
            ),
            sheets_api_url: env_or_default("VALUEUP_SHEETS_URL", "https://sheets.googleapis.com/v4/spreadsheets"),
            drive_api_url: env_or_default("VALUEUP_DRIVE_URL", "https://www.googleapis.com/drive/v3"),
            drive_upload_url: env_or_default(
                "VALUEUP_DRIVE_UPLOAD_URL",
                "https://www.googleapis.com/upload/drive/v3/files",
            ),
            google_token_url: env_or_default("VALUEUP_GOOGLE_TOKEN_URL", "https://oauth2.googleapis.com/token"),
            telegram_api_url: env_or_default("VALUEUP_TELEGRAM_URL", "https://api.telegram.org"),

            http_timeout: Duration::from_secs(
                env_or_default("VALUEUP_HTTP_TIMEOUT_SECS", "60").parse().unwrap_or(60),
            ),
            user_agent: env_or_default(
                "VALUEUP_USER_AGENT",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            ),
            list_page_size: env_or_default("VALUEUP_PAGE_SIZE", "15").parse().unwrap_or(15),
            request_delay: Duration::from_millis(
                env_or_default("VALUEUP_REQUEST_DELAY_MS", "2000").parse().unwrap_or(2000),
            ),
            min_pdf_bytes: env_or_default("VALUEUP_MIN_PDF_BYTES", "1024").parse().unwrap_or(1024),

            provider,
            claude_model: env_or_default("ANALYSIS_CLAUDE_MODEL", "claude-3-5-haiku-20241022"),
            gemini_model: env_or_default("ANALYSIS_GEMINI_MODEL", "gemini-2.0-flash"),
            max_retries: env_or_default("MAX_RETRIES", "3").parse().unwrap_or(3),
            requests_per_minute: env_or_default("ANALYSIS_RPM_LIMIT", "50").parse().unwrap_or(50),
            tokens_per_minute: env_or_default("ANALYSIS_TPM_LIMIT", "50000").parse().unwrap_or(50_000),
            max_consecutive_failures: env_or_default("ANALYSIS_MAX_CONSECUTIVE_FAILURES", "3")
                .parse()
                .unwrap_or(3),
            item_delay: Duration::from_secs(env_or_default("API_REQUEST_WAIT", "2").parse().unwrap_or(2)),

            telegram_chunk_delay: Duration::from_millis(
                env_or_default("TELEGRAM_CHUNK_DELAY_MS", "1000").parse().unwrap_or(1000),
            ),
            log_json: env_flag("VALUEUP_LOG_JSON"),
        }
    }

    /// API key for whichever provider is active.
    pub fn provider_api_key(&self) -> Option<&str> {
        match self.provider {
            ProviderKind::Claude => self.anthropic_api_key.as_deref(),
            ProviderKind::Gemini => self.gemini_api_key.as_deref(),
        }
    }

    pub fn provider_key_var(&self) -> &'static str {
        match self.provider {
            ProviderKind::Claude => "ANT_ANALYTIC",
            ProviderKind::Gemini => "GEM_ANALYTIC",
        }
    }

    /// Names of required variables that are missing. `needs_analyzer` is
    /// false for monitor-only runs.
    pub fn missing_required(&self, needs_analyzer: bool) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.google_service_json.is_none() && self.oauth.is_none() {
            missing.push("GOOGLE_SERVICE");
        }
        if self.spreadsheet_id.is_none() {
            missing.push("VALUEUP_GSPREAD_ID");
        }
        if needs_analyzer && self.provider_api_key().is_none() {
            missing.push(self.provider_key_var());
        }
        missing
    }

    /// One client for the whole run. The cookie store matters for KIND, which
    /// ties the viewer page and the PDF download to the same session.
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.http_timeout)
            .user_agent(&self.user_agent)
            .cookie_store(true)
            .build()
    }

    /// Service account email for the startup log, without leaking the key.
    pub fn service_account_email(&self) -> String {
        match &self.google_service_json {
            Some(raw) => serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .and_then(|v| v.get("client_email").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| "(unparseable GOOGLE_SERVICE)".to_string()),
            None => "(GOOGLE_SERVICE not set)".to_string(),
        }
    }

    /// A config with every endpoint pointed at `base` and no waiting.
    #[cfg(test)]
    pub fn for_tests(base: &str) -> Self {
        Config {
            google_service_json: None,
            oauth: None,
            spreadsheet_id: Some("sheet-main".into()),
            archive_folder_id: Some("folder-archive".into()),
            pdf_folder_id: None,
            anthropic_api_key: Some("test-anthropic".into()),
            gemini_api_key: Some("test-gemini".into()),
            telegram_token: None,
            telegram_chat_id: None,
            github_output: None,
            krx_base_url: base.to_string(),
            krx_stock_api_url: format!("{}/comm/bldAttendant/getJsonData.cmd", base),
            claude_api_url: format!("{}/v1/messages", base),
            gemini_api_url: format!("{}/v1beta/models", base),
            sheets_api_url: format!("{}/v4/spreadsheets", base),
            drive_api_url: format!("{}/drive/v3", base),
            drive_upload_url: format!("{}/upload/drive/v3/files", base),
            google_token_url: format!("{}/token", base),
            telegram_api_url: base.to_string(),
            http_timeout: Duration::from_secs(5),
            user_agent: "valueup-test".into(),
            list_page_size: 15,
            request_delay: Duration::ZERO,
            min_pdf_bytes: 16,
            provider: ProviderKind::Claude,
            claude_model: "claude-3-5-haiku-20241022".into(),
            gemini_model: "gemini-2.0-flash".into(),
            max_retries: 3,
            requests_per_minute: 50,
            tokens_per_minute: 50_000,
            max_consecutive_failures: 3,
            item_delay: Duration::ZERO,
            telegram_chunk_delay: Duration::ZERO,
            log_json: false,
        }
    }
}

/// Read an environment variable with a default fallback.
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Unset and blank are the same thing for credentials.
fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_flag(key: &str) -> bool {
    matches!(env_or_default(key, "").to_lowercase().as_str(), "1" | "true" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_required_lists_provider_key_only_when_analyzing() {
        let mut config = Config::for_tests("http://localhost");
        config.anthropic_api_key = None;
        config.google_service_json = Some("{}".into());

        assert_eq!(config.missing_required(true), vec!["ANT_ANALYTIC"]);
        assert!(config.missing_required(false).is_empty());
    }

    #[test]
    fn test_oauth_triplet_satisfies_google_credentials() {
        let mut config = Config::for_tests("http://localhost");
        config.oauth = Some(OAuthTriplet {
            client_id: "id".into(),
            client_secret: "csecret-value".into(),
            refresh_token: "rtoken-value".into(),
        });
        assert!(config.missing_required(true).is_empty());

        let debug = format!("{:?}", config);
        assert!(!debug.contains("csecret-value"));
        assert!(!debug.contains("rtoken-value"));
        assert!(debug.contains("client_secret: \"***\""));
    }

    #[test]
    fn test_service_account_email_is_extracted() {
        let mut config = Config::for_tests("http://localhost");
        config.google_service_json = Some(r#"{"client_email":"bot@proj.iam.gserviceaccount.com"}"#.into());
        assert_eq!(config.service_account_email(), "bot@proj.iam.gserviceaccount.com");
        config.google_service_json = Some("not json".into());
        assert_eq!(config.service_account_email(), "(unparseable GOOGLE_SERVICE)");
    }
}
