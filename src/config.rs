// =============================================================================
// Engine Configuration — environment-driven settings validated at startup
// =============================================================================
//
// Every tunable the engine reads from the environment lives here. Validation
// happens once, before any task is spawned; a bad value is a fatal startup
// error and the process never dies of configuration mid-run.
//
// Exit-code contract (mapped in main.rs):
//   1 — config validation failure
//   2 — history store unreachable at startup
// =============================================================================

use tracing::info;

use crate::types::{normalize_symbol, EngineMode};

/// Error that aborts startup with exit code 1. A dedicated type (rather than
/// `anyhow::Error`) so main.rs can pick the exit code without string matching.
#[derive(Debug)]
pub struct ConfigValidationError(pub String);

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigValidationError {}

/// Credentials for the KuCoin REST API, required only in LIVE mode.
#[derive(Debug, Clone)]
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

/// Fully validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Optional DB connection string. `sqlite:` URLs select the SQLite-backed
    /// history store; absent means JSONL journals under `data_dir`.
    pub database_url: Option<String>,
    /// Port the HTTP façade binds to.
    pub backend_port: u16,
    /// Allowed CORS origin for the façade (`*` when unset).
    pub cors_origin: Option<String>,
    pub mode: EngineMode,
    /// Whether the scheduler auto-executes paper trades on signals.
    pub auto_paper: bool,
    /// Confidence floor below which signals are not executed.
    pub confidence_threshold: f64,
    /// Symbols under evaluation, normalized to the dashed convention.
    pub symbols: Vec<String>,
    /// Candle interval driving evaluations.
    pub timeframe: String,
    /// Age beyond which cached bars are considered stale and evaluation skips.
    pub stale_data_ms: i64,
    /// Minimum net edge required by the arbitrage scanner.
    pub min_expected_edge: f64,
    /// Per-position cap as a fraction of equity.
    pub max_position_size_pct: f64,
    /// Total exposure cap as a fraction of equity.
    pub max_exposure_pct: f64,
    pub paper_slippage_bps: f64,
    pub paper_fee_bps: f64,
    /// Mark-price / auto-exit scan period.
    pub loop_ms: u64,
    /// Directory for JSONL journals and durable strategy state.
    pub data_dir: String,
    /// KuCoin credentials; `Some` iff mode is LIVE.
    pub credentials: Option<VenueCredentials>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigValidationError> {
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigValidationError(format!("invalid value for {name}: '{raw}'"))),
        None => Ok(default),
    }
}

impl EngineConfig {
    /// Read and validate the full configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigValidationError> {
        let mode: EngineMode = match env_var("ENGINE_MODE") {
            Some(raw) => raw.parse().map_err(ConfigValidationError)?,
            None => EngineMode::Paper,
        };

        let credentials = match mode {
            EngineMode::Paper => None,
            EngineMode::Live => {
                let api_key = env_var("KUCOIN_API_KEY");
                let api_secret = env_var("KUCOIN_API_SECRET");
                let api_passphrase = env_var("KUCOIN_API_PASSPHRASE");
                match (api_key, api_secret, api_passphrase) {
                    (Some(api_key), Some(api_secret), Some(api_passphrase)) => {
                        Some(VenueCredentials {
                            api_key,
                            api_secret,
                            api_passphrase,
                        })
                    }
                    _ => {
                        return Err(ConfigValidationError(
                            "LIVE mode requires KUCOIN_API_KEY, KUCOIN_API_SECRET and \
                             KUCOIN_API_PASSPHRASE"
                                .to_string(),
                        ))
                    }
                }
            }
        };

        let symbols: Vec<String> = env_var("ENGINE_SYMBOL")
            .unwrap_or_else(|| "BTC-USDT".to_string())
            .split(',')
            .map(normalize_symbol)
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            return Err(ConfigValidationError(
                "ENGINE_SYMBOL resolved to an empty symbol list".to_string(),
            ));
        }

        let confidence_threshold: f64 = parse_env("CONFIDENCE_THRESHOLD", 0.6)?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ConfigValidationError(format!(
                "CONFIDENCE_THRESHOLD must be within [0, 1], got {confidence_threshold}"
            )));
        }

        let timeframe = env_var("BOT_TIMEFRAME").unwrap_or_else(|| "1h".to_string());
        if !matches!(timeframe.as_str(), "1m" | "5m" | "15m" | "1h" | "4h" | "1d") {
            return Err(ConfigValidationError(format!(
                "BOT_TIMEFRAME '{timeframe}' is not a supported interval"
            )));
        }

        let stale_data_ms: i64 = parse_env("BOT_STALE_DATA_MS", 7_200_000)?;
        let max_position_size_pct: f64 = parse_env("BOT_MAX_POSITION_SIZE_PCT", 0.25)?;
        let max_exposure_pct: f64 = parse_env("BOT_MAX_EXPOSURE_PCT", 0.7)?;
        for (name, v) in [
            ("BOT_MAX_POSITION_SIZE_PCT", max_position_size_pct),
            ("BOT_MAX_EXPOSURE_PCT", max_exposure_pct),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigValidationError(format!(
                    "{name} must be a fraction within [0, 1], got {v}"
                )));
            }
        }

        let config = Self {
            database_url: env_var("DATABASE_URL"),
            backend_port: parse_env("BACKEND_PORT", 3001_u16)?,
            cors_origin: env_var("CORS_ORIGIN"),
            mode,
            auto_paper: parse_env("AUTO_PAPER", true)?,
            confidence_threshold,
            symbols,
            timeframe,
            stale_data_ms,
            min_expected_edge: parse_env("BOT_MIN_EXPECTED_EDGE", 5e-4)?,
            max_position_size_pct,
            max_exposure_pct,
            paper_slippage_bps: parse_env("BOT_PAPER_SLIPPAGE_BPS", 4.0)?,
            paper_fee_bps: parse_env("BOT_PAPER_FEE_BPS", 10.0)?,
            loop_ms: parse_env("BOT_LOOP_MS", 15_000_u64)?,
            data_dir: env_var("ENGINE_DATA_DIR").unwrap_or_else(|| "data".to_string()),
            credentials,
        };

        info!(
            mode = %config.mode,
            symbols = ?config.symbols,
            timeframe = %config.timeframe,
            auto_paper = config.auto_paper,
            confidence_threshold = config.confidence_threshold,
            "engine config validated"
        );

        Ok(config)
    }

    /// Paper fee rate as a fraction (bps / 10_000).
    pub fn fee_rate(&self) -> f64 {
        self.paper_fee_bps / 10_000.0
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            backend_port: 3001,
            cors_origin: None,
            mode: EngineMode::Paper,
            auto_paper: true,
            confidence_threshold: 0.6,
            symbols: vec!["BTC-USDT".to_string()],
            timeframe: "1h".to_string(),
            stale_data_ms: 7_200_000,
            min_expected_edge: 5e-4,
            max_position_size_pct: 0.25,
            max_exposure_pct: 0.7,
            paper_slippage_bps: 4.0,
            paper_fee_bps: 10.0,
            loop_ms: 15_000,
            data_dir: "data".to_string(),
            credentials: None,
        }
    }
}
