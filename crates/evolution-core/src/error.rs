use thiserror::Error;

/// Errors surfaced by market-data providers and the gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarketDataError {
    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("unknown symbol: {0}")]
    SymbolUnknown(String),

    #[error("{provider} unavailable: {message}")]
    UpstreamUnavailable { provider: String, message: String },

    #[error("window too large: {requested_bars} bars requested (max {max_bars})")]
    WindowTooLarge { requested_bars: u64, max_bars: u64 },
}

impl MarketDataError {
    /// Failover moves to the next provider only for these two kinds.
    pub fn triggers_failover(&self) -> bool {
        matches!(
            self,
            MarketDataError::RateLimited { .. } | MarketDataError::UpstreamUnavailable { .. }
        )
    }
}

/// Typed failure modes of a backtest run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BacktestError {
    #[error("insufficient bars in {segment} segment: {have} < {need}")]
    InsufficientBars {
        segment: &'static str,
        have: usize,
        need: usize,
    },

    #[error("data gap fraction {fraction:.3} exceeds limit {limit:.3} for {symbol}")]
    DataGapExceedsThreshold {
        symbol: String,
        fraction: f64,
        limit: f64,
    },

    #[error("backtest timed out after {limit_seconds}s")]
    Timeout { limit_seconds: u64 },

    #[error("backtest cancelled")]
    Cancelled,

    #[error("malformed rule set: {0}")]
    MalformedRuleSet(String),

    #[error(transparent)]
    MarketData(#[from] MarketDataError),
}

impl BacktestError {
    /// Transient upstream failures: no state change, retried next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BacktestError::Timeout { .. }
                | BacktestError::Cancelled
                | BacktestError::MarketData(MarketDataError::RateLimited { .. })
                | BacktestError::MarketData(MarketDataError::UpstreamUnavailable { .. })
        )
    }

    /// Data-quality failures: attempts accrue and eventually discard.
    /// Unknown symbols and oversized windows behave the same way; retrying
    /// them without intervention cannot succeed.
    pub fn is_data_quality(&self) -> bool {
        matches!(
            self,
            BacktestError::InsufficientBars { .. }
                | BacktestError::DataGapExceedsThreshold { .. }
                | BacktestError::MarketData(MarketDataError::SymbolUnknown(_))
                | BacktestError::MarketData(MarketDataError::WindowTooLarge { .. })
        )
    }

    /// Logic errors are fatal for the strategy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BacktestError::MalformedRuleSet(_))
    }
}
