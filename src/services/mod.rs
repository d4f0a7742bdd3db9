pub mod brackets;
pub mod fees;
pub mod ledger_store;
pub mod price_cache;
pub mod session;
pub mod trading;

pub use brackets::{validate_brackets, validate_order, ValidationError};
pub use fees::{notional, FeeSchedule, OrderCost, BALANCE_EPSILON};
pub use ledger_store::LedgerStore;
pub use price_cache::MarkCache;
pub use session::{CandleBuilder, CandleReport, EngineError, ReconcileOutcome, TradingSession};
pub use trading::{TradingError, TradingService};
