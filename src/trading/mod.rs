//! Copy-trade decision pipeline: classify, size, risk-check, route, plus
//! the paper ledger and the stop-loss and settlement sweeps.

mod classifier;
mod config;
mod dedup;
mod paper;
mod position_sizer;
mod risk;
mod router;
mod settlement;
mod stop_loss;

pub use classifier::{classify, SkipReason};
pub use config::{validate_wallet, CopyConfig, MIN_POLL_INTERVAL_MS};
pub use dedup::{Deduplicator, PollBatch, SeenSet};
pub use paper::{
    HistoryEntry, HistoryKind, PaperError, PaperFill, PaperLedger, PaperPosition, PaperStats,
    PositionMeta,
};
pub use position_sizer::{PositionSizer, SizedOrder, SizingContext, SizingSkip};
pub use risk::{ExposureSnapshot, RiskCheck, RiskReason, RiskRejection};
pub use router::{ExecutionMode, ExecutionOutcome, ExecutionRouter};
pub use settlement::{wrong_token_suspected, BuyHistory, BuyRecord, Settlement, SettlementChecker};
pub use stop_loss::{StopLossBook, StopLossExit, StopLossMonitor, StopLossRules};
