//! Multi-period spend ledger with up-front reservations.
//!
//! A fix reserves its tier's conservative estimate before any costed call
//! and settles the actual cost on every exit path. Daily, weekly and monthly
//! periods are charged together and reset on UTC boundaries.

mod ledger;
mod store;

pub use ledger::{BudgetLedger, BudgetPeriod, BudgetPeriods, LEDGER_VERSION, LedgerConfig, PeriodKind};
pub use store::{
    BudgetCheck, BudgetStore, PeriodRemaining, RefundRequest, ReservationRequest,
    ReservationResult, ThresholdAlert,
};
