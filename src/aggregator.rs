//! Round aggregation.
//!
//! Replies are tagged with the round they were sent in. The aggregator keeps
//! one [`RoundTable`] for the open round; a boundary closes it, feeds the
//! outcomes to the statistics, and hands a [`RoundRecord`] to persistence.
//! Replies for a closed round are discarded.

mod engine;
mod round;

pub use engine::{
    AggregatorCounters, ExitReason, ReplyDisposition, ResultAggregator, RoundRecord,
};
pub use round::{Outcome, RoundTable, Slot};
