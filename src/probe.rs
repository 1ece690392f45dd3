//! Probing layer.
//!
//! A [`Prober`] runs on its own task and reports through a [`ProbeSink`]:
//! replies on one channel, round boundaries and its own exit on another, so
//! the aggregator can give boundaries priority.
//!
//! - [`IcmpProber`]: ICMP echo rounds via `surge-ping`
//! - [`ProberHandle`]: spawn, stop, and await a prober task

mod icmp;
mod traits;

pub use icmp::IcmpProber;
pub use traits::{
    Boundary, ProbeSink, ProbeStreams, Prober, ProberError, ProberHandle, Reply, SinkClosed,
    probe_channels,
};
