//! Signal source: API client and wire types.

mod signal_client;
mod types;

pub use signal_client::{SignalBatch, SignalClient, SignalSource, TraderPair};
