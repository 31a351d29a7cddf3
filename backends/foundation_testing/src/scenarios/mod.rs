//! Reusable multi-worker scenarios built on the synckit primitives.
//!
//! - [`TransferStorm`]: opposite-direction transfers over shared accounts.
//! - [`RendezvousCrowd`]: many waiters, racing signallers, late arrivals.

pub mod rendezvous_crowd;
pub mod transfer_storm;

pub use rendezvous_crowd::{CrowdReport, RendezvousCrowd};
pub use transfer_storm::{TransferReport, TransferStorm};
