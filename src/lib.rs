//! Scout referral attribution and escrow orchestration.
//!
//! A scout shares a talent link; the visitor's referral is captured in the
//! session, bound to the client/talent pair at the talent's advertised
//! commission when the client connects, and that locked commission travels
//! into the escrow engagement created and funded on-chain.

pub mod chain;
pub mod config;
pub mod contracts;
pub mod error;
pub mod escrow;
pub mod identity;
pub mod ledger;
pub mod market;
pub mod rate_limit;
pub mod session;
pub mod store;

pub use error::Failure;
pub use market::{EngagementRequest, Marketplace};
