//! Account Generator Service
//!
//! JSON-RPC front door for the account generation library. Exposes
//! `eth_generateAccount` at the root and a plain-text liveness probe at
//! `/upcheck`.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod handlers;
pub mod rpc;
pub mod server;

pub use server::{create_router, run};
