//! Data models for brokerage API payloads
//!
//! Only the fields the CLI prints are typed; everything else is kept in
//! `extra` so nothing is lost when a payload is re-serialized.

mod account;
mod order;
mod quote;

pub use account::*;
pub use order::*;
pub use quote::*;
