//! smsgate - SMS gateway daemons
//!
//! A supervisor keeps one worker process per phone line alive, plus a sender
//! for scheduled messages and a webhook dispatcher. Phone workers talk to
//! their carrier through pluggable adapters.

pub mod adapter;
pub mod channel;
pub mod config;
pub mod daemon;
pub mod error;
pub mod health;
pub mod number;
pub mod phone;
pub mod pidfile;
pub mod registry;
pub mod sender;
pub mod store;
pub mod supervisor;
pub mod test_adapter;
pub mod webhook;

pub use error::{Error, Result};
