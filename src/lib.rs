//! Job tracker: turns job-application emails into a mirrored status sheet.

pub mod config;
pub mod error;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod sync;
