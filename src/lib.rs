//! agentwatch - activity tracker for coding-agent transcripts

mod event;

pub use event::*;

pub mod activity;
pub mod agent;
pub mod config;
pub mod record;
pub mod registry;
pub mod scanner;
pub mod tailer;
pub mod timers;
pub mod tool_status;
pub mod worker;
