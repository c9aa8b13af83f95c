pub mod accumulator;
pub mod cli;
pub mod completion;
pub mod config;
pub mod constants;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod pipeline;
pub mod redaction_layer;
pub mod retrieval;
pub mod server;
pub mod specs;
pub mod sse;
pub mod str_utils;
pub mod supervisor;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
