pub mod approval;
pub mod classifier;
pub mod codefix;
pub mod command;
pub mod config;
pub mod db;
pub mod executor;
pub mod health;
pub mod notify;
pub mod orchestrator;
pub mod rules;
pub mod telegram;
pub mod types;
pub mod verifier;

pub use types::*;
