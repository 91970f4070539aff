//! Replix CLI - replicate one request across a node cluster
//!
//! This crate provides:
//! - Command line parsing and configuration loading
//! - Logging initialization for the `replix` binary

pub mod cli;
pub mod startup;

pub use cli::Cli;
