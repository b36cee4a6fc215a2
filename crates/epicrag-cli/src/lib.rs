//! Configuration and logging setup for the `epicrag` binary.

pub mod config;
pub mod observability;
