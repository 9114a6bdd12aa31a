//! hardenctl - apply, verify and remove Windows hardening policies
//!
//! - `engine`: policy units, strategies, catalogs and bulk runs
//! - `units`: category-specific units and registrations
//! - `cli`, `config`, `paths`, `audit`, `concurrency`: the command-line front end

pub mod audit;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod paths;
pub mod units;

pub use config::Config;
