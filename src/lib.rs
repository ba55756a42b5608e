//! Governance risk scoring for open-source packages.
//!
//! Combines local git history, forge metadata, and registry metadata into a
//! deterministic 0-100 risk score tuned for maintainer-governance failure
//! modes: abandonment, concentration, frustration, and stealth takeover.
pub mod aggregate;
pub mod cache;
pub mod config;
pub mod error;
pub mod forge;
pub mod gitcollect;
pub mod identity;
pub mod orchestrator;
pub mod ratelimit;
pub mod registry;
pub mod reputation;
pub mod scoring;
pub mod sentiment;
pub mod style;
pub mod types;

// Re-export commonly used types
pub use config::{OssuaryConfig, ScoreConfig};
pub use error::{OssuaryError, Result};
pub use orchestrator::Orchestrator;
pub use types::{Ecosystem, RiskLevel, Score};
