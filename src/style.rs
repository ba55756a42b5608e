//! Terminal styling utilities for consistent CLI output.
//!
//! Respects `NO_COLOR` and terminal capabilities.

use std::sync::OnceLock;

use owo_colors::OwoColorize;

use crate::types::RiskLevel;

/// Whether color output is enabled (cached on first call).
static COLOR_ENABLED: OnceLock<bool> = OnceLock::new();

/// Check if colors should be used.
pub fn colors_enabled() -> bool {
   *COLOR_ENABLED.get_or_init(|| {
      // NO_COLOR takes precedence (https://no-color.org/)
      if std::env::var("NO_COLOR").is_ok() {
         return false;
      }
      supports_color::on(supports_color::Stream::Stdout).is_some_and(|level| level.has_basic)
   })
}

/// Success: completed actions (green + bold).
pub fn success(s: &str) -> String {
   if colors_enabled() {
      s.green().bold().to_string()
   } else {
      s.to_string()
   }
}

/// Warning: degraded results, retries (yellow).
pub fn warning(s: &str) -> String {
   if colors_enabled() {
      s.yellow().to_string()
   } else {
      s.to_string()
   }
}

/// Error: failures (red + bold).
pub fn error(s: &str) -> String {
   if colors_enabled() {
      s.red().bold().to_string()
   } else {
      s.to_string()
   }
}

/// Info: progress messages (cyan).
pub fn info(s: &str) -> String {
   if colors_enabled() {
      s.cyan().to_string()
   } else {
      s.to_string()
   }
}

/// De-emphasized detail (dimmed).
pub fn dim(s: &str) -> String {
   if colors_enabled() {
      s.dimmed().to_string()
   } else {
      s.to_string()
   }
}

pub fn bold(s: &str) -> String {
   if colors_enabled() {
      s.bold().to_string()
   } else {
      s.to_string()
   }
}

/// Paint text in the color of a risk level.
pub fn level(s: &str, level: RiskLevel) -> String {
   if !colors_enabled() {
      return s.to_string();
   }
   match level {
      RiskLevel::VeryLow | RiskLevel::Low => s.green().to_string(),
      RiskLevel::Moderate => s.yellow().to_string(),
      RiskLevel::High => s.truecolor(255, 165, 0).to_string(),
      RiskLevel::Critical => s.red().bold().to_string(),
   }
}

/// Section header with a separator line.
pub fn section_header(title: &str, width: usize) -> String {
   format!("{}\n{}", bold(title), dim(&"=".repeat(width)))
}
