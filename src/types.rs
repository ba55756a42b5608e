use std::fmt;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{OssuaryError, Result};

// === Ecosystems ===

/// Closed set of supported package ecosystems. The `github` pseudo-ecosystem
/// accepts `owner/name` directly with no registry call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
   Npm,
   Pypi,
   Cargo,
   Rubygems,
   Packagist,
   Nuget,
   Go,
   Github,
}

impl Ecosystem {
   pub const fn as_str(self) -> &'static str {
      match self {
         Self::Npm => "npm",
         Self::Pypi => "pypi",
         Self::Cargo => "cargo",
         Self::Rubygems => "rubygems",
         Self::Packagist => "packagist",
         Self::Nuget => "nuget",
         Self::Go => "go",
         Self::Github => "github",
      }
   }

   pub fn parse(s: &str) -> Result<Self> {
      match s.to_ascii_lowercase().as_str() {
         "npm" => Ok(Self::Npm),
         "pypi" => Ok(Self::Pypi),
         "cargo" | "crates" | "crates.io" => Ok(Self::Cargo),
         "rubygems" | "gem" => Ok(Self::Rubygems),
         "packagist" | "composer" => Ok(Self::Packagist),
         "nuget" => Ok(Self::Nuget),
         "go" | "golang" => Ok(Self::Go),
         "github" => Ok(Self::Github),
         other => Err(OssuaryError::Input(format!("unknown ecosystem: {other}"))),
      }
   }
}

impl fmt::Display for Ecosystem {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// A package identified by `ecosystem:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageIdentity {
   pub ecosystem: Ecosystem,
   pub name:      String,
}

impl PackageIdentity {
   pub fn new(ecosystem: Ecosystem, name: &str) -> Result<Self> {
      let name = name.trim();
      if name.is_empty() {
         return Err(OssuaryError::Input("package name is empty".to_string()));
      }
      if matches!(ecosystem, Ecosystem::Github) && name.split('/').count() != 2 {
         return Err(OssuaryError::Input(format!(
            "github packages must be owner/name, got: {name}"
         )));
      }
      if name.chars().any(char::is_whitespace) {
         return Err(OssuaryError::Input(format!("package name contains whitespace: {name}")));
      }
      Ok(Self { ecosystem, name: name.to_string() })
   }
}

impl fmt::Display for PackageIdentity {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}:{}", self.ecosystem, self.name)
   }
}

// === Repository references ===

/// A resolved upstream repository. At most one per package at a given instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
   pub host:  String,
   pub owner: String,
   pub repo:  String,
   /// Canonical `https://host/owner/repo` form.
   pub url:   String,
}

impl RepositoryRef {
   /// Parse a repository URL in any of the forms registries hand out:
   /// `git+https://`, `git://`, `ssh://git@`, scp-like `git@host:o/r.git`,
   /// plain https with trailing `.git`, fragments, or slashes.
   pub fn parse(raw: &str) -> Result<Self> {
      let mut s = raw.trim().to_string();

      for prefix in ["git+", "git://", "ssh://"] {
         if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.to_string();
         }
      }
      // scp-like: git@github.com:owner/repo.git
      if let Some(rest) = s.strip_prefix("git@") {
         s = rest.replacen(':', "/", 1);
      }
      for prefix in ["https://", "http://"] {
         if let Some(rest) = s.strip_prefix(prefix) {
            s = rest.to_string();
         }
      }
      if let Some(idx) = s.find(['#', '?']) {
         s.truncate(idx);
      }

      let mut parts = s.trim_end_matches('/').splitn(3, '/');
      let host = parts.next().unwrap_or_default().to_ascii_lowercase();
      let owner = parts.next().unwrap_or_default().to_string();
      let repo = parts
         .next()
         .unwrap_or_default()
         .split('/')
         .next()
         .unwrap_or_default()
         .trim_end_matches(".git")
         .to_string();

      if host.is_empty() || owner.is_empty() || repo.is_empty() {
         return Err(OssuaryError::Input(format!("unparseable repository URL: {raw}")));
      }

      let url = format!("https://{host}/{owner}/{repo}");
      Ok(Self { host, owner, repo, url })
   }

   pub fn is_github(&self) -> bool {
      self.host == "github.com"
   }

   pub fn slug(&self) -> String {
      format!("{}/{}", self.owner, self.repo)
   }
}

// === Commits ===

/// One commit as enumerated from the bare clone. The authoritative ordering
/// key is `author_time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommit {
   pub sha:          String,
   pub author_name:  String,
   pub author_email: String,
   pub author_time:  DateTime<Utc>,
   pub message:      String,
}

// === Registry & forge records ===

/// What a registry adapter could learn about a package. Absent fields are
/// factor-neutral downstream, never an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryRecord {
   pub repo_url:           Option<String>,
   pub downloads_per_week: Option<u64>,
   pub latest_version:     Option<String>,
   pub publish_dates:      Vec<DateTime<Utc>>,
   pub maintainers:        Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerKind {
   User,
   Organization,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeContributor {
   pub login:         String,
   pub contributions: u64,
}

/// Forge-level profile of the top commit author, input to the reputation
/// scorer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintainerProfile {
   pub login:                     String,
   pub account_age_years:         f64,
   pub owned_repos:               u32,
   /// Repos among `owned_repos` with >= 10 stars.
   pub starred_repos:             u32,
   pub stars_total:               u64,
   pub sponsors_count:            u32,
   pub org_memberships:           Vec<String>,
   pub maintained_packages_count: u32,
   pub top_maintainer:            bool,
}

/// Everything the forge collector acquires for a resolved repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeRecord {
   pub stars:             u64,
   pub default_branch:    Option<String>,
   pub pushed_at:         Option<DateTime<Utc>>,
   pub created_at:        Option<DateTime<Utc>>,
   pub archived:          bool,
   pub has_sponsors:      bool,
   pub open_issues_count: u64,
   pub releases_count:    u64,
   pub owner_kind:        Option<OwnerKind>,
   /// Admin-role member count for organizations, capped at 50.
   pub admin_count:       Option<u32>,
   /// Public member count for organizations.
   pub member_count:      Option<u32>,
   pub contributors:      Vec<ForgeContributor>,
   pub issue_titles:      Vec<String>,
   pub release_notes:     Vec<String>,
   pub cii_badge:         bool,
   pub maintainer:        Option<MaintainerProfile>,
}

// === Reputation ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReputationTier {
   T1,
   T2,
   Unknown,
}

impl fmt::Display for ReputationTier {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(match self {
         Self::T1 => "T1",
         Self::T2 => "T2",
         Self::Unknown => "UNKNOWN",
      })
   }
}

// === Risk levels ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
   VeryLow,
   Low,
   Moderate,
   High,
   Critical,
}

impl RiskLevel {
   /// Level is determined solely by the score bands:
   /// 0-19, 20-39, 40-59, 60-79, 80-100.
   pub const fn from_score(score: u8) -> Self {
      match score {
         0..=19 => Self::VeryLow,
         20..=39 => Self::Low,
         40..=59 => Self::Moderate,
         60..=79 => Self::High,
         _ => Self::Critical,
      }
   }

   pub const fn semaphore(self) -> &'static str {
      match self {
         Self::VeryLow | Self::Low => "\u{1f7e2}",
         Self::Moderate => "\u{1f7e1}",
         Self::High => "\u{1f7e0}",
         Self::Critical => "\u{1f534}",
      }
   }

   pub const fn as_str(self) -> &'static str {
      match self {
         Self::VeryLow => "VERY_LOW",
         Self::Low => "LOW",
         Self::Moderate => "MODERATE",
         Self::High => "HIGH",
         Self::Critical => "CRITICAL",
      }
   }
}

impl fmt::Display for RiskLevel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

// === Scoring inputs & output ===

/// One contributor's row in a recent or lifetime table, already in
/// deterministic order (commits desc, first-commit asc, id asc).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributorShare {
   pub id:      String,
   pub name:    String,
   pub commits: u64,
   /// Percentage share of the table's commit total.
   pub share:   f64,
}

/// A contributor whose recent share grew relative to their historical share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProportionShift {
   pub id:               String,
   pub name:             String,
   pub share_recent:     f64,
   pub share_historical: f64,
   /// `share_recent - share_historical`, percentage points.
   pub shift:            f64,
}

/// Immutable snapshot handed from the orchestrator to the scoring engine.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreInputs {
   pub package:                     PackageIdentity,
   pub repo:                        Option<RepositoryRef>,
   pub recent_table:                Vec<ContributorShare>,
   pub lifetime_table:              Vec<ContributorShare>,
   pub recent_concentration:        Option<f64>,
   pub lifetime_concentration:      Option<f64>,
   pub commits_per_year_recent:     u64,
   pub unique_contributors_recent:  u64,
   pub total_commits:               u64,
   pub repo_age_years:              f64,
   pub last_commit:                 Option<DateTime<Utc>>,
   pub downloads_per_week:          Option<u64>,
   pub sentiment_compound:          f64,
   /// Sorted for hash stability.
   pub frustration_flags:           Vec<String>,
   pub reputation:                  ReputationTier,
   pub owner_kind:                  Option<OwnerKind>,
   pub admin_count:                 Option<u32>,
   pub has_sponsors:                bool,
   pub cii_badge:                   bool,
   pub proportion_shifts:           Vec<ProportionShift>,
   pub as_of:                       DateTime<Utc>,
   /// True when one collector branch failed and the score is degraded.
   pub partial:                     bool,
}

impl ScoreInputs {
   /// Stable content hash of the inputs plus the model version. Identical
   /// inputs yield identical hashes across runs and platforms.
   pub fn stable_hash(&self, model_version: &str) -> Result<String> {
      let mut hasher = Sha256::new();
      hasher.update(model_version.as_bytes());
      hasher.update([0]);
      hasher.update(serde_json::to_vec(self)?);
      let digest = hasher.finalize();
      Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
   }
}

/// One signed contribution in the score breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakdownEntry {
   pub tag:      String,
   pub points:   i32,
   pub evidence: String,
}

/// The scoring result, shaped to serialize as the response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
   pub package:         String,
   pub ecosystem:       Ecosystem,
   pub score:           u8,
   pub risk_level:      RiskLevel,
   pub semaphore:       String,
   pub explanation:     String,
   pub breakdown:       Vec<BreakdownEntry>,
   pub recommendations: Vec<String>,
   pub computed_at:     DateTime<Utc>,
   pub as_of:           Option<DateTime<Utc>>,
   pub model_version:   String,
   #[serde(default)]
   pub partial:         bool,
   #[serde(default)]
   pub inputs_hash:     String,
}

#[cfg(test)]
mod tests {
   use super::*;

   // ========== Ecosystem Tests ==========

   #[test]
   fn test_ecosystem_parse_known() {
      assert_eq!(Ecosystem::parse("npm").unwrap(), Ecosystem::Npm);
      assert_eq!(Ecosystem::parse("PyPI").unwrap(), Ecosystem::Pypi);
      assert_eq!(Ecosystem::parse("crates.io").unwrap(), Ecosystem::Cargo);
      assert_eq!(Ecosystem::parse("gem").unwrap(), Ecosystem::Rubygems);
      assert_eq!(Ecosystem::parse("golang").unwrap(), Ecosystem::Go);
   }

   #[test]
   fn test_ecosystem_parse_unknown_is_input_error() {
      let err = Ecosystem::parse("maven").unwrap_err();
      assert_eq!(err.exit_code(), 3);
   }

   #[test]
   fn test_package_identity_github_requires_owner_name() {
      assert!(PackageIdentity::new(Ecosystem::Github, "lodash").is_err());
      assert!(PackageIdentity::new(Ecosystem::Github, "lodash/lodash").is_ok());
      assert!(PackageIdentity::new(Ecosystem::Npm, "lodash").is_ok());
   }

   #[test]
   fn test_package_identity_rejects_empty_and_whitespace() {
      assert!(PackageIdentity::new(Ecosystem::Npm, "  ").is_err());
      assert!(PackageIdentity::new(Ecosystem::Npm, "left pad").is_err());
   }

   // ========== RepositoryRef Tests ==========

   #[test]
   fn test_repository_ref_plain_https() {
      let r = RepositoryRef::parse("https://github.com/chalk/chalk").unwrap();
      assert_eq!(r.host, "github.com");
      assert_eq!(r.owner, "chalk");
      assert_eq!(r.repo, "chalk");
      assert_eq!(r.url, "https://github.com/chalk/chalk");
   }

   #[test]
   fn test_repository_ref_git_plus_https_dot_git() {
      let r = RepositoryRef::parse("git+https://github.com/expressjs/express.git").unwrap();
      assert_eq!(r.url, "https://github.com/expressjs/express");
   }

   #[test]
   fn test_repository_ref_scp_like() {
      let r = RepositoryRef::parse("git@github.com:rails/rails.git").unwrap();
      assert_eq!(r.owner, "rails");
      assert_eq!(r.repo, "rails");
   }

   #[test]
   fn test_repository_ref_ssh_scheme() {
      let r = RepositoryRef::parse("ssh://git@github.com/tukaani-project/xz").unwrap();
      assert_eq!(r.slug(), "tukaani-project/xz");
   }

   #[test]
   fn test_repository_ref_fragment_and_trailing_slash() {
      let r = RepositoryRef::parse("https://github.com/sindresorhus/chalk/#readme").unwrap();
      assert_eq!(r.repo, "chalk");
   }

   #[test]
   fn test_repository_ref_non_github_host_preserved() {
      let r = RepositoryRef::parse("https://gitlab.com/gitlab-org/gitlab").unwrap();
      assert_eq!(r.host, "gitlab.com");
      assert!(!r.is_github());
   }

   #[test]
   fn test_repository_ref_rejects_garbage() {
      assert!(RepositoryRef::parse("not a url").is_err());
      assert!(RepositoryRef::parse("https://github.com/onlyowner").is_err());
   }

   #[test]
   fn test_repository_ref_deep_path_takes_first_two_segments() {
      let r = RepositoryRef::parse("https://github.com/golang/tools/tree/master/gopls").unwrap();
      assert_eq!(r.slug(), "golang/tools");
   }

   // ========== RiskLevel Tests ==========

   #[test]
   fn test_risk_level_bands() {
      assert_eq!(RiskLevel::from_score(0), RiskLevel::VeryLow);
      assert_eq!(RiskLevel::from_score(19), RiskLevel::VeryLow);
      assert_eq!(RiskLevel::from_score(20), RiskLevel::Low);
      assert_eq!(RiskLevel::from_score(39), RiskLevel::Low);
      assert_eq!(RiskLevel::from_score(40), RiskLevel::Moderate);
      assert_eq!(RiskLevel::from_score(59), RiskLevel::Moderate);
      assert_eq!(RiskLevel::from_score(60), RiskLevel::High);
      assert_eq!(RiskLevel::from_score(79), RiskLevel::High);
      assert_eq!(RiskLevel::from_score(80), RiskLevel::Critical);
      assert_eq!(RiskLevel::from_score(100), RiskLevel::Critical);
   }

   #[test]
   fn test_risk_level_semaphore() {
      assert_eq!(RiskLevel::VeryLow.semaphore(), "\u{1f7e2}");
      assert_eq!(RiskLevel::Low.semaphore(), "\u{1f7e2}");
      assert_eq!(RiskLevel::Moderate.semaphore(), "\u{1f7e1}");
      assert_eq!(RiskLevel::High.semaphore(), "\u{1f7e0}");
      assert_eq!(RiskLevel::Critical.semaphore(), "\u{1f534}");
   }

   #[test]
   fn test_risk_level_serializes_screaming() {
      let json = serde_json::to_string(&RiskLevel::VeryLow).unwrap();
      assert_eq!(json, "\"VERY_LOW\"");
   }

   // ========== ScoreInputs Hash Tests ==========

   fn sample_inputs() -> ScoreInputs {
      ScoreInputs {
         package: PackageIdentity::new(Ecosystem::Npm, "event-stream").unwrap(),
         repo: None,
         recent_table: vec![],
         lifetime_table: vec![],
         recent_concentration: Some(75.0),
         lifetime_concentration: Some(80.0),
         commits_per_year_recent: 4,
         unique_contributors_recent: 1,
         total_commits: 500,
         repo_age_years: 6.0,
         last_commit: None,
         downloads_per_week: Some(2_000_000),
         sentiment_compound: -0.1,
         frustration_flags: vec!["free work".to_string()],
         reputation: ReputationTier::Unknown,
         owner_kind: Some(OwnerKind::User),
         admin_count: None,
         has_sponsors: false,
         cii_badge: false,
         proportion_shifts: vec![],
         as_of: DateTime::parse_from_rfc3339("2018-09-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
         partial: false,
      }
   }

   #[test]
   fn test_stable_hash_is_deterministic() {
      let a = sample_inputs().stable_hash("1.0.0").unwrap();
      let b = sample_inputs().stable_hash("1.0.0").unwrap();
      assert_eq!(a, b);
      assert_eq!(a.len(), 64);
   }

   #[test]
   fn test_stable_hash_changes_with_model_version() {
      let a = sample_inputs().stable_hash("1.0.0").unwrap();
      let b = sample_inputs().stable_hash("1.0.1").unwrap();
      assert_ne!(a, b);
   }

   #[test]
   fn test_stable_hash_changes_with_inputs() {
      let a = sample_inputs().stable_hash("1.0.0").unwrap();
      let mut inputs = sample_inputs();
      inputs.recent_concentration = Some(90.0);
      let b = inputs.stable_hash("1.0.0").unwrap();
      assert_ne!(a, b);
   }
}
