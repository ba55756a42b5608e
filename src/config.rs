use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{OssuaryError, Result};

/// The scoring model as a closed value: every weight, threshold, and band
/// edge, plus the model version. Changing any number here MUST bump
/// `model_version` — it participates in the inputs hash.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
   pub model_version: String,

   // Maturity classification
   pub mature_min_age_years:      f64,
   pub mature_min_commits:        u64,
   pub mature_max_dormancy_years: f64,
   /// Mature projects fall back to lifetime concentration below this recent
   /// commit rate.
   pub mature_recent_track_min_commits: u64,

   /// Concentration band edges (upper-exclusive) paired with
   /// `base_band_scores`; concentration >= the last edge maps to the final
   /// score.
   pub base_band_edges:  [f64; 4],
   pub base_band_scores: [i32; 5],

   // Activity modifier by commits_per_year_recent
   pub activity_high_threshold:    u64,
   pub activity_high_bonus:        i32,
   pub activity_medium_threshold:  u64,
   pub activity_medium_bonus:      i32,
   pub activity_low_threshold:     u64,
   pub activity_abandoned_penalty: i32,

   // Protective factors
   pub tier1_bonus:                 i32,
   pub tier2_bonus:                 i32,
   pub sponsors_bonus:              i32,
   pub org_succession_bonus:        i32,
   pub org_succession_min_admins:   u32,
   pub massive_visibility_bonus:    i32,
   pub massive_visibility_downloads: u64,
   pub high_visibility_bonus:       i32,
   pub high_visibility_downloads:   u64,
   pub distributed_governance_bonus: i32,
   pub distributed_governance_max_concentration: f64,
   pub active_community_bonus:      i32,
   pub active_community_min_contributors: u64,
   pub cii_bonus:                   i32,
   pub positive_sentiment_bonus:    i32,
   pub positive_sentiment_threshold: f64,

   // Risk factors
   pub frustration_penalty:          i32,
   pub negative_sentiment_penalty:   i32,
   pub negative_sentiment_threshold: f64,
   pub takeover_penalty:         i32,
   pub takeover_shift_threshold: f64,
}

impl Default for ScoreConfig {
   fn default() -> Self {
      Self {
         model_version: "1.0.0".to_string(),

         mature_min_age_years:            5.0,
         mature_min_commits:              30,
         mature_max_dormancy_years:       5.0,
         mature_recent_track_min_commits: 4,

         base_band_edges:  [30.0, 50.0, 70.0, 90.0],
         base_band_scores: [20, 40, 60, 80, 100],

         activity_high_threshold:    50,
         activity_high_bonus:        -30,
         activity_medium_threshold:  12,
         activity_medium_bonus:      -15,
         activity_low_threshold:     4,
         activity_abandoned_penalty: 20,

         tier1_bonus:                  -25,
         tier2_bonus:                  -10,
         sponsors_bonus:               -15,
         org_succession_bonus:         -15,
         org_succession_min_admins:    3,
         massive_visibility_bonus:     -20,
         massive_visibility_downloads: 50_000_000,
         high_visibility_bonus:        -10,
         high_visibility_downloads:    10_000_000,
         distributed_governance_bonus: -10,
         distributed_governance_max_concentration: 40.0,
         active_community_bonus:          -10,
         active_community_min_contributors: 20,
         cii_bonus:                    -10,
         positive_sentiment_bonus:     -5,
         positive_sentiment_threshold: 0.3,

         frustration_penalty:          20,
         negative_sentiment_penalty:   10,
         negative_sentiment_threshold: -0.3,
         takeover_penalty:             20,
         takeover_shift_threshold:     30.0,
      }
   }
}

/// Runtime configuration: credentials, storage locations, network budgets.
/// Environment variables override the config file:
/// - `GITHUB_TOKEN` overrides `github_token`
/// - `DATABASE_URL` overrides `database_url`
/// - `REPOS_PATH` overrides `repos_path`
/// - `OSSUARY_CACHE_DAYS` overrides `cache_days`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OssuaryConfig {
   pub github_token: Option<String>,

   /// Cache backend; only `sqlite://` URLs are supported.
   pub database_url: String,

   /// Directory for bare blobless clones.
   pub repos_path: PathBuf,

   /// Default freshness bound for cached scores, in days.
   pub cache_days: u64,

   pub request_timeout_secs: u64,
   pub connect_timeout_secs: u64,
   pub max_retries:          u32,
   pub initial_backoff_ms:   u64,

   /// Per-package scoring deadline in seconds.
   pub deadline_secs: u64,

   /// Worker count for the refresh batch runner.
   pub refresh_concurrency: usize,

   pub score: ScoreConfig,
}

impl Default for OssuaryConfig {
   fn default() -> Self {
      Self {
         github_token:         None,
         database_url:         "sqlite:///ossuary.db".to_string(),
         repos_path:           PathBuf::from("./repos"),
         cache_days:           7,
         request_timeout_secs: 30,
         connect_timeout_secs: 10,
         max_retries:          3,
         initial_backoff_ms:   500,
         deadline_secs:        300,
         refresh_concurrency:  3,
         score:                ScoreConfig::default(),
      }
   }
}

impl OssuaryConfig {
   /// Load config from the default location
   /// (`~/.config/ossuary/config.toml`), falling back to defaults when the
   /// file is absent. `OSSUARY_CONFIG` points at an alternate file.
   pub fn load() -> Result<Self> {
      let config_path = if let Ok(custom_path) = std::env::var("OSSUARY_CONFIG") {
         PathBuf::from(custom_path)
      } else {
         Self::default_config_path().unwrap_or_else(|_| PathBuf::new())
      };

      let mut config = if config_path.exists() {
         Self::from_file(&config_path)?
      } else {
         Self::default()
      };

      Self::apply_env_overrides(&mut config)?;
      Ok(config)
   }

   /// Load config from a specific file, then apply environment overrides.
   pub fn from_file(path: &Path) -> Result<Self> {
      let contents = std::fs::read_to_string(path)
         .map_err(|e| OssuaryError::Input(format!("failed to read config {}: {e}", path.display())))?;
      let mut config: Self = toml::from_str(&contents)
         .map_err(|e| OssuaryError::Input(format!("failed to parse config {}: {e}", path.display())))?;
      Self::apply_env_overrides(&mut config)?;
      Ok(config)
   }

   fn apply_env_overrides(config: &mut Self) -> Result<()> {
      if let Ok(token) = std::env::var("GITHUB_TOKEN")
         && !token.is_empty()
      {
         config.github_token = Some(token);
      }
      if let Ok(url) = std::env::var("DATABASE_URL") {
         config.database_url = url;
      }
      if let Ok(path) = std::env::var("REPOS_PATH") {
         config.repos_path = PathBuf::from(path);
      }
      if let Ok(days) = std::env::var("OSSUARY_CACHE_DAYS") {
         config.cache_days = days
            .parse()
            .map_err(|_| OssuaryError::Input(format!("OSSUARY_CACHE_DAYS not a number: {days}")))?;
      }
      Ok(())
   }

   /// Filesystem path behind a `sqlite://` database URL.
   pub fn database_path(&self) -> Result<PathBuf> {
      let url = &self.database_url;
      url.strip_prefix("sqlite:///")
         .or_else(|| url.strip_prefix("sqlite://"))
         .or_else(|| url.strip_prefix("sqlite:"))
         .map(PathBuf::from)
         .ok_or_else(|| {
            OssuaryError::Input(format!("unsupported database URL (sqlite only): {url}"))
         })
   }

   fn default_config_path() -> Result<PathBuf> {
      if let Ok(home) = std::env::var("HOME") {
         return Ok(PathBuf::from(home).join(".config/ossuary/config.toml"));
      }
      if let Ok(home) = std::env::var("USERPROFILE") {
         return Ok(PathBuf::from(home).join(".config/ossuary/config.toml"));
      }
      Err(OssuaryError::Input("no home directory found (tried HOME and USERPROFILE)".to_string()))
   }
}

/// Frustration phrases matched case-insensitively against the sentiment
/// corpus. Frozen; matches contribute evidence strings to the breakdown.
pub const FRUSTRATION_KEYWORDS: &[&str] = &[
   "not getting paid",
   "unpaid work",
   "free labor",
   "free work",
   "corporate exploitation",
   "burned out",
   "burnout",
   "stepping down",
   "abandoning this project",
   "fortune 500",
   "pay developers",
   "companies make millions",
   "protest",
   "on strike",
   "boycott",
   "resentment",
   "exploitation",
];

/// Organizations whose membership counts as a reputation signal. Frozen.
pub const RECOGNIZED_ORGS: &[&str] = &[
   "nodejs",
   "openjs-foundation",
   "npm",
   "expressjs",
   "eslint",
   "webpack",
   "babel",
   "python",
   "psf",
   "pypa",
   "pallets",
   "django",
   "tiangolo",
   "apache",
   "cncf",
   "linux-foundation",
   "mozilla",
   "rust-lang",
   "golang",
   "kubernetes",
   "docker",
   "hashicorp",
];

/// Account names treated as bots even without a `[bot]` marker.
pub const KNOWN_BOTS: &[&str] = &[
   "dependabot",
   "renovate",
   "greenkeeper",
   "snyk-bot",
   "github-actions",
   "web-flow",
   "semantic-release-bot",
   "allcontributors",
   "imgbot",
];
