//! The scoring orchestrator.
//!
//! One entry point, `score_package`, sequences the whole pipeline: cache
//! read, repository resolution through the ecosystem's registry, a parallel
//! git + forge fan-out joined under a per-package deadline, aggregation,
//! sentiment, reputation, scoring, and the cache write. A transient failure
//! in one collector branch degrades the score instead of failing it; the
//! result is then marked partial and never silently clean.

use std::{
   sync::{Arc, mpsc},
   thread,
   time::{Duration as StdDuration, Instant},
};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::{
   aggregate,
   cache::{Mover, NegativeKind, ScoreCache},
   config::OssuaryConfig,
   error::{OssuaryError, Result},
   forge::{ForgeClient, years_between},
   gitcollect::RepoStore,
   identity::ContributorIndex,
   ratelimit::RateLimiter,
   registry::RegistryClient,
   reputation, scoring, sentiment, style,
   types::{
      Ecosystem, ForgeRecord, PackageIdentity, RawCommit, RegistryRecord, RepositoryRef, Score,
      ScoreInputs,
   },
};

pub struct Orchestrator {
   config:   OssuaryConfig,
   cache:    Mutex<ScoreCache>,
   repos:    Arc<RepoStore>,
   registry: Arc<RegistryClient>,
   forge:    Arc<ForgeClient>,
}

impl Orchestrator {
   pub fn new(config: OssuaryConfig) -> Result<Self> {
      let cache = ScoreCache::open(&config.database_path()?)?;
      Self::with_cache(config, cache)
   }

   /// Construct over an explicit cache handle; tests pass an in-memory one.
   pub fn with_cache(config: OssuaryConfig, cache: ScoreCache) -> Result<Self> {
      let limiter = Arc::new(RateLimiter::new());
      Ok(Self {
         repos:    Arc::new(RepoStore::new(config.repos_path.clone())),
         registry: Arc::new(RegistryClient::new(&config, Arc::clone(&limiter))?),
         forge:    Arc::new(ForgeClient::new(&config, limiter)?),
         cache:    Mutex::new(cache),
         config,
      })
   }

   /// Score one package, honoring an optional historical cutoff and a cache
   /// freshness bound (defaulting to the configured cache days).
   pub fn score_package(
      &self,
      ecosystem: Ecosystem,
      name: &str,
      as_of: Option<DateTime<Utc>>,
      max_age: Option<Duration>,
   ) -> Result<Score> {
      let package = PackageIdentity::new(ecosystem, name)?;
      let max_age = max_age.unwrap_or_else(|| Duration::days(self.config.cache_days as i64));

      // A cutoff in the future means "now".
      let now = Utc::now();
      let requested_as_of = as_of.map(|t| t.min(now));
      let effective_as_of = requested_as_of.unwrap_or(now);

      // 1. Cache gate.
      let bucket = requested_as_of.map(|t| t.date_naive());
      if let Some(cached) = self.cache.lock().read(ecosystem, &package.name, bucket, max_age)? {
         return Ok(cached);
      }
      if let Some((kind, reason)) = self.cache.lock().read_negative(ecosystem, &package.name)? {
         return Err(match kind {
            NegativeKind::Unresolved => OssuaryError::UnresolvedRepo {
               ecosystem: ecosystem.to_string(),
               name:      package.name.clone(),
               reason,
            },
            NegativeKind::Gone => OssuaryError::RepoGone(reason),
         });
      }

      // 2. Resolve the upstream repository.
      let (repo, registry_record) = match self.resolve_repo(&package) {
         Ok(resolved) => resolved,
         Err(e @ (OssuaryError::UnresolvedRepo { .. } | OssuaryError::RepoGone(_))) => {
            self.remember_failure(&package, &e)?;
            return Err(e);
         },
         Err(e) => return Err(e),
      };

      // 3. Parallel fan-out under the package deadline.
      let deadline = Instant::now() + StdDuration::from_secs(self.config.deadline_secs);
      let (commits, forge_record, partial) =
         match self.fan_out(&repo, effective_as_of, deadline) {
            Ok(joined) => joined,
            Err(e @ OssuaryError::RepoGone(_)) => {
               self.remember_failure(&package, &e)?;
               return Err(e);
            },
            Err(e) => return Err(e),
         };

      if partial {
         eprintln!(
            "{}",
            style::warning(&format!("{package}: scoring with incomplete collector data"))
         );
      }

      // 4-5. Aggregate, analyze, score, persist.
      let inputs = build_inputs(
         package,
         repo,
         &commits,
         &forge_record,
         &registry_record,
         effective_as_of,
         partial,
      )?;
      let score = scoring::compute(&inputs, requested_as_of, &self.config.score)?;
      self.cache.lock().write(&score)?;
      Ok(score)
   }

   /// Movers passthrough for the CLI.
   pub fn movers(&self, limit: usize, since: Duration) -> Result<Vec<Mover>> {
      self.cache.lock().movers(limit, since)
   }

   /// Re-score every cached package older than `max_age` on a bounded
   /// worker pool. Individual failures are reported and skipped.
   pub fn refresh(&self, max_age: Duration, ecosystem: Option<Ecosystem>) -> Result<(usize, usize)> {
      let stale = self.cache.lock().stale_packages(max_age, ecosystem)?;
      if stale.is_empty() {
         return Ok((0, 0));
      }
      println!("{} {} stale packages to refresh", style::info("↻"), stale.len());

      let succeeded = Mutex::new(0usize);
      let failed = Mutex::new(0usize);
      let pool = rayon::ThreadPoolBuilder::new()
         .num_threads(self.config.refresh_concurrency)
         .build()
         .map_err(|e| OssuaryError::Invariant(format!("failed to build worker pool: {e}")))?;

      let (succeeded_ref, failed_ref) = (&succeeded, &failed);
      pool.install(|| {
         rayon::scope(|scope| {
            for (eco, name) in &stale {
               scope.spawn(move |_| {
                  match self.score_package(*eco, name, None, Some(Duration::zero())) {
                     Ok(score) => {
                        println!("  {eco}:{name} -> {}", score.score);
                        *succeeded_ref.lock() += 1;
                     },
                     Err(e) => {
                        eprintln!("  {}", style::error(&format!("{eco}:{name} failed: {e}")));
                        *failed_ref.lock() += 1;
                     },
                  }
               });
            }
         });
      });

      Ok((succeeded.into_inner(), failed.into_inner()))
   }

   fn resolve_repo(&self, package: &PackageIdentity) -> Result<(RepositoryRef, RegistryRecord)> {
      let record = self.registry.fetch(package)?;
      let raw_url = record.repo_url.clone().ok_or_else(|| OssuaryError::UnresolvedRepo {
         ecosystem: package.ecosystem.to_string(),
         name:      package.name.clone(),
         reason:    "registry metadata has no repository URL".to_string(),
      })?;
      let repo = RepositoryRef::parse(&raw_url).map_err(|_| OssuaryError::UnresolvedRepo {
         ecosystem: package.ecosystem.to_string(),
         name:      package.name.clone(),
         reason:    format!("unparseable repository URL: {raw_url}"),
      })?;
      if !repo.is_github() {
         return Err(OssuaryError::UnresolvedRepo {
            ecosystem: package.ecosystem.to_string(),
            name:      package.name.clone(),
            reason:    format!("unsupported forge host: {}", repo.host),
         });
      }
      Ok((repo, record))
   }

   /// Run the git and forge branches concurrently and join them under the
   /// deadline. Returns the commits, the forge record, and whether the
   /// result is degraded. On deadline expiry nothing is cached upstream.
   fn fan_out(
      &self,
      repo: &RepositoryRef,
      as_of: DateTime<Utc>,
      deadline: Instant,
   ) -> Result<(Vec<RawCommit>, ForgeRecord, bool)> {
      let (git_tx, git_rx) = mpsc::channel();
      let repos = Arc::clone(&self.repos);
      let git_repo = repo.clone();
      thread::spawn(move || {
         let result = repos
            .ensure_fresh(&git_repo)
            .and_then(|path| repos.list_commits(&path, Some(as_of)));
         let _ = git_tx.send(result);
      });

      let (forge_tx, forge_rx) = mpsc::channel();
      let forge = Arc::clone(&self.forge);
      let forge_repo = repo.clone();
      thread::spawn(move || {
         let _ = forge_tx.send(forge.collect(&forge_repo));
      });

      let git_result = recv_deadline(&git_rx, deadline);
      let forge_result = recv_deadline(&forge_rx, deadline);

      match (git_result, forge_result) {
         (Ok(commits), Ok(record)) => Ok((commits, record, false)),
         (Err(e), _) | (_, Err(e)) if matches!(e, OssuaryError::RepoGone(_)) => Err(e),
         (Ok(commits), Err(e)) if e.is_transient() => {
            eprintln!("{}", style::warning(&format!("forge branch failed: {e}")));
            Ok((commits, ForgeRecord::default(), true))
         },
         (Err(e), Ok(record)) if e.is_transient() => {
            eprintln!("{}", style::warning(&format!("git branch failed: {e}")));
            Ok((Vec::new(), record, true))
         },
         (Err(e), _) | (_, Err(e)) => Err(e),
      }
   }

   fn remember_failure(&self, package: &PackageIdentity, error: &OssuaryError) -> Result<()> {
      let (kind, reason) = match error {
         OssuaryError::UnresolvedRepo { reason, .. } => (NegativeKind::Unresolved, reason.clone()),
         OssuaryError::RepoGone(reason) => (NegativeKind::Gone, reason.clone()),
         _ => return Ok(()),
      };
      self
         .cache
         .lock()
         .write_negative(package.ecosystem, &package.name, kind, &reason)
   }
}

fn recv_deadline<T>(rx: &mpsc::Receiver<Result<T>>, deadline: Instant) -> Result<T> {
   let remaining = deadline.saturating_duration_since(Instant::now());
   match rx.recv_timeout(remaining) {
      Ok(result) => result,
      Err(mpsc::RecvTimeoutError::Timeout) => {
         Err(OssuaryError::Transient("package deadline exceeded".to_string()))
      },
      Err(mpsc::RecvTimeoutError::Disconnected) => {
         Err(OssuaryError::Invariant("collector branch dropped its channel".to_string()))
      },
   }
}

/// Compose the immutable scoring snapshot from everything the collectors
/// produced. Pure; all temporal filtering already happened upstream.
fn build_inputs(
   package: PackageIdentity,
   repo: RepositoryRef,
   commits: &[RawCommit],
   forge_record: &ForgeRecord,
   registry_record: &RegistryRecord,
   as_of: DateTime<Utc>,
   partial: bool,
) -> Result<ScoreInputs> {
   let index = ContributorIndex::from_commits(commits);
   let stats = aggregate::aggregate(commits, &index, as_of)?;

   let corpus =
      sentiment::build_corpus(commits, &forge_record.issue_titles, &forge_record.release_notes);
   let report = sentiment::analyze(&corpus);

   let reputation = forge_record
      .maintainer
      .as_ref()
      .map_or(crate::types::ReputationTier::Unknown, |profile| reputation::assess(profile).tier);

   let repo_age_years = forge_record
      .created_at
      .or(stats.first_commit)
      .map_or(0.0, |created| years_between(created, as_of).max(0.0));

   Ok(ScoreInputs {
      package,
      repo: Some(repo),
      recent_concentration: stats.recent_concentration,
      lifetime_concentration: stats.lifetime_concentration,
      commits_per_year_recent: stats.commits_per_year_recent,
      unique_contributors_recent: stats.unique_contributors_recent,
      total_commits: stats.total_commits,
      repo_age_years,
      last_commit: stats.last_commit,
      downloads_per_week: registry_record.downloads_per_week,
      sentiment_compound: report.compound,
      frustration_flags: report.frustration_flags,
      reputation,
      owner_kind: forge_record.owner_kind,
      admin_count: forge_record.admin_count,
      has_sponsors: forge_record.has_sponsors,
      cii_badge: forge_record.cii_badge,
      proportion_shifts: stats.proportion_shifts,
      recent_table: stats.recent_table,
      lifetime_table: stats.lifetime_table,
      as_of,
      partial,
   })
}

#[cfg(test)]
mod tests {
   use chrono::TimeZone;

   use super::*;
   use crate::types::{BreakdownEntry, OwnerKind, ReputationTier, RiskLevel};

   fn test_config() -> OssuaryConfig {
      OssuaryConfig { repos_path: std::env::temp_dir().join("ossuary-test-repos"), ..OssuaryConfig::default() }
   }

   fn cached_score(name: &str, score: u8) -> Score {
      let level = RiskLevel::from_score(score);
      Score {
         package: name.to_string(),
         ecosystem: Ecosystem::Npm,
         score,
         risk_level: level,
         semaphore: level.semaphore().to_string(),
         explanation: String::new(),
         breakdown: vec![BreakdownEntry {
            tag:      "concentration-base".to_string(),
            points:   i32::from(score),
            evidence: "seeded".to_string(),
         }],
         recommendations: vec![],
         computed_at: Utc::now(),
         as_of: None,
         model_version: "1.0.0".to_string(),
         partial: false,
         inputs_hash: "cafe".to_string(),
      }
   }

   fn commit(name: &str, email: &str, time: DateTime<Utc>) -> RawCommit {
      RawCommit {
         sha:          format!("{name}{}", time.timestamp()),
         author_name:  name.to_string(),
         author_email: email.to_string(),
         author_time:  time,
         message:      "work".to_string(),
      }
   }

   // ========== Cache Gate Tests ==========

   #[test]
   fn test_fresh_cache_hit_short_circuits() {
      let cache = ScoreCache::open_in_memory().unwrap();
      cache.write(&cached_score("lodash", 35)).unwrap();
      let orch = Orchestrator::with_cache(test_config(), cache).unwrap();

      // No network: the cached row answers.
      let score = orch.score_package(Ecosystem::Npm, "lodash", None, None).unwrap();
      assert_eq!(score.score, 35);
   }

   #[test]
   fn test_negative_cache_surfaces_unresolved() {
      let cache = ScoreCache::open_in_memory().unwrap();
      cache
         .write_negative(Ecosystem::Npm, "ghost-pkg", NegativeKind::Unresolved, "no repo url")
         .unwrap();
      let orch = Orchestrator::with_cache(test_config(), cache).unwrap();

      let err = orch.score_package(Ecosystem::Npm, "ghost-pkg", None, None).unwrap_err();
      assert!(matches!(err, OssuaryError::UnresolvedRepo { .. }));
      assert_eq!(err.exit_code(), 1);
   }

   #[test]
   fn test_invalid_name_is_input_error() {
      let orch =
         Orchestrator::with_cache(test_config(), ScoreCache::open_in_memory().unwrap()).unwrap();
      let err = orch.score_package(Ecosystem::Github, "noslash", None, None).unwrap_err();
      assert_eq!(err.exit_code(), 3);
   }

   // ========== build_inputs Tests ==========

   #[test]
   fn test_build_inputs_composes_collector_outputs() {
      let as_of = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
      let commits = vec![
         commit("Alice", "alice@x.example", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
         commit("Alice", "alice@x.example", Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
         commit("Bob", "bob@x.example", Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap()),
      ];
      let forge_record = ForgeRecord {
         owner_kind: Some(OwnerKind::Organization),
         admin_count: Some(5),
         has_sponsors: true,
         created_at: Some(Utc.with_ymd_and_hms(2014, 6, 1, 0, 0, 0).unwrap()),
         issue_titles: vec!["everything is broken".to_string()],
         ..ForgeRecord::default()
      };
      let registry_record =
         RegistryRecord { downloads_per_week: Some(123), ..RegistryRecord::default() };
      let package = PackageIdentity::new(Ecosystem::Npm, "demo").unwrap();
      let repo = RepositoryRef::parse("https://github.com/demo/demo").unwrap();

      let inputs = build_inputs(
         package,
         repo,
         &commits,
         &forge_record,
         &registry_record,
         as_of,
         false,
      )
      .unwrap();

      assert_eq!(inputs.recent_concentration, Some(100.0));
      assert_eq!(inputs.commits_per_year_recent, 2);
      assert_eq!(inputs.total_commits, 3);
      assert_eq!(inputs.downloads_per_week, Some(123));
      assert_eq!(inputs.owner_kind, Some(OwnerKind::Organization));
      assert!(inputs.has_sponsors);
      assert_eq!(inputs.reputation, ReputationTier::Unknown);
      assert!((inputs.repo_age_years - 10.0).abs() < 0.05);
      assert!(inputs.sentiment_compound < 0.0);
   }

   #[test]
   fn test_build_inputs_empty_collectors_degraded() {
      let as_of = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
      let package = PackageIdentity::new(Ecosystem::Npm, "degraded").unwrap();
      let repo = RepositoryRef::parse("https://github.com/d/d").unwrap();
      let inputs = build_inputs(
         package,
         repo,
         &[],
         &ForgeRecord::default(),
         &RegistryRecord::default(),
         as_of,
         true,
      )
      .unwrap();
      assert!(inputs.partial);
      assert_eq!(inputs.recent_concentration, None);
      assert_eq!(inputs.downloads_per_week, None);
      assert_eq!(inputs.repo_age_years, 0.0);
   }

   // ========== recv_deadline Tests ==========

   #[test]
   fn test_recv_deadline_timeout_is_transient() {
      let (_tx, rx) = mpsc::channel::<Result<()>>();
      let err = recv_deadline(&rx, Instant::now()).unwrap_err();
      assert!(err.is_transient());
   }

   #[test]
   fn test_recv_deadline_delivers_result() {
      let (tx, rx) = mpsc::channel::<Result<u32>>();
      tx.send(Ok(7)).unwrap();
      let value = recv_deadline(&rx, Instant::now() + StdDuration::from_secs(1)).unwrap();
      assert_eq!(value, 7);
   }
}
