//! Persistent score cache and movers store.
//!
//! SQLite in WAL mode with two logical tables: `scores` holds the latest
//! score per `(ecosystem, name, as_of_bucket)` as a JSON payload, and
//! `score_history` is append-only for the movers delta query. A small
//! negative cache damps stampedes on unresolved and deleted repositories.

use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{Connection, OpenFlags, params};

use crate::{
   error::{OssuaryError, Result},
   types::{Ecosystem, Score},
};

/// UnresolvedRepo results are withheld for this long.
const NEGATIVE_UNRESOLVED_TTL: Duration = Duration::hours(1);
/// RepoGone results are withheld for this long.
const NEGATIVE_GONE_TTL: Duration = Duration::hours(24);

/// One row of the movers query: the largest recent score swings.
#[derive(Debug, Clone)]
pub struct Mover {
   pub ecosystem:   Ecosystem,
   pub name:        String,
   pub previous:    i64,
   pub latest:      i64,
   pub delta:       i64,
   pub computed_at: DateTime<Utc>,
}

/// Outcome kinds remembered by the negative cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeKind {
   Unresolved,
   Gone,
}

impl NegativeKind {
   const fn as_str(self) -> &'static str {
      match self {
         Self::Unresolved => "unresolved",
         Self::Gone => "gone",
      }
   }

   const fn ttl(self) -> Duration {
      match self {
         Self::Unresolved => NEGATIVE_UNRESOLVED_TTL,
         Self::Gone => NEGATIVE_GONE_TTL,
      }
   }
}

pub struct ScoreCache {
   conn: Connection,
}

impl ScoreCache {
   /// Open (or create) the database at `path`, applying schema and PRAGMAs.
   pub fn open(path: &Path) -> Result<Self> {
      if let Some(parent) = path.parent()
         && !parent.as_os_str().is_empty()
      {
         std::fs::create_dir_all(parent)?;
      }
      let conn = Connection::open_with_flags(
         path,
         OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
      )?;
      conn.pragma_update(None, "journal_mode", "WAL")?;
      conn.pragma_update(None, "synchronous", "NORMAL")?;
      conn.pragma_update(None, "busy_timeout", 5000)?;
      apply_schema(&conn)?;
      Ok(Self { conn })
   }

   /// In-memory cache for tests and dry runs.
   pub fn open_in_memory() -> Result<Self> {
      let conn = Connection::open_in_memory()?;
      apply_schema(&conn)?;
      Ok(Self { conn })
   }

   /// Read a cached score: HIT iff the bucket matches and `computed_at` is
   /// within `max_age` of now.
   pub fn read(
      &self,
      ecosystem: Ecosystem,
      name: &str,
      as_of_bucket: Option<NaiveDate>,
      max_age: Duration,
   ) -> Result<Option<Score>> {
      let mut stmt = self.conn.prepare_cached(
         "SELECT payload, computed_at FROM scores
          WHERE ecosystem = ?1 AND name = ?2 AND as_of_bucket = ?3",
      )?;
      let row: Option<(String, String)> = stmt
         .query_row(params![ecosystem.as_str(), name, bucket_key(as_of_bucket)], |row| {
            Ok((row.get(0)?, row.get(1)?))
         })
         .map(Some)
         .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
         })?;

      let Some((payload, computed_at)) = row else {
         return Ok(None);
      };
      let computed_at = parse_instant(&computed_at)?;
      if Utc::now() - computed_at > max_age {
         return Ok(None);
      }
      Ok(Some(serde_json::from_str(&payload)?))
   }

   /// Upsert `scores` and append `score_history` atomically.
   pub fn write(&self, score: &Score) -> Result<()> {
      let payload = serde_json::to_string(score)?;
      let bucket = bucket_key(score.as_of.map(|t| t.date_naive()));
      let computed_at = score.computed_at.to_rfc3339();

      let tx = self.conn.unchecked_transaction()?;
      tx.prepare_cached(
         "INSERT INTO scores (ecosystem, name, as_of_bucket, payload, computed_at)
          VALUES (?1, ?2, ?3, ?4, ?5)
          ON CONFLICT (ecosystem, name, as_of_bucket)
          DO UPDATE SET payload = excluded.payload, computed_at = excluded.computed_at",
      )?
      .execute(params![score.ecosystem.as_str(), score.package, bucket, payload, computed_at])?;
      tx.prepare_cached(
         "INSERT INTO score_history (ecosystem, name, score, computed_at)
          VALUES (?1, ?2, ?3, ?4)",
      )?
      .execute(params![score.ecosystem.as_str(), score.package, i64::from(score.score), computed_at])?;
      tx.commit()?;
      Ok(())
   }

   /// Packages whose two most recent history rows inside the window differ
   /// by the largest absolute delta, descending; ties go to the later
   /// `computed_at`.
   pub fn movers(&self, limit: usize, since: Duration) -> Result<Vec<Mover>> {
      let cutoff = (Utc::now() - since).to_rfc3339();
      let mut stmt = self.conn.prepare_cached(
         "SELECT ecosystem, name, score, computed_at FROM score_history
          WHERE computed_at >= ?1
          ORDER BY ecosystem, name, computed_at DESC, id DESC",
      )?;
      let rows: Vec<(String, String, i64, String)> = stmt
         .query_map(params![cutoff], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
         })?
         .collect::<std::result::Result<_, _>>()?;

      let mut movers = Vec::new();
      let mut idx = 0;
      while idx < rows.len() {
         let (eco, name) = (rows[idx].0.clone(), rows[idx].1.clone());
         let group_end = rows[idx..]
            .iter()
            .position(|r| r.0 != eco || r.1 != name)
            .map_or(rows.len(), |offset| idx + offset);
         if group_end - idx >= 2 {
            let latest = &rows[idx];
            let previous = &rows[idx + 1];
            movers.push(Mover {
               ecosystem:   Ecosystem::parse(&eco)?,
               name,
               previous:    previous.2,
               latest:      latest.2,
               delta:       latest.2 - previous.2,
               computed_at: parse_instant(&latest.3)?,
            });
         }
         idx = group_end;
      }

      movers.sort_by(|a, b| {
         b.delta
            .abs()
            .cmp(&a.delta.abs())
            .then(b.computed_at.cmp(&a.computed_at))
      });
      movers.truncate(limit);
      Ok(movers)
   }

   /// Remember a terminal resolution failure so repeated requests don't
   /// stampede the registry or forge.
   pub fn write_negative(
      &self,
      ecosystem: Ecosystem,
      name: &str,
      kind: NegativeKind,
      reason: &str,
   ) -> Result<()> {
      self
         .conn
         .prepare_cached(
            "INSERT INTO negative_cache (ecosystem, name, kind, reason, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (ecosystem, name)
             DO UPDATE SET kind = excluded.kind, reason = excluded.reason,
                           cached_at = excluded.cached_at",
         )?
         .execute(params![
            ecosystem.as_str(),
            name,
            kind.as_str(),
            reason,
            Utc::now().to_rfc3339()
         ])?;
      Ok(())
   }

   /// Live negative entry for a package, if any.
   pub fn read_negative(
      &self,
      ecosystem: Ecosystem,
      name: &str,
   ) -> Result<Option<(NegativeKind, String)>> {
      let mut stmt = self.conn.prepare_cached(
         "SELECT kind, reason, cached_at FROM negative_cache
          WHERE ecosystem = ?1 AND name = ?2",
      )?;
      let row: Option<(String, String, String)> = stmt
         .query_row(params![ecosystem.as_str(), name], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
         })
         .map(Some)
         .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
         })?;

      let Some((kind, reason, cached_at)) = row else {
         return Ok(None);
      };
      let kind = match kind.as_str() {
         "unresolved" => NegativeKind::Unresolved,
         "gone" => NegativeKind::Gone,
         other => {
            return Err(OssuaryError::Invariant(format!("unknown negative kind: {other}")));
         },
      };
      if Utc::now() - parse_instant(&cached_at)? > kind.ttl() {
         return Ok(None);
      }
      Ok(Some((kind, reason)))
   }

   /// Current-score packages whose cache entry is older than `max_age`,
   /// for the refresh batch runner.
   pub fn stale_packages(
      &self,
      max_age: Duration,
      ecosystem: Option<Ecosystem>,
   ) -> Result<Vec<(Ecosystem, String)>> {
      let cutoff = (Utc::now() - max_age).to_rfc3339();
      let mut stmt = self.conn.prepare_cached(
         "SELECT ecosystem, name FROM scores
          WHERE as_of_bucket = '' AND computed_at < ?1
          ORDER BY ecosystem, name",
      )?;
      let rows: Vec<(String, String)> = stmt
         .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
         .collect::<std::result::Result<_, _>>()?;

      let mut packages = Vec::new();
      for (eco, name) in rows {
         let eco = Ecosystem::parse(&eco)?;
         if ecosystem.is_none_or(|wanted| wanted == eco) {
            packages.push((eco, name));
         }
      }
      Ok(packages)
   }
}

fn apply_schema(conn: &Connection) -> Result<()> {
   conn.execute_batch(
      "CREATE TABLE IF NOT EXISTS scores (
          ecosystem    TEXT NOT NULL,
          name         TEXT NOT NULL,
          as_of_bucket TEXT NOT NULL DEFAULT '',
          payload      TEXT NOT NULL,
          computed_at  TEXT NOT NULL,
          PRIMARY KEY (ecosystem, name, as_of_bucket)
       );
       CREATE TABLE IF NOT EXISTS score_history (
          id          INTEGER PRIMARY KEY AUTOINCREMENT,
          ecosystem   TEXT NOT NULL,
          name        TEXT NOT NULL,
          score       INTEGER NOT NULL,
          computed_at TEXT NOT NULL
       );
       CREATE INDEX IF NOT EXISTS idx_history_package
          ON score_history (ecosystem, name, computed_at);
       CREATE TABLE IF NOT EXISTS negative_cache (
          ecosystem TEXT NOT NULL,
          name      TEXT NOT NULL,
          kind      TEXT NOT NULL,
          reason    TEXT NOT NULL,
          cached_at TEXT NOT NULL,
          PRIMARY KEY (ecosystem, name)
       );",
   )?;
   Ok(())
}

/// `''` marks current scores; historical buckets are ISO dates.
fn bucket_key(bucket: Option<NaiveDate>) -> String {
   bucket.map_or_else(String::new, |d| d.to_string())
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
   DateTime::parse_from_rfc3339(raw)
      .map(|t| t.with_timezone(&Utc))
      .map_err(|e| OssuaryError::Invariant(format!("bad timestamp in cache: {raw}: {e}")))
}

#[cfg(test)]
mod tests {
   use chrono::TimeZone;

   use super::*;
   use crate::types::{BreakdownEntry, RiskLevel};

   fn sample_score(name: &str, score: u8, computed_at: DateTime<Utc>) -> Score {
      let level = RiskLevel::from_score(score);
      Score {
         package: name.to_string(),
         ecosystem: Ecosystem::Npm,
         score,
         risk_level: level,
         semaphore: level.semaphore().to_string(),
         explanation: format!("{} {level} ({score}).", level.semaphore()),
         breakdown: vec![BreakdownEntry {
            tag:      "concentration-base".to_string(),
            points:   i32::from(score),
            evidence: "test".to_string(),
         }],
         recommendations: vec![],
         computed_at,
         as_of: None,
         model_version: "1.0.0".to_string(),
         partial: false,
         inputs_hash: "deadbeef".to_string(),
      }
   }

   // ========== Read/Write Tests ==========

   #[test]
   fn test_write_then_read_roundtrip() {
      let cache = ScoreCache::open_in_memory().unwrap();
      let score = sample_score("lodash", 42, Utc::now());
      cache.write(&score).unwrap();

      let cached = cache
         .read(Ecosystem::Npm, "lodash", None, Duration::days(7))
         .unwrap()
         .expect("fresh entry is a HIT");
      assert_eq!(cached.score, 42);
      assert_eq!(cached.package, "lodash");
      assert_eq!(cached.breakdown, score.breakdown);
      assert_eq!(cached.inputs_hash, score.inputs_hash);
   }

   #[test]
   fn test_read_miss_when_stale() {
      let cache = ScoreCache::open_in_memory().unwrap();
      let old = Utc::now() - Duration::days(8);
      cache.write(&sample_score("lodash", 42, old)).unwrap();
      assert!(cache
         .read(Ecosystem::Npm, "lodash", None, Duration::days(7))
         .unwrap()
         .is_none());
   }

   #[test]
   fn test_read_miss_on_bucket_mismatch() {
      let cache = ScoreCache::open_in_memory().unwrap();
      cache.write(&sample_score("lodash", 42, Utc::now())).unwrap();
      let bucket = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
      assert!(cache
         .read(Ecosystem::Npm, "lodash", Some(bucket), Duration::days(7))
         .unwrap()
         .is_none());
   }

   #[test]
   fn test_as_of_bucket_separated_from_current() {
      let cache = ScoreCache::open_in_memory().unwrap();
      let mut historical = sample_score("lodash", 77, Utc::now());
      historical.as_of = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
      cache.write(&historical).unwrap();
      cache.write(&sample_score("lodash", 30, Utc::now())).unwrap();

      let bucket = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
      let hit = cache
         .read(Ecosystem::Npm, "lodash", Some(bucket), Duration::days(7))
         .unwrap()
         .unwrap();
      assert_eq!(hit.score, 77);
      let current = cache
         .read(Ecosystem::Npm, "lodash", None, Duration::days(7))
         .unwrap()
         .unwrap();
      assert_eq!(current.score, 30);
   }

   #[test]
   fn test_upsert_last_write_wins() {
      let cache = ScoreCache::open_in_memory().unwrap();
      cache.write(&sample_score("chalk", 20, Utc::now())).unwrap();
      cache.write(&sample_score("chalk", 60, Utc::now())).unwrap();
      let hit = cache
         .read(Ecosystem::Npm, "chalk", None, Duration::days(7))
         .unwrap()
         .unwrap();
      assert_eq!(hit.score, 60);
   }

   // ========== Movers Tests ==========

   #[test]
   fn test_movers_largest_delta_first() {
      let cache = ScoreCache::open_in_memory().unwrap();
      let now = Utc::now();
      cache.write(&sample_score("steady", 50, now - Duration::hours(3))).unwrap();
      cache.write(&sample_score("steady", 52, now - Duration::hours(1))).unwrap();
      cache.write(&sample_score("jumpy", 20, now - Duration::hours(3))).unwrap();
      cache.write(&sample_score("jumpy", 80, now - Duration::hours(1))).unwrap();

      let movers = cache.movers(10, Duration::days(7)).unwrap();
      assert_eq!(movers.len(), 2);
      assert_eq!(movers[0].name, "jumpy");
      assert_eq!(movers[0].delta, 60);
      assert_eq!(movers[1].name, "steady");
      assert_eq!(movers[1].delta, 2);
   }

   #[test]
   fn test_movers_needs_two_rows_in_window() {
      let cache = ScoreCache::open_in_memory().unwrap();
      cache.write(&sample_score("single", 50, Utc::now())).unwrap();
      assert!(cache.movers(10, Duration::days(7)).unwrap().is_empty());
   }

   #[test]
   fn test_movers_uses_two_most_recent_rows() {
      let cache = ScoreCache::open_in_memory().unwrap();
      let now = Utc::now();
      cache.write(&sample_score("pkg", 10, now - Duration::hours(5))).unwrap();
      cache.write(&sample_score("pkg", 90, now - Duration::hours(3))).unwrap();
      cache.write(&sample_score("pkg", 85, now - Duration::hours(1))).unwrap();

      let movers = cache.movers(10, Duration::days(7)).unwrap();
      assert_eq!(movers.len(), 1);
      // 85 vs 90, not 85 vs 10
      assert_eq!(movers[0].delta, -5);
   }

   #[test]
   fn test_movers_limit() {
      let cache = ScoreCache::open_in_memory().unwrap();
      let now = Utc::now();
      for (name, first, second) in [("a", 10, 30), ("b", 10, 50), ("c", 10, 20)] {
         cache.write(&sample_score(name, first, now - Duration::hours(2))).unwrap();
         cache.write(&sample_score(name, second, now - Duration::hours(1))).unwrap();
      }
      let movers = cache.movers(2, Duration::days(7)).unwrap();
      assert_eq!(movers.len(), 2);
      assert_eq!(movers[0].name, "b");
   }

   // ========== Negative Cache Tests ==========

   #[test]
   fn test_negative_cache_roundtrip() {
      let cache = ScoreCache::open_in_memory().unwrap();
      cache
         .write_negative(Ecosystem::Pypi, "ghost", NegativeKind::Unresolved, "no repo url")
         .unwrap();
      let (kind, reason) = cache.read_negative(Ecosystem::Pypi, "ghost").unwrap().unwrap();
      assert_eq!(kind, NegativeKind::Unresolved);
      assert_eq!(reason, "no repo url");
      assert!(cache.read_negative(Ecosystem::Npm, "ghost").unwrap().is_none());
   }

   // ========== Stale Package Tests ==========

   #[test]
   fn test_stale_packages_filters_by_age_and_ecosystem() {
      let cache = ScoreCache::open_in_memory().unwrap();
      let now = Utc::now();
      cache.write(&sample_score("fresh", 10, now)).unwrap();
      cache.write(&sample_score("old", 10, now - Duration::days(10))).unwrap();

      let stale = cache.stale_packages(Duration::days(7), None).unwrap();
      assert_eq!(stale.len(), 1);
      assert_eq!(stale[0].1, "old");

      let stale = cache.stale_packages(Duration::days(7), Some(Ecosystem::Pypi)).unwrap();
      assert!(stale.is_empty());
   }
}
