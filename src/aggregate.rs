//! Contributor aggregation.
//!
//! Turns the commit stream into the tables the scoring engine consumes:
//! recent (trailing 12 months from `as_of`) and lifetime views, top-author
//! concentration for both, and per-contributor proportion shifts for the
//! takeover detector. Bots are excluded from every table.

use chrono::{DateTime, Months, Utc};
use indexmap::IndexMap;

use crate::{
   error::{OssuaryError, Result},
   identity::ContributorIndex,
   types::{ContributorShare, ProportionShift, RawCommit},
};

/// Proportion shifts only exist once the recent window has this many commits.
const SHIFT_MIN_RECENT_COMMITS: u64 = 5;
/// Contributors at or above this historical share are established, not
/// newcomers; the takeover detector ignores them.
const SHIFT_MAX_HISTORICAL_SHARE: f64 = 5.0;

#[derive(Debug, Clone, Default)]
pub struct ContributorStats {
   pub recent_table:               Vec<ContributorShare>,
   pub lifetime_table:             Vec<ContributorShare>,
   /// `None` when the recent window holds no non-bot commits.
   pub recent_concentration:       Option<f64>,
   /// `None` when the history holds no non-bot commits at all.
   pub lifetime_concentration:     Option<f64>,
   /// Non-bot commits in the trailing 12 months; the window is exactly one
   /// year, so this is also the annual rate.
   pub commits_per_year_recent:    u64,
   pub unique_contributors_recent: u64,
   /// All commits at or before `as_of`, bots included.
   pub total_commits:              u64,
   pub first_commit:               Option<DateTime<Utc>>,
   pub last_commit:                Option<DateTime<Utc>>,
   pub proportion_shifts:          Vec<ProportionShift>,
}

/// Build contributor statistics from commits already filtered to
/// `author_time <= as_of`.
pub fn aggregate(
   commits: &[RawCommit],
   index: &ContributorIndex,
   as_of: DateTime<Utc>,
) -> Result<ContributorStats> {
   let window_start = as_of
      .checked_sub_months(Months::new(12))
      .ok_or_else(|| OssuaryError::Invariant("as_of underflows the 12-month window".to_string()))?;

   let mut recent: IndexMap<String, u64> = IndexMap::new();
   let mut historical: IndexMap<String, u64> = IndexMap::new();
   let mut recent_count = 0u64;
   let mut historical_count = 0u64;

   for commit in commits {
      if commit.author_time > as_of {
         return Err(OssuaryError::Invariant(format!(
            "commit {} is later than as_of", commit.sha
         )));
      }
      let id = index.canonical_id(&commit.author_name, &commit.author_email);
      let is_bot = index.get(&id).is_some_and(|c| c.is_bot);
      if commit.author_time > window_start {
         recent_count += 1;
         if !is_bot {
            *recent.entry(id).or_insert(0) += 1;
         }
      } else {
         historical_count += 1;
         if !is_bot {
            *historical.entry(id).or_insert(0) += 1;
         }
      }
   }

   let total_commits = commits.len() as u64;
   if recent_count + historical_count != total_commits {
      return Err(OssuaryError::Invariant(format!(
         "window partition lost commits: {recent_count} + {historical_count} != {total_commits}"
      )));
   }

   // Lifetime view is the union of both windows.
   let mut lifetime: IndexMap<String, u64> = historical.clone();
   for (id, count) in &recent {
      *lifetime.entry(id.clone()).or_insert(0) += count;
   }

   let recent_table = build_table(&recent, index);
   let lifetime_table = build_table(&lifetime, index);

   let proportion_shifts = proportion_shifts(&recent, &historical, index);

   Ok(ContributorStats {
      recent_concentration: concentration(&recent_table),
      lifetime_concentration: concentration(&lifetime_table),
      commits_per_year_recent: recent.values().sum(),
      unique_contributors_recent: recent.len() as u64,
      total_commits,
      first_commit: commits.iter().map(|c| c.author_time).min(),
      last_commit: commits.iter().map(|c| c.author_time).max(),
      recent_table,
      lifetime_table,
      proportion_shifts,
   })
}

/// Share table in deterministic order: commits desc, id asc.
fn build_table(counts: &IndexMap<String, u64>, index: &ContributorIndex) -> Vec<ContributorShare> {
   let total: u64 = counts.values().sum();
   if total == 0 {
      return Vec::new();
   }
   let mut table: Vec<ContributorShare> = counts
      .iter()
      .map(|(id, &commits)| ContributorShare {
         id:      id.clone(),
         name:    index
            .get(id)
            .map_or_else(|| id.clone(), |c| c.display_name.clone()),
         commits,
         share:   100.0 * commits as f64 / total as f64,
      })
      .collect();
   table.sort_by(|a, b| b.commits.cmp(&a.commits).then(a.id.cmp(&b.id)));
   table
}

/// Top-author share of a table, in percent.
fn concentration(table: &[ContributorShare]) -> Option<f64> {
   table.first().map(|top| top.share)
}

/// `share_recent - share_historical` for every non-bot contributor whose
/// historical share is under 5%, once the recent window has at least 5
/// commits. Established contributors and bots never appear.
fn proportion_shifts(
   recent: &IndexMap<String, u64>,
   historical: &IndexMap<String, u64>,
   index: &ContributorIndex,
) -> Vec<ProportionShift> {
   let recent_total: u64 = recent.values().sum();
   let historical_total: u64 = historical.values().sum();
   if recent_total < SHIFT_MIN_RECENT_COMMITS {
      return Vec::new();
   }

   let mut shifts: Vec<ProportionShift> = recent
      .iter()
      .filter_map(|(id, &recent_commits)| {
         let share_recent = 100.0 * recent_commits as f64 / recent_total as f64;
         let share_historical = if historical_total == 0 {
            0.0
         } else {
            100.0 * historical.get(id).copied().unwrap_or(0) as f64 / historical_total as f64
         };
         if share_historical >= SHIFT_MAX_HISTORICAL_SHARE {
            return None;
         }
         Some(ProportionShift {
            id: id.clone(),
            name: index
               .get(id)
               .map_or_else(|| id.clone(), |c| c.display_name.clone()),
            share_recent,
            share_historical,
            shift: share_recent - share_historical,
         })
      })
      .collect();

   shifts.sort_by(|a, b| {
      b.shift
         .partial_cmp(&a.shift)
         .unwrap_or(std::cmp::Ordering::Equal)
         .then_with(|| a.id.cmp(&b.id))
   });
   shifts
}

#[cfg(test)]
mod tests {
   use chrono::TimeZone;

   use super::*;

   fn commit(name: &str, email: &str, time: DateTime<Utc>) -> RawCommit {
      RawCommit {
         sha:          format!("{name}-{}", time.timestamp()),
         author_name:  name.to_string(),
         author_email: email.to_string(),
         author_time:  time,
         message:      "change".to_string(),
      }
   }

   fn as_of() -> DateTime<Utc> {
      Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
   }

   fn recent_time(n: u32) -> DateTime<Utc> {
      Utc.with_ymd_and_hms(2024, 1, 1, n, 0, 0).unwrap()
   }

   fn old_time(n: u32) -> DateTime<Utc> {
      Utc.with_ymd_and_hms(2019, 1, 1, n, 0, 0).unwrap()
   }

   // ========== Concentration Tests ==========

   #[test]
   fn test_recent_and_lifetime_concentration() {
      let mut commits = Vec::new();
      for n in 0..3 {
         commits.push(commit("Alice", "alice@x.example", recent_time(n)));
      }
      commits.push(commit("Bob", "bob@x.example", recent_time(10)));
      for n in 0..6 {
         commits.push(commit("Bob", "bob@x.example", old_time(n)));
      }
      let index = ContributorIndex::from_commits(&commits);
      let stats = aggregate(&commits, &index, as_of()).unwrap();

      // Recent: Alice 3/4 = 75%
      assert_eq!(stats.recent_concentration, Some(75.0));
      // Lifetime: Bob 7/10 = 70%
      assert_eq!(stats.lifetime_concentration, Some(70.0));
      assert_eq!(stats.commits_per_year_recent, 4);
      assert_eq!(stats.unique_contributors_recent, 2);
      assert_eq!(stats.total_commits, 10);
   }

   #[test]
   fn test_empty_recent_window_reports_none() {
      let commits = vec![commit("Alice", "alice@x.example", old_time(0))];
      let index = ContributorIndex::from_commits(&commits);
      let stats = aggregate(&commits, &index, as_of()).unwrap();
      assert_eq!(stats.recent_concentration, None);
      assert_eq!(stats.commits_per_year_recent, 0);
      assert_eq!(stats.lifetime_concentration, Some(100.0));
   }

   #[test]
   fn test_no_commits_at_all() {
      let index = ContributorIndex::from_commits(&[]);
      let stats = aggregate(&[], &index, as_of()).unwrap();
      assert_eq!(stats.recent_concentration, None);
      assert_eq!(stats.lifetime_concentration, None);
      assert_eq!(stats.total_commits, 0);
   }

   #[test]
   fn test_bots_excluded_from_tables_but_counted_in_total() {
      let commits = vec![
         commit("Alice", "alice@x.example", recent_time(0)),
         commit("dependabot[bot]", "dep@bots.noreply.github.com", recent_time(1)),
         commit("dependabot[bot]", "dep@bots.noreply.github.com", recent_time(2)),
      ];
      let index = ContributorIndex::from_commits(&commits);
      let stats = aggregate(&commits, &index, as_of()).unwrap();
      // Alice is 100% of the non-bot table
      assert_eq!(stats.recent_concentration, Some(100.0));
      assert_eq!(stats.unique_contributors_recent, 1);
      assert_eq!(stats.commits_per_year_recent, 1);
      // Partition law counts every commit
      assert_eq!(stats.total_commits, 3);
   }

   #[test]
   fn test_commit_after_as_of_violates_invariant() {
      let commits = vec![commit("Alice", "alice@x.example", Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())];
      let index = ContributorIndex::from_commits(&commits);
      assert!(matches!(
         aggregate(&commits, &index, as_of()).unwrap_err(),
         OssuaryError::Invariant(_)
      ));
   }

   // ========== Proportion Shift Tests ==========

   #[test]
   fn test_shift_for_newcomer() {
      let mut commits = Vec::new();
      // Historical: maintainer owns everything
      for n in 0..20 {
         commits.push(commit("Maint", "maint@x.example", old_time(n)));
      }
      // Recent: newcomer takes 60% of 5 commits
      for n in 0..3 {
         commits.push(commit("New", "new@x.example", recent_time(n)));
      }
      commits.push(commit("Maint", "maint@x.example", recent_time(10)));
      commits.push(commit("Maint", "maint@x.example", recent_time(11)));

      let index = ContributorIndex::from_commits(&commits);
      let stats = aggregate(&commits, &index, as_of()).unwrap();
      let shift = stats
         .proportion_shifts
         .iter()
         .find(|s| s.id == "new@x.example")
         .expect("newcomer shift present");
      assert!((shift.shift - 60.0).abs() < 0.01);
      // The maintainer has 100% historical share: excluded.
      assert!(!stats.proportion_shifts.iter().any(|s| s.id == "maint@x.example"));
   }

   #[test]
   fn test_shift_requires_five_recent_commits() {
      let mut commits = Vec::new();
      for n in 0..20 {
         commits.push(commit("Maint", "maint@x.example", old_time(n)));
      }
      commits.push(commit("New", "new@x.example", recent_time(0)));
      let index = ContributorIndex::from_commits(&commits);
      let stats = aggregate(&commits, &index, as_of()).unwrap();
      assert!(stats.proportion_shifts.is_empty());
   }

   #[test]
   fn test_shift_excludes_bots() {
      let mut commits = Vec::new();
      for n in 0..20 {
         commits.push(commit("Maint", "maint@x.example", old_time(n)));
      }
      for n in 0..5 {
         commits.push(commit("renovate[bot]", "r@bots.noreply.github.com", recent_time(n)));
      }
      commits.push(commit("Maint", "maint@x.example", recent_time(10)));
      let index = ContributorIndex::from_commits(&commits);
      let stats = aggregate(&commits, &index, as_of()).unwrap();
      assert!(!stats.proportion_shifts.iter().any(|s| s.id.contains("bot")));
   }

   #[test]
   fn test_partition_law_holds() {
      let mut commits = Vec::new();
      for n in 0..7 {
         commits.push(commit("A", "a@x.example", old_time(n)));
      }
      for n in 0..5 {
         commits.push(commit("B", "b@x.example", recent_time(n)));
      }
      let index = ContributorIndex::from_commits(&commits);
      let stats = aggregate(&commits, &index, as_of()).unwrap();
      let lifetime_total: u64 = stats.lifetime_table.iter().map(|c| c.commits).sum();
      assert_eq!(lifetime_total, 12);
      assert_eq!(stats.total_commits, 12);
   }

   #[test]
   fn test_window_boundary_exactly_twelve_months() {
      // A commit exactly at as_of - 12 months is historical, one second
      // later is recent.
      let boundary = as_of().checked_sub_months(Months::new(12)).unwrap();
      let commits = vec![
         commit("A", "a@x.example", boundary),
         commit("B", "b@x.example", boundary + chrono::Duration::seconds(1)),
      ];
      let index = ContributorIndex::from_commits(&commits);
      let stats = aggregate(&commits, &index, as_of()).unwrap();
      assert_eq!(stats.commits_per_year_recent, 1);
      assert_eq!(stats.recent_table[0].id, "b@x.example");
   }
}
