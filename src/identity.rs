//! Contributor identity normalization.
//!
//! Collapses the many `(author_name, author_email)` spellings one person
//! leaves in a git history into a single stable key, so concentration and
//! takeover math counts people, not strings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{config::KNOWN_BOTS, types::RawCommit};

/// Personal mail providers collapse to one domain class so `foo@gmail.com`
/// and `foo@outlook.com` normalize to the same key.
const PERSONAL_PROVIDERS: &[&str] =
   &["gmail.com", "outlook.com", "yahoo.com", "hotmail.com", "protonmail.com"];

const GITHUB_NOREPLY: &str = "users.noreply.github.com";
const GITHUB_BOT_NOREPLY: &str = "bots.noreply.github.com";

/// A canonical contributor after aggregation. Immutable once the index is
/// finalized.
#[derive(Debug, Clone)]
pub struct Contributor {
   pub id:           String,
   pub display_name: String,
   pub emails:       Vec<String>,
   pub names:        Vec<String>,
   pub is_bot:       bool,
   pub first_commit: DateTime<Utc>,
   pub last_commit:  DateTime<Utc>,
   pub commit_count: u64,
}

/// Classify an email's domain: GitHub noreply relays become `github` (with
/// the login promoted to the local part by the caller), personal providers
/// collapse to `personal`, everything else is preserved.
fn split_email(email: &str) -> (String, String) {
   let lower = email.trim().to_ascii_lowercase();
   match lower.split_once('@') {
      Some((local, domain)) => (local.to_string(), domain.to_string()),
      None => (lower, String::new()),
   }
}

/// Extract the GitHub login from a noreply local part
/// (`12345+login` or plain `login`).
fn noreply_login(local: &str) -> String {
   local.split_once('+').map_or(local, |(_, login)| login).to_string()
}

/// The primary normalized key for a `(name, email)` author tuple.
pub fn normalize_key(_name: &str, email: &str) -> String {
   let (local, domain) = split_email(email);
   if domain == GITHUB_NOREPLY {
      return format!("{}@github", noreply_login(&local));
   }
   if PERSONAL_PROVIDERS.contains(&domain.as_str()) {
      return format!("{local}@personal");
   }
   if domain.is_empty() {
      return local;
   }
   format!("{local}@{domain}")
}

/// Bot detection: `[bot]` markers, the bot noreply domain, or a known bot
/// account name.
pub fn is_bot(name: &str, email: &str) -> bool {
   let name_lower = name.to_ascii_lowercase();
   let email_lower = email.to_ascii_lowercase();
   if name_lower.contains("[bot]") || email_lower.contains("[bot]") {
      return true;
   }
   if email_lower.ends_with(&format!("@{GITHUB_BOT_NOREPLY}")) {
      return true;
   }
   KNOWN_BOTS.iter().any(|bot| name_lower == *bot || name_lower == format!("{bot}[bot]"))
}

/// Local part with any `+tag` suffix stripped, for the merge pass.
fn canonical_local(local: &str) -> String {
   local.split_once('+').map_or(local, |(base, _)| base).to_string()
}

/// Display name folded to lowercase ASCII for the merge pass.
fn fold_name(name: &str) -> String {
   name
      .chars()
      .filter(|c| c.is_ascii_alphanumeric())
      .collect::<String>()
      .to_ascii_lowercase()
}

/// Merge-pass features of one primary key: two keys referring to the same
/// person share at least two of these.
#[derive(Debug, Default)]
struct KeyFeatures {
   locals:       Vec<String>,
   github_login: Option<String>,
   names:        Vec<String>,
}

#[derive(Debug, Default)]
struct PendingContributor {
   emails:       Vec<String>,
   names:        Vec<String>,
   is_bot:       bool,
   first_commit: Option<DateTime<Utc>>,
   last_commit:  Option<DateTime<Utc>>,
   commit_count: u64,
   features:     KeyFeatures,
}

impl PendingContributor {
   fn observe(&mut self, commit: &RawCommit) {
      let (local, domain) = split_email(&commit.author_email);
      if domain == GITHUB_NOREPLY {
         self.features.github_login = Some(noreply_login(&local));
         push_unique(&mut self.features.locals, canonical_local(&noreply_login(&local)));
      } else {
         push_unique(&mut self.features.locals, canonical_local(&local));
      }
      push_unique(&mut self.features.names, fold_name(&commit.author_name));

      push_unique(&mut self.emails, commit.author_email.to_ascii_lowercase());
      push_unique(&mut self.names, commit.author_name.clone());
      self.is_bot |= is_bot(&commit.author_name, &commit.author_email);

      let t = commit.author_time;
      self.first_commit = Some(self.first_commit.map_or(t, |f| f.min(t)));
      self.last_commit = Some(self.last_commit.map_or(t, |l| l.max(t)));
      self.commit_count += 1;
   }

   fn shared_features(&self, other: &Self) -> usize {
      let mut shared = 0;
      if self.features.locals.iter().any(|l| other.features.locals.contains(l)) {
         shared += 1;
      }
      if let (Some(a), Some(b)) = (&self.features.github_login, &other.features.github_login)
         && a == b
      {
         shared += 1;
      }
      // A GitHub login equal to the other key's email local also ties the
      // two accounts together (sindre@gmail.com vs
      // sindresorhus@users.noreply.github.com when names match).
      if let Some(login) = &self.features.github_login
         && other.features.locals.contains(login)
      {
         shared += 1;
      } else if let Some(login) = &other.features.github_login
         && self.features.locals.contains(login)
      {
         shared += 1;
      }
      if self
         .features
         .names
         .iter()
         .any(|n| !n.is_empty() && other.features.names.contains(n))
      {
         shared += 1;
      }
      shared
   }
}

fn push_unique(list: &mut Vec<String>, value: String) {
   if !value.is_empty() && !list.contains(&value) {
      list.push(value);
   }
}

/// Builds the canonical contributor table from raw commits and answers
/// key-resolution queries afterwards.
#[derive(Debug, Default)]
pub struct ContributorIndex {
   /// Primary key -> canonical key (identity for unmerged keys).
   canonical: HashMap<String, String>,
   contributors: Vec<Contributor>,
   by_id: HashMap<String, usize>,
}

impl ContributorIndex {
   pub fn from_commits(commits: &[RawCommit]) -> Self {
      let mut pending: HashMap<String, PendingContributor> = HashMap::new();
      let mut order: Vec<String> = Vec::new();

      for commit in commits {
         let key = normalize_key(&commit.author_name, &commit.author_email);
         if !pending.contains_key(&key) {
            order.push(key.clone());
         }
         pending.entry(key).or_default().observe(commit);
      }

      // Secondary pass: merge keys sharing at least two identity features.
      // Later-seen keys fold into earlier-seen ones.
      let mut canonical: HashMap<String, String> = HashMap::new();
      for key in &order {
         canonical.insert(key.clone(), key.clone());
      }
      for i in 0..order.len() {
         for j in (i + 1)..order.len() {
            let (a, b) = (&order[i], &order[j]);
            let root_a = resolve(&canonical, a);
            let root_b = resolve(&canonical, b);
            if root_a == root_b {
               continue;
            }
            if pending[a].shared_features(&pending[b]) >= 2 {
               canonical.insert(root_b, root_a);
            }
         }
      }

      // Fold merged pending records into their canonical roots.
      let mut merged: HashMap<String, PendingContributor> = HashMap::new();
      let mut merged_order: Vec<String> = Vec::new();
      for key in &order {
         let root = resolve(&canonical, key);
         let source = pending.remove(key).unwrap_or_default();
         let entry = merged.entry(root.clone()).or_insert_with(|| {
            merged_order.push(root.clone());
            PendingContributor::default()
         });
         entry.commit_count += source.commit_count;
         entry.is_bot |= source.is_bot;
         for email in source.emails {
            push_unique(&mut entry.emails, email);
         }
         for name in source.names {
            push_unique(&mut entry.names, name);
         }
         entry.first_commit = match (entry.first_commit, source.first_commit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
         };
         entry.last_commit = match (entry.last_commit, source.last_commit) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
         };
      }

      let mut contributors: Vec<Contributor> = merged_order
         .iter()
         .filter_map(|id| {
            let p = merged.remove(id)?;
            Some(Contributor {
               id: id.clone(),
               display_name: p.names.first().cloned().unwrap_or_else(|| id.clone()),
               emails: p.emails,
               names: p.names,
               is_bot: p.is_bot,
               first_commit: p.first_commit?,
               last_commit: p.last_commit?,
               commit_count: p.commit_count,
            })
         })
         .collect();

      // Deterministic order: commit count desc, earliest first-commit asc,
      // id asc.
      contributors.sort_by(|a, b| {
         b.commit_count
            .cmp(&a.commit_count)
            .then(a.first_commit.cmp(&b.first_commit))
            .then(a.id.cmp(&b.id))
      });

      let by_id = contributors
         .iter()
         .enumerate()
         .map(|(idx, c)| (c.id.clone(), idx))
         .collect();

      // Flatten the canonical chains so lookups stay O(1).
      let flat: HashMap<String, String> = order
         .iter()
         .map(|key| (key.clone(), resolve(&canonical, key)))
         .collect();

      Self { canonical: flat, contributors, by_id }
   }

   /// Canonical id for an author tuple. Stable: the same `(name, email)`
   /// always yields the same id for a given index.
   pub fn canonical_id(&self, name: &str, email: &str) -> String {
      let key = normalize_key(name, email);
      self.canonical.get(&key).cloned().unwrap_or(key)
   }

   pub fn contributors(&self) -> &[Contributor] {
      &self.contributors
   }

   pub fn get(&self, id: &str) -> Option<&Contributor> {
      self.by_id.get(id).map(|&idx| &self.contributors[idx])
   }
}

fn resolve(canonical: &HashMap<String, String>, key: &str) -> String {
   let mut current = key.to_string();
   while let Some(next) = canonical.get(&current) {
      if *next == current {
         break;
      }
      current = next.clone();
   }
   current
}
