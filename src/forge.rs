//! Forge (GitHub) metadata collection.
//!
//! Acquires the repository record, owner/org structure, contributor list,
//! releases, an issue-title sample for the sentiment pass, the sponsors and
//! CII best-practices flags, and the top maintainer's profile. Calls are
//! paced by the shared per-host bucket; an auth token raises the budget from
//! 60 to 5000 requests per hour.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
   config::OssuaryConfig,
   error::{OssuaryError, Result},
   ratelimit::{
      GITHUB_AUTHENTICATED_PER_HOUR, GITHUB_UNAUTHENTICATED_PER_HOUR, RateLimiter, retry_transient,
   },
   types::{ForgeContributor, ForgeRecord, MaintainerProfile, OwnerKind, RepositoryRef},
};

const API_HOST: &str = "api.github.com";
/// Org admin listings are bounded; past this the count stops mattering.
const MAX_ADMIN_COUNT: usize = 50;
const CONTRIBUTOR_SAMPLE: usize = 30;
const ISSUE_SAMPLE: usize = 50;

pub struct ForgeClient {
   http:               reqwest::blocking::Client,
   token:              Option<String>,
   limiter:            Arc<RateLimiter>,
   max_retries:        u32,
   initial_backoff_ms: u64,
}

impl ForgeClient {
   pub fn new(config: &OssuaryConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
      let http = reqwest::blocking::Client::builder()
         .timeout(Duration::from_secs(config.request_timeout_secs))
         .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
         .user_agent(concat!("ossuary/", env!("CARGO_PKG_VERSION")))
         .build()?;

      let per_hour = if config.github_token.is_some() {
         GITHUB_AUTHENTICATED_PER_HOUR
      } else {
         GITHUB_UNAUTHENTICATED_PER_HOUR
      };
      limiter.set_budget(API_HOST, per_hour.min(60), per_hour);

      Ok(Self {
         http,
         token: config.github_token.clone(),
         limiter,
         max_retries: config.max_retries,
         initial_backoff_ms: config.initial_backoff_ms,
      })
   }

   /// Collect the full forge record for a resolved GitHub repository.
   pub fn collect(&self, repo: &RepositoryRef) -> Result<ForgeRecord> {
      if !repo.is_github() {
         return Err(OssuaryError::UnresolvedRepo {
            ecosystem: "github".to_string(),
            name:      repo.slug(),
            reason:    format!("unsupported forge host: {}", repo.host),
         });
      }

      let repo_doc = self
         .api_json(&format!("/repos/{}", repo.slug()))?
         .ok_or_else(|| OssuaryError::RepoGone(format!("{} not found on GitHub", repo.slug())))?;

      let owner_login = repo_doc
         .pointer("/owner/login")
         .and_then(Value::as_str)
         .unwrap_or(&repo.owner)
         .to_string();
      let owner_kind = match repo_doc.pointer("/owner/type").and_then(Value::as_str) {
         Some("Organization") => Some(OwnerKind::Organization),
         Some("User") => Some(OwnerKind::User),
         _ => None,
      };

      let (admin_count, member_count) = if matches!(owner_kind, Some(OwnerKind::Organization)) {
         (self.org_admin_count(&owner_login), self.org_member_count(&owner_login))
      } else {
         (None, None)
      };

      let contributors = self.contributors(repo)?;
      let (releases_count, release_notes) = self.releases(repo)?;
      let issue_titles = self.issue_titles(repo)?;

      let maintainer = contributors
         .iter()
         .find(|c| !c.login.ends_with("[bot]"))
         .and_then(|top| self.maintainer_profile(&top.login).ok());

      Ok(ForgeRecord {
         stars: repo_doc.get("stargazers_count").and_then(Value::as_u64).unwrap_or(0),
         default_branch: repo_doc
            .get("default_branch")
            .and_then(Value::as_str)
            .map(str::to_string),
         pushed_at: parse_time(&repo_doc, "pushed_at"),
         created_at: parse_time(&repo_doc, "created_at"),
         archived: repo_doc.get("archived").and_then(Value::as_bool).unwrap_or(false),
         has_sponsors: self.has_sponsors(&owner_login),
         open_issues_count: repo_doc
            .get("open_issues_count")
            .and_then(Value::as_u64)
            .unwrap_or(0),
         releases_count,
         owner_kind,
         admin_count,
         member_count,
         contributors,
         issue_titles,
         release_notes,
         cii_badge: self.cii_badge(&repo.url),
         maintainer,
      })
   }

   fn contributors(&self, repo: &RepositoryRef) -> Result<Vec<ForgeContributor>> {
      let doc = self
         .api_json(&format!("/repos/{}/contributors?per_page={CONTRIBUTOR_SAMPLE}", repo.slug()))?
         .unwrap_or(Value::Array(vec![]));
      Ok(parse_contributors(&doc))
   }

   fn releases(&self, repo: &RepositoryRef) -> Result<(u64, Vec<String>)> {
      let doc = self
         .api_json(&format!("/repos/{}/releases?per_page=100", repo.slug()))?
         .unwrap_or(Value::Array(vec![]));
      let list = doc.as_array().cloned().unwrap_or_default();
      let notes = list
         .iter()
         .take(10)
         .filter_map(|r| r.get("name").and_then(Value::as_str))
         .filter(|s| !s.is_empty())
         .map(str::to_string)
         .collect();
      Ok((list.len() as u64, notes))
   }

   fn issue_titles(&self, repo: &RepositoryRef) -> Result<Vec<String>> {
      let doc = self
         .api_json(&format!(
            "/repos/{}/issues?state=all&per_page={ISSUE_SAMPLE}&sort=created&direction=desc",
            repo.slug()
         ))?
         .unwrap_or(Value::Array(vec![]));
      Ok(doc
         .as_array()
         .map(|list| {
            list
               .iter()
               .filter_map(|i| i.get("title").and_then(Value::as_str))
               .map(str::to_string)
               .collect()
         })
         .unwrap_or_default())
   }

   /// Admin-role member count for an organization, upper-bounded at 50.
   /// Listing admins needs org scope; any failure reads as unknown.
   fn org_admin_count(&self, org: &str) -> Option<u32> {
      let doc = self
         .api_json(&format!("/orgs/{org}/members?role=admin&per_page={MAX_ADMIN_COUNT}"))
         .ok()
         .flatten()?;
      doc.as_array().map(|list| list.len().min(MAX_ADMIN_COUNT) as u32)
   }

   fn org_member_count(&self, org: &str) -> Option<u32> {
      let doc = self
         .api_json(&format!("/orgs/{org}/public_members?per_page=100"))
         .ok()
         .flatten()?;
      doc.as_array().map(|list| list.len() as u32)
   }

   /// Whether the owner has a live GitHub Sponsors page.
   fn has_sponsors(&self, owner: &str) -> bool {
      let probe = || -> Result<bool> {
         self.limiter.acquire("github.com")?;
         let response = self.http.get(format!("https://github.com/sponsors/{owner}")).send()?;
         Ok(response.status().is_success())
      };
      probe().unwrap_or(false)
   }

   /// CII best-practices badge lookup, keyed on the repository URL.
   fn cii_badge(&self, repo_url: &str) -> bool {
      let lookup = || -> Result<bool> {
         let url = format!(
            "https://bestpractices.coreinfrastructure.org/projects.json?url={repo_url}"
         );
         self.limiter.acquire("bestpractices.coreinfrastructure.org")?;
         let response = self.http.get(&url).send()?;
         if !response.status().is_success() {
            return Ok(false);
         }
         let doc: Value = response.json()?;
         Ok(doc.as_array().is_some_and(|list| !list.is_empty()))
      };
      lookup().unwrap_or(false)
   }

   /// Portfolio profile for the top commit author.
   fn maintainer_profile(&self, login: &str) -> Result<MaintainerProfile> {
      let user = self
         .api_json(&format!("/users/{login}"))?
         .ok_or_else(|| OssuaryError::Transient(format!("user {login} not found")))?;

      let repos = self
         .api_json(&format!("/users/{login}/repos?per_page=100&type=owner"))?
         .unwrap_or(Value::Array(vec![]));
      let (owned_repos, starred_repos, stars_total) = portfolio_stats(&repos);

      let orgs = self
         .api_json(&format!("/users/{login}/orgs?per_page=100"))?
         .unwrap_or(Value::Array(vec![]));
      let org_memberships = orgs
         .as_array()
         .map(|list| {
            list
               .iter()
               .filter_map(|o| o.get("login").and_then(Value::as_str))
               .map(str::to_string)
               .collect()
         })
         .unwrap_or_default();

      Ok(MaintainerProfile {
         login: login.to_string(),
         account_age_years: parse_time(&user, "created_at")
            .map(|created| years_between(created, Utc::now()))
            .unwrap_or(0.0),
         owned_repos,
         starred_repos,
         stars_total,
         sponsors_count: self.sponsors_count(login),
         org_memberships,
         // Registry-side signals; the forge cannot see package ownership.
         maintained_packages_count: 0,
         top_maintainer: false,
      })
   }

   /// Sponsor count via GraphQL; needs a token, reads as 0 without one.
   fn sponsors_count(&self, login: &str) -> u32 {
      let Some(token) = &self.token else {
         return 0;
      };
      let query = || -> Result<u32> {
         self.limiter.acquire(API_HOST)?;
         let body = serde_json::json!({
            "query": format!("query {{ user(login: \"{login}\") {{ sponsors {{ totalCount }} }} }}")
         });
         let response = self
            .http
            .post(format!("https://{API_HOST}/graphql"))
            .bearer_auth(token)
            .json(&body)
            .send()?;
         let doc: Value = response.json()?;
         Ok(doc
            .pointer("/data/user/sponsors/totalCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32)
      };
      query().unwrap_or(0)
   }

   /// Rate-limited, retried GET against the REST API; `None` means 404.
   fn api_json(&self, path: &str) -> Result<Option<Value>> {
      let url = format!("https://{API_HOST}{path}");
      retry_transient(self.max_retries, self.initial_backoff_ms, || {
         self.limiter.acquire(API_HOST)?;
         let mut request = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json");
         if let Some(token) = &self.token {
            request = request.bearer_auth(token);
         }
         let response = request.send()?;
         let status = response.status();
         match status.as_u16() {
            404 => Ok(None),
            403 | 451 => Err(OssuaryError::RepoGone(format!("{url} returned HTTP {status}"))),
            429 => Err(OssuaryError::Transient(format!("{url} rate limited"))),
            s if status.is_server_error() => {
               Err(OssuaryError::Transient(format!("{url} returned HTTP {s}")))
            },
            _ if !status.is_success() => {
               Err(OssuaryError::Input(format!("{url} returned HTTP {status}")))
            },
            _ => Ok(Some(response.json()?)),
         }
      })
   }
}

fn parse_time(doc: &Value, field: &str) -> Option<DateTime<Utc>> {
   doc
      .get(field)
      .and_then(Value::as_str)
      .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
      .map(|t| t.with_timezone(&Utc))
}

pub fn years_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
   (later - earlier).num_days() as f64 / 365.25
}

fn parse_contributors(doc: &Value) -> Vec<ForgeContributor> {
   doc
      .as_array()
      .map(|list| {
         list
            .iter()
            .filter_map(|c| {
               Some(ForgeContributor {
                  login:         c.get("login")?.as_str()?.to_string(),
                  contributions: c.get("contributions").and_then(Value::as_u64).unwrap_or(0),
               })
            })
            .collect()
      })
      .unwrap_or_default()
}

/// `(owned_repos, repos with >= 10 stars, total stars)` over a repo listing.
fn portfolio_stats(repos: &Value) -> (u32, u32, u64) {
   let Some(list) = repos.as_array() else {
      return (0, 0, 0);
   };
   let mut starred = 0u32;
   let mut total = 0u64;
   for repo in list {
      let stars = repo.get("stargazers_count").and_then(Value::as_u64).unwrap_or(0);
      total += stars;
      if stars >= 10 {
         starred += 1;
      }
   }
   (list.len() as u32, starred, total)
}

#[cfg(test)]
mod tests {
   use chrono::TimeZone;
   use serde_json::json;

   use super::*;

   // ========== parse_contributors Tests ==========

   #[test]
   fn test_parse_contributors() {
      let doc = json!([
         { "login": "alice", "contributions": 500 },
         { "login": "dependabot[bot]", "contributions": 40 },
         { "login": "bob" }
      ]);
      let list = parse_contributors(&doc);
      assert_eq!(list.len(), 3);
      assert_eq!(list[0].login, "alice");
      assert_eq!(list[0].contributions, 500);
      assert_eq!(list[2].contributions, 0);
   }

   #[test]
   fn test_parse_contributors_non_array() {
      assert!(parse_contributors(&json!({"message": "Not Found"})).is_empty());
   }

   // ========== portfolio_stats Tests ==========

   #[test]
   fn test_portfolio_stats() {
      let repos = json!([
         { "stargazers_count": 120 },
         { "stargazers_count": 9 },
         { "stargazers_count": 10 },
         {}
      ]);
      let (owned, starred, total) = portfolio_stats(&repos);
      assert_eq!(owned, 4);
      assert_eq!(starred, 2);
      assert_eq!(total, 139);
   }

   // ========== time helpers ==========

   #[test]
   fn test_parse_time() {
      let doc = json!({ "created_at": "2015-06-01T12:00:00Z" });
      let t = parse_time(&doc, "created_at").unwrap();
      assert_eq!(t, Utc.with_ymd_and_hms(2015, 6, 1, 12, 0, 0).unwrap());
      assert!(parse_time(&doc, "pushed_at").is_none());
   }

   #[test]
   fn test_years_between() {
      let a = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
      let b = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
      let years = years_between(a, b);
      assert!((years - 10.0).abs() < 0.05);
   }
}
