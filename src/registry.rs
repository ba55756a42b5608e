//! Package-registry collectors.
//!
//! One adapter per ecosystem behind a single `fetch` contract: given a
//! package name, learn the upstream repository URL, the latest version, and
//! weekly downloads where the registry publishes them. Absent data stays
//! absent — the scorer treats missing fields as factor-neutral.

use std::{sync::Arc, time::Duration};

use serde_json::Value;

use crate::{
   config::OssuaryConfig,
   error::{OssuaryError, Result},
   ratelimit::{RateLimiter, retry_transient},
   types::{Ecosystem, PackageIdentity, RegistryRecord},
};

pub struct RegistryClient {
   http:               reqwest::blocking::Client,
   limiter:            Arc<RateLimiter>,
   max_retries:        u32,
   initial_backoff_ms: u64,
}

impl RegistryClient {
   pub fn new(config: &OssuaryConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
      let http = reqwest::blocking::Client::builder()
         .timeout(Duration::from_secs(config.request_timeout_secs))
         .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
         .user_agent(concat!("ossuary/", env!("CARGO_PKG_VERSION")))
         .build()?;
      Ok(Self {
         http,
         limiter,
         max_retries: config.max_retries,
         initial_backoff_ms: config.initial_backoff_ms,
      })
   }

   /// Fetch registry metadata for a package. Returns `UnresolvedRepo` when
   /// the registry has never heard of the package.
   pub fn fetch(&self, package: &PackageIdentity) -> Result<RegistryRecord> {
      match package.ecosystem {
         Ecosystem::Npm => self.fetch_npm(package),
         Ecosystem::Pypi => self.fetch_pypi(package),
         Ecosystem::Cargo => self.fetch_cargo(package),
         Ecosystem::Rubygems => self.fetch_rubygems(package),
         Ecosystem::Packagist => self.fetch_packagist(package),
         Ecosystem::Nuget => self.fetch_nuget(package),
         Ecosystem::Go => self.fetch_go(package),
         Ecosystem::Github => Ok(RegistryRecord {
            repo_url: Some(format!("https://github.com/{}", package.name)),
            ..RegistryRecord::default()
         }),
      }
   }

   fn fetch_npm(&self, package: &PackageIdentity) -> Result<RegistryRecord> {
      let manifest = self
         .get_json(&format!("https://registry.npmjs.org/{}", package.name))?
         .ok_or_else(|| not_found(package))?;

      let latest_version = manifest
         .pointer("/dist-tags/latest")
         .and_then(Value::as_str)
         .map(str::to_string);
      let maintainers = manifest
         .get("maintainers")
         .and_then(Value::as_array)
         .map(|list| {
            list
               .iter()
               .filter_map(|m| m.get("name").and_then(Value::as_str))
               .map(str::to_string)
               .collect()
         })
         .unwrap_or_default();

      // Downloads live on a separate API; its absence never fails the fetch.
      let downloads_per_week = self
         .get_json(&format!("https://api.npmjs.org/downloads/point/last-week/{}", package.name))
         .ok()
         .flatten()
         .and_then(|v| v.get("downloads").and_then(Value::as_u64));

      Ok(RegistryRecord {
         repo_url: npm_repo_url(&manifest),
         downloads_per_week,
         latest_version,
         publish_dates: npm_publish_dates(&manifest),
         maintainers,
      })
   }

   fn fetch_pypi(&self, package: &PackageIdentity) -> Result<RegistryRecord> {
      let doc = self
         .get_json(&format!("https://pypi.org/pypi/{}/json", package.name))?
         .ok_or_else(|| not_found(package))?;
      let info = doc.get("info").cloned().unwrap_or(Value::Null);

      Ok(RegistryRecord {
         repo_url: pypi_repo_url(&info),
         // PyPI stopped publishing download counts on the JSON API.
         downloads_per_week: None,
         latest_version: info.get("version").and_then(Value::as_str).map(str::to_string),
         publish_dates: Vec::new(),
         maintainers: Vec::new(),
      })
   }

   fn fetch_cargo(&self, package: &PackageIdentity) -> Result<RegistryRecord> {
      let doc = self
         .get_json(&format!("https://crates.io/api/v1/crates/{}", package.name))?
         .ok_or_else(|| not_found(package))?;
      let krate = doc.get("crate").cloned().unwrap_or(Value::Null);

      // crates.io reports 90-day downloads; scale to a weekly figure.
      let downloads_per_week = krate
         .get("recent_downloads")
         .and_then(Value::as_u64)
         .map(|recent| recent / 13);

      Ok(RegistryRecord {
         repo_url: krate
            .get("repository")
            .and_then(Value::as_str)
            .map(str::to_string),
         downloads_per_week,
         latest_version: krate
            .get("newest_version")
            .and_then(Value::as_str)
            .map(str::to_string),
         publish_dates: Vec::new(),
         maintainers: Vec::new(),
      })
   }

   fn fetch_rubygems(&self, package: &PackageIdentity) -> Result<RegistryRecord> {
      let doc = self
         .get_json(&format!("https://rubygems.org/api/v1/gems/{}.json", package.name))?
         .ok_or_else(|| not_found(package))?;

      let repo_url = doc
         .get("source_code_uri")
         .and_then(Value::as_str)
         .filter(|s| !s.is_empty())
         .or_else(|| doc.get("homepage_uri").and_then(Value::as_str).filter(|s| !s.is_empty()))
         .map(str::to_string);

      Ok(RegistryRecord {
         repo_url,
         // rubygems.org exposes lifetime totals only.
         downloads_per_week: None,
         latest_version: doc.get("version").and_then(Value::as_str).map(str::to_string),
         publish_dates: Vec::new(),
         maintainers: Vec::new(),
      })
   }

   fn fetch_packagist(&self, package: &PackageIdentity) -> Result<RegistryRecord> {
      let doc = self
         .get_json(&format!("https://packagist.org/packages/{}.json", package.name))?
         .ok_or_else(|| not_found(package))?;
      let pkg = doc.get("package").cloned().unwrap_or(Value::Null);

      let downloads_per_week = pkg
         .pointer("/downloads/monthly")
         .and_then(Value::as_u64)
         .map(|monthly| monthly / 4);

      Ok(RegistryRecord {
         repo_url: pkg
            .get("repository")
            .and_then(Value::as_str)
            .map(str::to_string),
         downloads_per_week,
         latest_version: None,
         publish_dates: Vec::new(),
         maintainers: Vec::new(),
      })
   }

   fn fetch_nuget(&self, package: &PackageIdentity) -> Result<RegistryRecord> {
      let doc = self
         .get_json(&format!(
            "https://azuresearch-usnc.nuget.org/query?q=packageid:{}&take=1",
            package.name
         ))?
         .ok_or_else(|| not_found(package))?;
      let hit = doc
         .pointer("/data/0")
         .cloned()
         .ok_or_else(|| not_found(package))?;

      Ok(RegistryRecord {
         repo_url: hit
            .get("projectUrl")
            .and_then(Value::as_str)
            .map(str::to_string),
         downloads_per_week: None,
         latest_version: hit.get("version").and_then(Value::as_str).map(str::to_string),
         publish_dates: Vec::new(),
         maintainers: Vec::new(),
      })
   }

   fn fetch_go(&self, package: &PackageIdentity) -> Result<RegistryRecord> {
      let module = package.name.trim_start_matches("https://");
      let latest_version = self
         .get_json(&format!("https://proxy.golang.org/{}/@latest", module.to_ascii_lowercase()))
         .ok()
         .flatten()
         .and_then(|v| v.get("Version").and_then(Value::as_str).map(str::to_string));

      // Modules hosted on a known forge carry their repo in the module path;
      // vanity import paths stay unresolved here.
      let repo_url = if module.starts_with("github.com/") || module.starts_with("gitlab.com/") {
         Some(format!("https://{module}"))
      } else {
         None
      };

      Ok(RegistryRecord {
         repo_url,
         downloads_per_week: None,
         latest_version,
         publish_dates: Vec::new(),
         maintainers: Vec::new(),
      })
   }

   /// Rate-limited GET returning parsed JSON; `None` means HTTP 404.
   fn get_json(&self, url: &str) -> Result<Option<Value>> {
      let host = host_of(url);
      retry_transient(self.max_retries, self.initial_backoff_ms, || {
         self.limiter.acquire(&host)?;
         let response = self.http.get(url).send()?;
         let status = response.status();
         if status.as_u16() == 404 {
            return Ok(None);
         }
         if status.is_server_error() || status.as_u16() == 429 {
            return Err(OssuaryError::Transient(format!("{url} returned HTTP {status}")));
         }
         if !status.is_success() {
            return Err(OssuaryError::Input(format!("{url} returned HTTP {status}")));
         }
         Ok(Some(response.json()?))
      })
   }
}

fn host_of(url: &str) -> String {
   url
      .trim_start_matches("https://")
      .trim_start_matches("http://")
      .split('/')
      .next()
      .unwrap_or_default()
      .to_string()
}

fn not_found(package: &PackageIdentity) -> OssuaryError {
   OssuaryError::UnresolvedRepo {
      ecosystem: package.ecosystem.to_string(),
      name:      package.name.clone(),
      reason:    "package not found in registry".to_string(),
   }
}

/// Version publish instants from an npm manifest's `time` map. The
/// `created`/`modified` bookkeeping keys are skipped.
fn npm_publish_dates(manifest: &Value) -> Vec<chrono::DateTime<chrono::Utc>> {
   let Some(times) = manifest.get("time").and_then(Value::as_object) else {
      return Vec::new();
   };
   let mut dates: Vec<_> = times
      .iter()
      .filter(|(version, _)| *version != "created" && *version != "modified")
      .filter_map(|(_, raw)| raw.as_str())
      .filter_map(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
      .map(|t| t.with_timezone(&chrono::Utc))
      .collect();
   dates.sort();
   dates
}

/// Repository URL from an npm manifest: the `repository` field may be a
/// string, an object, or a forge shorthand like `github:owner/repo`.
fn npm_repo_url(manifest: &Value) -> Option<String> {
   let raw = match manifest.get("repository") {
      Some(Value::String(s)) => s.clone(),
      Some(Value::Object(o)) => o.get("url").and_then(Value::as_str)?.to_string(),
      _ => return None,
   };
   Some(expand_shorthand(&raw))
}

fn expand_shorthand(raw: &str) -> String {
   if let Some(rest) = raw.strip_prefix("github:") {
      return format!("https://github.com/{rest}");
   }
   if let Some(rest) = raw.strip_prefix("gitlab:") {
      return format!("https://gitlab.com/{rest}");
   }
   if let Some(rest) = raw.strip_prefix("bitbucket:") {
      return format!("https://bitbucket.org/{rest}");
   }
   // Bare "owner/repo" is the npm shorthand for GitHub.
   if !raw.contains("://") && !raw.contains('@') && raw.split('/').count() == 2 {
      return format!("https://github.com/{raw}");
   }
   raw.to_string()
}

/// `project_urls` keys that may carry the repository, in priority order.
/// The order is load-bearing: reference scores depend on it.
const PYPI_URL_KEYS: &[&str] =
   &["repository", "source", "source code", "code", "homepage", "bug tracker"];

fn pypi_repo_url(info: &Value) -> Option<String> {
   let urls = info.get("project_urls").and_then(Value::as_object)?;
   for wanted in PYPI_URL_KEYS {
      for (key, value) in urls {
         if key.to_ascii_lowercase() == *wanted
            && let Some(url) = value.as_str().filter(|s| !s.is_empty())
         {
            return Some(url.to_string());
         }
      }
   }
   None
}
