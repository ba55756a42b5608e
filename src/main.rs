use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use ossuary::{
   Ecosystem, Orchestrator, OssuaryConfig, OssuaryError, Result, Score, cache::ScoreCache, style,
};

#[derive(Debug, Parser)]
#[command(name = "ossuary", version, about = "Governance risk scoring for open-source packages")]
struct Cli {
   #[command(subcommand)]
   command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
   /// Score one package
   Score {
      /// Package name (owner/name for the github ecosystem)
      package: String,

      /// Package ecosystem
      #[arg(long, value_enum)]
      ecosystem: Ecosystem,

      /// Evaluate as though today were this date (YYYY-MM-DD)
      #[arg(long)]
      cutoff: Option<String>,

      /// Emit the raw JSON payload instead of the human summary
      #[arg(long)]
      json: bool,
   },

   /// Create the cache schema
   Init,

   /// Show the packages with the largest recent score swings
   Movers {
      #[arg(long, default_value_t = 20)]
      limit: usize,

      /// Window in days
      #[arg(long, default_value_t = 30)]
      since: u64,
   },

   /// Re-score cached packages older than the freshness bound
   Refresh {
      /// Freshness bound in days
      #[arg(long, default_value_t = 7)]
      max_age: u64,

      /// Restrict to one ecosystem
      #[arg(long, value_enum)]
      ecosystem: Option<Ecosystem>,
   },
}

fn parse_cutoff(raw: &str) -> Result<DateTime<Utc>> {
   let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
      .map_err(|_| OssuaryError::Input(format!("unparseable cutoff (want YYYY-MM-DD): {raw}")))?;
   let midnight = date
      .and_hms_opt(0, 0, 0)
      .ok_or_else(|| OssuaryError::Input(format!("invalid cutoff date: {raw}")))?;
   Ok(midnight.and_utc())
}

fn print_human(score: &Score) {
   let headline = format!(
      "{} {} {} ({})",
      score.semaphore,
      style::bold(&score.package),
      style::level(score.risk_level.as_str(), score.risk_level),
      score.score
   );
   println!("{headline}");
   if score.partial {
      println!("{}", style::warning("partial: scored with incomplete collector data"));
   }
   println!();
   println!("{}", style::section_header("Breakdown", 48));
   for entry in &score.breakdown {
      println!("  {:>+4}  {:<24} {}", entry.points, entry.tag, style::dim(&entry.evidence));
   }
   println!();
   println!("{}", score.explanation);
   if !score.recommendations.is_empty() {
      println!();
      println!("{}", style::section_header("Recommendations", 48));
      for line in &score.recommendations {
         println!("  - {line}");
      }
   }
}

fn run(cli: Cli) -> Result<()> {
   let config = OssuaryConfig::load()?;

   match cli.command {
      Command::Score { package, ecosystem, cutoff, json } => {
         let as_of = cutoff.as_deref().map(parse_cutoff).transpose()?;
         let orchestrator = Orchestrator::new(config)?;
         let score = orchestrator.score_package(ecosystem, &package, as_of, None)?;
         if json {
            println!("{}", serde_json::to_string_pretty(&score)?);
         } else {
            print_human(&score);
         }
      },

      Command::Init => {
         let path = config.database_path()?;
         ScoreCache::open(&path)?;
         println!("{} cache schema ready at {}", style::success("✓"), path.display());
      },

      Command::Movers { limit, since } => {
         let orchestrator = Orchestrator::new(config)?;
         let movers = orchestrator.movers(limit, Duration::days(since as i64))?;
         if movers.is_empty() {
            println!("No score changes in the last {since} days.");
            return Ok(());
         }
         println!("{}", style::section_header(&format!("Movers (last {since} days)"), 56));
         for mover in movers {
            println!(
               "  {:>+4}  {}:{} ({} -> {})",
               mover.delta,
               mover.ecosystem,
               style::bold(&mover.name),
               mover.previous,
               mover.latest
            );
         }
      },

      Command::Refresh { max_age, ecosystem } => {
         let orchestrator = Orchestrator::new(config)?;
         let (succeeded, failed) = orchestrator.refresh(Duration::days(max_age as i64), ecosystem)?;
         println!(
            "{} refreshed {succeeded} packages ({failed} failed)",
            style::success("✓")
         );
         if failed > 0 && succeeded == 0 {
            return Err(OssuaryError::Transient("every refresh task failed".to_string()));
         }
      },
   }
   Ok(())
}

fn main() {
   // .env is optional; missing files are fine.
   let _ = dotenvy::dotenv();

   let cli = Cli::parse();
   if let Err(e) = run(cli) {
      eprintln!("{}", style::error(&format!("error: {e}")));
      std::process::exit(e.exit_code());
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   // ========== parse_cutoff Tests ==========

   #[test]
   fn test_parse_cutoff_valid() {
      let t = parse_cutoff("2018-09-01").unwrap();
      assert_eq!(t.to_rfc3339(), "2018-09-01T00:00:00+00:00");
   }

   #[test]
   fn test_parse_cutoff_rejects_garbage() {
      assert!(parse_cutoff("yesterday").is_err());
      assert!(parse_cutoff("2018-13-01").is_err());
      assert!(parse_cutoff("01/09/2018").is_err());
   }

   #[test]
   fn test_parse_cutoff_error_is_input() {
      let err = parse_cutoff("nope").unwrap_err();
      assert_eq!(err.exit_code(), 3);
   }

   // ========== CLI parsing Tests ==========

   #[test]
   fn test_cli_score_command() {
      let cli = Cli::parse_from([
         "ossuary", "score", "event-stream", "--ecosystem", "npm", "--cutoff", "2018-09-01",
         "--json",
      ]);
      match cli.command {
         Command::Score { package, ecosystem, cutoff, json } => {
            assert_eq!(package, "event-stream");
            assert_eq!(ecosystem, Ecosystem::Npm);
            assert_eq!(cutoff.as_deref(), Some("2018-09-01"));
            assert!(json);
         },
         other => panic!("expected score command, got {other:?}"),
      }
   }

   #[test]
   fn test_cli_movers_defaults() {
      let cli = Cli::parse_from(["ossuary", "movers"]);
      match cli.command {
         Command::Movers { limit, since } => {
            assert_eq!(limit, 20);
            assert_eq!(since, 30);
         },
         other => panic!("expected movers command, got {other:?}"),
      }
   }

   #[test]
   fn test_cli_refresh_with_ecosystem() {
      let cli = Cli::parse_from(["ossuary", "refresh", "--max-age", "3", "--ecosystem", "pypi"]);
      match cli.command {
         Command::Refresh { max_age, ecosystem } => {
            assert_eq!(max_age, 3);
            assert_eq!(ecosystem, Some(Ecosystem::Pypi));
         },
         other => panic!("expected refresh command, got {other:?}"),
      }
   }
}
