//! The scoring engine.
//!
//! Pure function from `ScoreInputs` + `ScoreConfig` to a `Score`: maturity
//! classification, two-track concentration base, activity modifier,
//! protective factors, takeover detection, clamp, level mapping, and
//! deterministic explanation assembly. No I/O, no clocks except the caller's
//! `computed_at` stamp.

use chrono::{DateTime, Duration, Utc};

use crate::{
   config::ScoreConfig,
   error::Result,
   types::{BreakdownEntry, OwnerKind, ReputationTier, RiskLevel, Score, ScoreInputs},
};

/// Which concentration backed the base band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaseTrack {
   Recent,
   Lifetime,
   NoCommits,
}

/// Compute a score. `requested_as_of` is the caller's original cutoff and
/// lands in the payload verbatim (`None` for current scores); the effective
/// instant lives in `inputs.as_of`.
pub fn compute(
   inputs: &ScoreInputs,
   requested_as_of: Option<DateTime<Utc>>,
   config: &ScoreConfig,
) -> Result<Score> {
   let mature = is_mature(inputs, config);
   let mut breakdown = Vec::new();

   // Step 1+2: base risk from the concentration track.
   let (concentration, track) = select_concentration(inputs, mature, config);
   let base = match track {
      BaseTrack::NoCommits => *config.base_band_scores.last().unwrap_or(&100),
      _ => band_score(concentration, config),
   };
   breakdown.push(BreakdownEntry {
      tag:      "concentration-base".to_string(),
      points:   base,
      evidence: base_evidence(inputs, concentration, track),
   });

   // Step 3: activity modifier, never a penalty for mature projects.
   let mut activity = activity_modifier(inputs.commits_per_year_recent, track, config);
   if mature {
      activity = activity.min(0);
   }
   breakdown.push(BreakdownEntry {
      tag:      "activity".to_string(),
      points:   activity,
      evidence: format!("{} commits in the last 12 months", inputs.commits_per_year_recent),
   });

   // Step 4: protective and risk factors, fixed order, independent.
   protective_factors(inputs, concentration, mature, config, &mut breakdown);

   if inputs.partial {
      breakdown.push(BreakdownEntry {
         tag:      "partial".to_string(),
         points:   0,
         evidence: "scored with incomplete collector data".to_string(),
      });
   }

   // Step 5: combine and clamp.
   let total: i32 = breakdown.iter().map(|e| e.points).sum();
   let score = total.clamp(0, 100) as u8;

   // Step 6: level, explanation, recommendations.
   let level = RiskLevel::from_score(score);
   let explanation = build_explanation(score, level, &breakdown);

   Ok(Score {
      package: inputs.package.name.clone(),
      ecosystem: inputs.package.ecosystem,
      score,
      risk_level: level,
      semaphore: level.semaphore().to_string(),
      explanation,
      recommendations: recommendations(level),
      breakdown,
      computed_at: Utc::now(),
      as_of: requested_as_of,
      model_version: config.model_version.clone(),
      partial: inputs.partial,
      inputs_hash: inputs.stable_hash(&config.model_version)?,
   })
}

fn is_mature(inputs: &ScoreInputs, config: &ScoreConfig) -> bool {
   let dormancy_cutoff =
      inputs.as_of - Duration::days((config.mature_max_dormancy_years * 365.25) as i64);
   inputs.repo_age_years >= config.mature_min_age_years
      && inputs.total_commits >= config.mature_min_commits
      && inputs.last_commit.is_some_and(|last| last >= dormancy_cutoff)
}

/// Pick the concentration the base band reads. Non-mature projects always
/// score on the recent window (an empty window reads as full concentration);
/// mature projects fall back to the lifetime view when recent activity is
/// too thin to be representative.
fn select_concentration(
   inputs: &ScoreInputs,
   mature: bool,
   config: &ScoreConfig,
) -> (f64, BaseTrack) {
   if mature {
      if inputs.commits_per_year_recent >= config.mature_recent_track_min_commits
         && let Some(recent) = inputs.recent_concentration
      {
         return (recent, BaseTrack::Recent);
      }
      if let Some(lifetime) = inputs.lifetime_concentration {
         return (lifetime, BaseTrack::Lifetime);
      }
      return (100.0, BaseTrack::NoCommits);
   }
   match inputs.recent_concentration {
      Some(recent) => (recent, BaseTrack::Recent),
      // Dormant recent window on a young project reads as one person (or
      // nobody) holding everything.
      None => match inputs.lifetime_concentration {
         Some(_) => (100.0, BaseTrack::Recent),
         None => (100.0, BaseTrack::NoCommits),
      },
   }
}

fn band_score(concentration: f64, config: &ScoreConfig) -> i32 {
   for (edge, score) in config.base_band_edges.iter().zip(config.base_band_scores.iter()) {
      if concentration < *edge {
         return *score;
      }
   }
   *config.base_band_scores.last().unwrap_or(&100)
}

fn activity_modifier(commits_per_year: u64, track: BaseTrack, config: &ScoreConfig) -> i32 {
   if matches!(track, BaseTrack::NoCommits) {
      return config.activity_abandoned_penalty;
   }
   if commits_per_year > config.activity_high_threshold {
      config.activity_high_bonus
   } else if commits_per_year >= config.activity_medium_threshold {
      config.activity_medium_bonus
   } else if commits_per_year >= config.activity_low_threshold {
      0
   } else {
      config.activity_abandoned_penalty
   }
}

fn base_evidence(inputs: &ScoreInputs, concentration: f64, track: BaseTrack) -> String {
   let (table, window) = match track {
      BaseTrack::Recent => (&inputs.recent_table, "recent"),
      BaseTrack::Lifetime => (&inputs.lifetime_table, "lifetime"),
      BaseTrack::NoCommits => return "no commits in the scoring window".to_string(),
   };
   match table.first() {
      Some(top) => format!(
         "top contributor {} authored {concentration:.0}% of {window} commits",
         top.name
      ),
      None => format!("top contributor authored {concentration:.0}% of {window} commits"),
   }
}

#[allow(clippy::too_many_lines, reason = "one factor per block, table-shaped")]
fn protective_factors(
   inputs: &ScoreInputs,
   concentration: f64,
   mature: bool,
   config: &ScoreConfig,
   breakdown: &mut Vec<BreakdownEntry>,
) {
   match inputs.reputation {
      ReputationTier::T1 => breakdown.push(BreakdownEntry {
         tag:      "reputation-t1".to_string(),
         points:   config.tier1_bonus,
         evidence: "maintainer reputation tier T1".to_string(),
      }),
      ReputationTier::T2 => breakdown.push(BreakdownEntry {
         tag:      "reputation-t2".to_string(),
         points:   config.tier2_bonus,
         evidence: "maintainer reputation tier T2".to_string(),
      }),
      ReputationTier::Unknown => {},
   }

   if inputs.has_sponsors {
      breakdown.push(BreakdownEntry {
         tag:      "sponsors".to_string(),
         points:   config.sponsors_bonus,
         evidence: "GitHub Sponsors enabled".to_string(),
      });
   }

   if matches!(inputs.owner_kind, Some(OwnerKind::Organization))
      && inputs
         .admin_count
         .is_some_and(|n| n >= config.org_succession_min_admins)
   {
      breakdown.push(BreakdownEntry {
         tag:      "org-succession".to_string(),
         points:   config.org_succession_bonus,
         evidence: format!(
            "organization with {} admins",
            inputs.admin_count.unwrap_or_default()
         ),
      });
   }

   // Massive and high visibility are exclusive: never both.
   if let Some(downloads) = inputs.downloads_per_week {
      if downloads > config.massive_visibility_downloads {
         breakdown.push(BreakdownEntry {
            tag:      "massive-visibility".to_string(),
            points:   config.massive_visibility_bonus,
            evidence: format!("{downloads} downloads/week"),
         });
      } else if downloads > config.high_visibility_downloads {
         breakdown.push(BreakdownEntry {
            tag:      "high-visibility".to_string(),
            points:   config.high_visibility_bonus,
            evidence: format!("{downloads} downloads/week"),
         });
      }
   }

   if concentration < config.distributed_governance_max_concentration {
      breakdown.push(BreakdownEntry {
         tag:      "distributed-governance".to_string(),
         points:   config.distributed_governance_bonus,
         evidence: format!("top-contributor share {concentration:.0}% is below 40%"),
      });
   }

   if inputs.unique_contributors_recent > config.active_community_min_contributors {
      breakdown.push(BreakdownEntry {
         tag:      "active-community".to_string(),
         points:   config.active_community_bonus,
         evidence: format!("{} contributors in the last year", inputs.unique_contributors_recent),
      });
   }

   if inputs.cii_badge {
      breakdown.push(BreakdownEntry {
         tag:      "cii-best-practices".to_string(),
         points:   config.cii_bonus,
         evidence: "CII best-practices badge".to_string(),
      });
   }

   if inputs.sentiment_compound > config.positive_sentiment_threshold {
      breakdown.push(BreakdownEntry {
         tag:      "positive-sentiment".to_string(),
         points:   config.positive_sentiment_bonus,
         evidence: format!("compound sentiment {:+.2}", inputs.sentiment_compound),
      });
   }

   if !inputs.frustration_flags.is_empty() {
      breakdown.push(BreakdownEntry {
         tag:      "frustration".to_string(),
         points:   config.frustration_penalty,
         evidence: format!("frustration phrases: {}", inputs.frustration_flags.join(", ")),
      });
   }

   if inputs.sentiment_compound < config.negative_sentiment_threshold {
      breakdown.push(BreakdownEntry {
         tag:      "negative-sentiment".to_string(),
         points:   config.negative_sentiment_penalty,
         evidence: format!("compound sentiment {:+.2}", inputs.sentiment_compound),
      });
   }

   if mature
      && let Some(shift) = inputs
         .proportion_shifts
         .iter()
         .find(|s| s.shift > config.takeover_shift_threshold)
   {
      breakdown.push(BreakdownEntry {
         tag:      "takeover-risk".to_string(),
         points:   config.takeover_penalty,
         evidence: format!(
            "{} rose from {:.1}% to {:.1}% of commits (+{:.1}pp)",
            shift.name, shift.share_historical, shift.share_recent, shift.shift
         ),
      });
   }
}

/// Deterministic prose: semaphore + level + score, the strongest protective
/// signal, then the two largest risk drivers, each with its evidence.
fn build_explanation(score: u8, level: RiskLevel, breakdown: &[BreakdownEntry]) -> String {
   let mut protective: Vec<&BreakdownEntry> = breakdown.iter().filter(|e| e.points < 0).collect();
   protective.sort_by_key(|e| e.points);
   let mut risks: Vec<&BreakdownEntry> = breakdown.iter().filter(|e| e.points > 0).collect();
   risks.sort_by_key(|e| -e.points);

   let mut parts = Vec::new();
   if let Some(best) = protective.first() {
      parts.push(format!("strongest protective signal: {} ({})", best.evidence, best.points));
   }
   for risk in risks.iter().take(2) {
      parts.push(format!("risk driver: {} (+{})", risk.evidence, risk.points));
   }

   let mut text = format!("{} {level} ({score}).", level.semaphore());
   if !parts.is_empty() {
      text.push(' ');
      text.push_str(&parts.join("; "));
      text.push('.');
   }
   text
}

fn recommendations(level: RiskLevel) -> Vec<String> {
   let lines: &[&str] = match level {
      RiskLevel::VeryLow => &["No action needed; governance posture is healthy."],
      RiskLevel::Low => &["Monitor for maintainer changes during routine dependency updates."],
      RiskLevel::Moderate => &[
         "Review recent maintainer activity before upgrading.",
         "Pin versions and read changelogs on update.",
      ],
      RiskLevel::High => &[
         "Pin exact versions and audit new releases before adoption.",
         "Evaluate alternative packages or vendoring.",
      ],
      RiskLevel::Critical => &[
         "Treat new releases as untrusted until reviewed.",
         "Consider forking or vendoring a reviewed snapshot.",
         "Engage the maintainer or your ecosystem security team.",
      ],
   };
   lines.iter().map(|s| (*s).to_string()).collect()
}
