//! Sentiment analysis over maintainer-authored text.
//!
//! A compact VADER-style lexicon pass produces one compound polarity in
//! [-1, 1] for the corpus of recent commit subjects and issue/release
//! titles; a separate substring pass flags the frustration phrases that
//! precede protest-ware incidents. The scorer only consumes the compound
//! value and the flag set's emptiness; the matched phrases become evidence.

use crate::{config::FRUSTRATION_KEYWORDS, types::RawCommit};

/// Commit subjects sampled into the corpus.
const CORPUS_COMMITS: usize = 200;
/// Issue/release titles sampled into the corpus.
const CORPUS_TITLES: usize = 50;

/// Valence normalization constant; VADER's alpha.
const ALPHA: f64 = 15.0;
/// Scalar applied to a valence in the scope of a negator.
const NEGATION_SCALAR: f64 = -0.74;
/// Booster increment, signed with the boosted word's valence.
const BOOSTER_STEP: f64 = 0.293;
/// How many tokens back a negator reaches.
const NEGATION_WINDOW: usize = 3;

/// Word valences on VADER's -4..=4 scale, trimmed to the vocabulary of
/// commit messages and issue titles.
const LEXICON: &[(&str, f64)] = &[
   ("abandoned", -1.9),
   ("amazing", 2.8),
   ("angry", -2.7),
   ("annoying", -2.3),
   ("awesome", 3.1),
   ("awful", -3.4),
   ("bad", -2.5),
   ("best", 3.2),
   ("better", 1.9),
   ("broken", -2.1),
   ("clean", 1.6),
   ("crash", -2.0),
   ("crashes", -2.0),
   ("dead", -3.3),
   ("disappointed", -2.0),
   ("disappointing", -2.2),
   ("excellent", 3.2),
   ("fail", -2.3),
   ("failed", -2.3),
   ("failing", -2.2),
   ("fantastic", 3.0),
   ("frustrated", -2.4),
   ("frustrating", -2.3),
   ("glad", 2.1),
   ("good", 1.9),
   ("great", 3.1),
   ("happy", 2.7),
   ("hate", -2.7),
   ("helpful", 1.9),
   ("horrible", -2.5),
   ("ignored", -1.4),
   ("improve", 1.9),
   ("improved", 2.1),
   ("improvement", 1.8),
   ("love", 3.2),
   ("neglected", -1.9),
   ("nice", 1.8),
   ("perfect", 3.1),
   ("pleased", 2.1),
   ("problem", -1.7),
   ("problems", -1.7),
   ("quit", -1.6),
   ("regression", -1.8),
   ("sad", -2.1),
   ("sick", -2.0),
   ("stable", 1.2),
   ("success", 2.7),
   ("successful", 2.7),
   ("support", 1.7),
   ("supported", 1.5),
   ("terrible", -3.1),
   ("thank", 1.9),
   ("thanks", 1.9),
   ("tired", -1.4),
   ("unhappy", -2.2),
   ("unmaintained", -1.9),
   ("unusable", -2.4),
   ("useless", -1.8),
   ("welcome", 2.0),
   ("win", 2.8),
   ("wonderful", 3.1),
   ("worse", -2.5),
   ("worst", -3.1),
   ("wrong", -2.1),
];

const NEGATORS: &[&str] = &[
   "not", "no", "never", "none", "cannot", "cant", "wont", "dont", "doesnt", "isnt", "wasnt",
   "shouldnt", "couldnt", "wouldnt", "without",
];

const BOOSTERS_UP: &[&str] = &["very", "really", "extremely", "absolutely", "completely", "totally"];
const BOOSTERS_DOWN: &[&str] = &["slightly", "somewhat", "barely", "marginally"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SentimentReport {
   /// Compound polarity in [-1, 1].
   pub compound:          f64,
   /// Matched frustration phrases, sorted, deduplicated.
   pub frustration_flags: Vec<String>,
}

/// Assemble the analysis corpus: subject lines of the most recent commits
/// plus issue and release titles. Commits are expected newest-first.
pub fn build_corpus(commits: &[RawCommit], issue_titles: &[String], release_notes: &[String]) -> String {
   let mut lines: Vec<&str> = commits
      .iter()
      .take(CORPUS_COMMITS)
      .filter_map(|c| c.message.lines().next())
      .collect();
   lines.extend(issue_titles.iter().take(CORPUS_TITLES).map(String::as_str));
   lines.extend(release_notes.iter().take(CORPUS_TITLES).map(String::as_str));
   lines.join("\n")
}

/// Analyze a corpus: lexicon compound score plus frustration flags.
pub fn analyze(corpus: &str) -> SentimentReport {
   SentimentReport {
      compound:          compound_score(corpus),
      frustration_flags: frustration_flags(corpus),
   }
}

fn tokenize(corpus: &str) -> Vec<String> {
   corpus
      .split(|c: char| !c.is_ascii_alphanumeric() && c != '\'')
      .filter(|t| !t.is_empty())
      .map(|t| t.replace('\'', "").to_ascii_lowercase())
      .collect()
}

fn valence_of(token: &str) -> Option<f64> {
   LEXICON
      .binary_search_by(|(word, _)| word.cmp(&token))
      .ok()
      .map(|idx| LEXICON[idx].1)
}

/// VADER-style compound: per-token valences adjusted for negation and
/// boosters, summed, then normalized by `sum / sqrt(sum^2 + alpha)`.
fn compound_score(corpus: &str) -> f64 {
   let tokens = tokenize(corpus);
   let mut sum = 0.0;

   for (idx, token) in tokens.iter().enumerate() {
      let Some(mut valence) = valence_of(token) else {
         continue;
      };

      let window_start = idx.saturating_sub(NEGATION_WINDOW);
      for prior in &tokens[window_start..idx] {
         if NEGATORS.contains(&prior.as_str()) {
            valence *= NEGATION_SCALAR;
            break;
         }
      }
      if idx > 0 {
         let prior = tokens[idx - 1].as_str();
         if BOOSTERS_UP.contains(&prior) {
            valence += BOOSTER_STEP * valence.signum();
         } else if BOOSTERS_DOWN.contains(&prior) {
            valence -= BOOSTER_STEP * valence.signum();
         }
      }
      sum += valence;
   }

   // Exclamation emphasis, capped, signed with the running total.
   let bangs = corpus.bytes().filter(|&b| b == b'!').count().min(4) as f64;
   if sum > 0.0 {
      sum += bangs * 0.292;
   } else if sum < 0.0 {
      sum -= bangs * 0.292;
   }

   if sum == 0.0 {
      return 0.0;
   }
   (sum / (sum * sum + ALPHA).sqrt()).clamp(-1.0, 1.0)
}

/// Case-insensitive substring scan for the canonical frustration phrases.
fn frustration_flags(corpus: &str) -> Vec<String> {
   let haystack = corpus.to_ascii_lowercase();
   let mut flags: Vec<String> = FRUSTRATION_KEYWORDS
      .iter()
      .filter(|phrase| haystack.contains(*phrase))
      .map(|phrase| (*phrase).to_string())
      .collect();
   flags.sort();
   flags.dedup();
   flags
}
