use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chorus_store::SharedStore;
use regex::Regex;

use crate::keys;

const REPEAT_RUN: usize = 10;
const MAX_URLS: usize = 2;
const CAPS_RATIO: f64 = 0.7;
const CAPS_MIN_LETTERS: usize = 10;
const SPECIAL_RATIO: f64 = 0.5;
const SPECIAL_MIN_CHARS: usize = 10;

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("valid url pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpamPattern {
    RepeatedCharacters,
    UrlDensity,
    ExcessiveCaps,
    SpecialCharacters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpamVerdict {
    Allow,
    Warn,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpamCheck {
    pub verdict: SpamVerdict,
    pub score: i64,
    pub patterns: Vec<SpamPattern>,
}

impl SpamCheck {
    fn allow() -> Self {
        Self {
            verdict: SpamVerdict::Allow,
            score: 0,
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpamThresholds {
    pub warn: i64,
    pub block: i64,
    pub decay: Duration,
}

impl Default for SpamThresholds {
    fn default() -> Self {
        Self {
            warn: 3,
            block: 5,
            decay: Duration::from_secs(3600),
        }
    }
}

/// Heuristic content screening with a per-subject decaying score.
#[derive(Clone)]
pub struct SpamDetector {
    store: Arc<dyn SharedStore>,
    thresholds: SpamThresholds,
}

impl SpamDetector {
    pub fn new(store: Arc<dyn SharedStore>, thresholds: SpamThresholds) -> Self {
        Self { store, thresholds }
    }

    pub fn detect_patterns(&self, content: &str) -> Vec<SpamPattern> {
        let mut found = Vec::new();
        if has_repeated_run(content, REPEAT_RUN) {
            found.push(SpamPattern::RepeatedCharacters);
        }
        if URL_PATTERN.find_iter(content).count() > MAX_URLS {
            found.push(SpamPattern::UrlDensity);
        }

        let letters: Vec<char> = content.chars().filter(|c| c.is_alphabetic()).collect();
        if letters.len() >= CAPS_MIN_LETTERS {
            let upper = letters.iter().filter(|c| c.is_uppercase()).count();
            if upper as f64 / letters.len() as f64 > CAPS_RATIO {
                found.push(SpamPattern::ExcessiveCaps);
            }
        }

        let visible: Vec<char> = content.chars().filter(|c| !c.is_whitespace()).collect();
        if visible.len() >= SPECIAL_MIN_CHARS {
            let special = visible.iter().filter(|c| !c.is_alphanumeric()).count();
            if special as f64 / visible.len() as f64 > SPECIAL_RATIO {
                found.push(SpamPattern::SpecialCharacters);
            }
        }
        found
    }

    /// Screen `content` from `subject`. A pattern match bumps the subject's
    /// score for the decay window. A subject already at the block threshold
    /// stays blocked until the score decays. Store failures allow.
    pub async fn check_spam(&self, subject: &str, content: &str) -> SpamCheck {
        let patterns = self.detect_patterns(content);
        let key = keys::spam_score(subject);

        let score = if patterns.is_empty() {
            self.store.get(&key).await.map(|raw| {
                raw.and_then(|value| value.parse::<i64>().ok())
                    .unwrap_or(0)
            })
        } else {
            self.store.incr(&key, 1, Some(self.thresholds.decay)).await
        };

        let score = match score {
            Ok(score) => score,
            Err(err) => {
                tracing::warn!(subject, error = %err, "spam score unavailable, allowing");
                return SpamCheck::allow();
            }
        };

        let verdict = if score >= self.thresholds.block {
            SpamVerdict::Block
        } else if !patterns.is_empty() && score >= self.thresholds.warn {
            SpamVerdict::Warn
        } else {
            SpamVerdict::Allow
        };
        if verdict != SpamVerdict::Allow {
            tracing::info!(subject, score, ?patterns, ?verdict, "spam heuristics triggered");
        }
        SpamCheck {
            verdict,
            score,
            patterns,
        }
    }
}

fn has_repeated_run(content: &str, run: usize) -> bool {
    let mut previous = None;
    let mut length = 0;
    for c in content.chars() {
        if Some(c) == previous {
            length += 1;
        } else {
            previous = Some(c);
            length = 1;
        }
        if length >= run {
            return true;
        }
    }
    false
}
