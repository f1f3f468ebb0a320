//! Skill routing: score each skill against free-text input.
//!
//! Per skill, the first rule that fires wins:
//! 1. trigger regex matches (case-insensitive) → 100
//! 2. skill name appears in the input → 80
//! 3. shared description keywords → `min(60, 15 × n)`; zero shared → no match

use std::collections::HashSet;
use std::fmt;

use regex::RegexBuilder;
use tracing::{debug, warn};

use crate::skills::Skill;

pub const TRIGGER_SCORE: u32 = 100;
pub const NAME_SCORE: u32 = 80;
pub const KEYWORD_SCORE: u32 = 15;
pub const MAX_KEYWORD_SCORE: u32 = 60;

/// Matches at or above this score are run automatically.
pub const AUTO_INVOKE_SCORE: u32 = NAME_SCORE;

const STOPWORDS: &[&str] = &[
    "about", "after", "all", "also", "and", "any", "are", "been", "before", "being", "but", "can",
    "could", "did", "does", "doing", "each", "for", "from", "had", "has", "have", "how", "into",
    "its", "just", "more", "most", "not", "only", "other", "our", "out", "over", "should", "some",
    "such", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "those", "use", "used", "using", "very", "was", "were", "what", "when", "which", "while", "who",
    "will", "with", "would", "you", "your",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchReason {
    Trigger,
    Name,
    Keywords(Vec<String>),
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trigger => f.write_str("trigger pattern matched"),
            Self::Name => f.write_str("skill name mentioned"),
            Self::Keywords(words) => write!(f, "keywords: {}", words.join(", ")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SkillMatch<'a> {
    pub skill: &'a Skill,
    pub score: u32,
    pub reason: MatchReason,
}

impl SkillMatch<'_> {
    pub fn auto_invoke(&self) -> bool {
        self.score >= AUTO_INVOKE_SCORE
    }
}

/// Lowercase alphanumeric tokens longer than two characters, minus
/// stopwords, in first-seen order.
pub fn keywords(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 2 && !STOPWORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn trigger_matches(skill: &Skill, input: &str) -> bool {
    let Some(pattern) = skill.trigger.as_deref() else {
        return false;
    };
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => re.is_match(input),
        Err(e) => {
            warn!(skill = %skill.name, error = %e, "invalid skill trigger pattern");
            false
        }
    }
}

fn score_skill<'a>(
    skill: &'a Skill,
    input: &str,
    input_lower: &str,
    input_words: &HashSet<String>,
) -> Option<SkillMatch<'a>> {
    let (score, reason) = if trigger_matches(skill, input) {
        (TRIGGER_SCORE, MatchReason::Trigger)
    } else if !skill.name.is_empty() && input_lower.contains(&skill.name.to_lowercase()) {
        (NAME_SCORE, MatchReason::Name)
    } else {
        let shared: Vec<String> = keywords(&skill.description)
            .into_iter()
            .filter(|w| input_words.contains(w))
            .collect();
        if shared.is_empty() {
            return None;
        }
        let score = (KEYWORD_SCORE * shared.len() as u32).min(MAX_KEYWORD_SCORE);
        (score, MatchReason::Keywords(shared))
    };
    Some(SkillMatch {
        skill,
        score,
        reason,
    })
}

/// Rank skills against `input`, highest score first. Equal scores keep
/// their input order.
pub fn match_skills<'a, I>(input: &str, skills: I) -> Vec<SkillMatch<'a>>
where
    I: IntoIterator<Item = &'a Skill>,
{
    let input_lower = input.to_lowercase();
    let input_words: HashSet<String> = keywords(input).into_iter().collect();

    let mut matches: Vec<SkillMatch<'a>> = skills
        .into_iter()
        .filter_map(|s| score_skill(s, input, &input_lower, &input_words))
        .collect();
    // sort_by is stable
    matches.sort_by(|a, b| b.score.cmp(&a.score));
    matches
}

pub fn best_skill<'a, I>(input: &str, skills: I) -> Option<SkillMatch<'a>>
where
    I: IntoIterator<Item = &'a Skill>,
{
    let best = match_skills(input, skills).into_iter().next();
    if let Some(m) = &best {
        debug!(skill = %m.skill.name, score = m.score, reason = %m.reason, "best skill match");
    }
    best
}
