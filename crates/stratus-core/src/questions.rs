//! Practice questions about a project's content.
//!
//! The language model writes questions from retrieved context, grades a
//! user's answer on a 0-5 scale and rewrites a question in simpler words.
//! This module holds the records, the prompts and the parsers for the
//! model's JSON replies; persistence and provider calls live in the
//! application crate.
//!
//! Question and answer texts are limited to [`MAX_TEXT_CHARS`] characters.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StratusError, StratusResult};
use crate::planner::repair_json;

pub const MAX_TEXT_CHARS: usize = 500;

/// Highest score an evaluation can award.
pub const MAX_SCORE: f64 = 5.0;

/// Difficulty of a question, stored as 1, 2 or 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "u8")]
pub enum QuestionLevel {
    Easy = 1,
    Medium = 2,
    Hard = 3,
}

impl QuestionLevel {
    pub fn as_int(self) -> u8 {
        self as u8
    }

    pub fn from_int(n: i64) -> Option<Self> {
        match n {
            1 => Some(Self::Easy),
            2 => Some(Self::Medium),
            3 => Some(Self::Hard),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }
}

impl From<QuestionLevel> for u8 {
    fn from(level: QuestionLevel) -> u8 {
        level.as_int()
    }
}

impl fmt::Display for QuestionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<i64>() {
            return Self::from_int(n).ok_or_else(|| format!("question level {n} is not 1, 2 or 3"));
        }
        match s.to_ascii_lowercase().as_str() {
            "easy" => Ok(Self::Easy),
            "medium" => Ok(Self::Medium),
            "hard" => Ok(Self::Hard),
            other => Err(format!("unknown question level: {other}")),
        }
    }
}

/// A stored question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Question {
    pub id: String,
    pub project_id: String,
    pub question: String,
    pub level: QuestionLevel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user's answer to a question with its grade. One per question; a new
/// evaluation replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub id: String,
    pub question_id: String,
    pub project_id: String,
    pub answer: String,
    pub score: f64,
    pub reasoning: String,
    pub ideal_answer: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A question as written by the model, before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedQuestion {
    pub question: String,
    pub level: QuestionLevel,
}

/// The model's grade for one answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub score: f64,
    pub reasoning: String,
    pub ideal_answer: String,
}

/// Trim `text` and check it is non-empty and within [`MAX_TEXT_CHARS`].
pub fn validate_text(field: &str, text: &str) -> StratusResult<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(StratusError::Invalid(format!("{field} must not be empty")));
    }
    let chars = text.chars().count();
    if chars > MAX_TEXT_CHARS {
        return Err(StratusError::Invalid(format!(
            "{field} is {chars} characters; the limit is {MAX_TEXT_CHARS}"
        )));
    }
    Ok(text.to_string())
}

pub fn generation_prompt(context: &str, count: usize, level: Option<QuestionLevel>) -> String {
    let level = match level {
        Some(level) => format!("All questions must be of level {} ({level}).", level.as_int()),
        None => "Mix the levels 1 (easy), 2 (medium) and 3 (hard).".to_string(),
    };
    format!(
        "You are an expert in writing questions about software systems.\n\
         Context from the project is below.\n\
         ---------------------\n\
         {context}\n\
         ---------------------\n\
         Write {count} questions about the features and functionality of this system, \
         not about the wording of documents such as the README. {level}\n\
         Each question must be clear and self-contained, name the feature it asks about, \
         and be at most {MAX_TEXT_CHARS} characters.\n\
         Respond with only a JSON object of the form \
         {{\"questions\": [{{\"question\": \"...\", \"level\": 1}}]}}."
    )
}

pub fn evaluation_prompt(context: &str, question: &str, answer: &str) -> String {
    format!(
        "Context from the project is below.\n\
         ---------------------\n\
         {context}\n\
         ---------------------\n\
         Evaluate the user's answer to the question using the context.\n\
         [Question]: {question}\n\
         [Answer]: {answer}\n\
         Score the answer from 0 to {MAX_SCORE}, explain the score briefly, and give a clear, \
         concise ideal answer.\n\
         Respond with only a JSON object of the form \
         {{\"score\": 0.0, \"reasoning\": \"...\", \"ideal_answer\": \"...\"}}."
    )
}

pub fn rephrase_prompt(question: &str) -> String {
    format!(
        "Rephrase the question in a simpler way. Respond with the rephrased question only.\n\
         {question}"
    )
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLevel {
    Number(i64),
    Name(String),
}

#[derive(Deserialize)]
struct RawQuestion {
    question: String,
    level: RawLevel,
}

#[derive(Deserialize)]
struct RawQuestionList {
    questions: Vec<RawQuestion>,
}

#[derive(Deserialize)]
struct RawEvaluation {
    score: f64,
    reasoning: String,
    #[serde(default)]
    ideal_answer: String,
}

/// Deserialize a model reply, attempting one structural repair on failure.
fn parse_json<T: for<'de> Deserialize<'de>>(raw: &str, what: &str) -> Result<T, String> {
    let first_err = match serde_json::from_str::<T>(raw.trim()) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };
    let repaired = repair_json(raw);
    serde_json::from_str::<T>(&repaired)
        .map_err(|e| format!("unparseable {what} ({first_err}); after repair: {e}"))
}

/// Parse generated questions.
///
/// Entries with an unknown level, an empty text or a text over the limit
/// are dropped. A reply with no usable entry is an error.
pub fn parse_questions(raw: &str) -> Result<Vec<GeneratedQuestion>, String> {
    let list: RawQuestionList = parse_json(raw, "question list")?;
    let total = list.questions.len();
    let questions: Vec<GeneratedQuestion> = list
        .questions
        .into_iter()
        .filter_map(|q| {
            let level = match q.level {
                RawLevel::Number(n) => QuestionLevel::from_int(n)?,
                RawLevel::Name(name) => name.parse().ok()?,
            };
            let question = validate_text("question", &q.question).ok()?;
            Some(GeneratedQuestion { question, level })
        })
        .collect();
    if questions.is_empty() {
        return Err(format!("none of the {total} generated questions was usable"));
    }
    Ok(questions)
}

/// Parse an evaluation. Scores outside 0-5 are clamped; a non-finite
/// score is an error.
pub fn parse_evaluation(raw: &str) -> Result<Evaluation, String> {
    let eval: RawEvaluation = parse_json(raw, "evaluation")?;
    if !eval.score.is_finite() {
        return Err(format!("evaluation score {} is not a number", eval.score));
    }
    Ok(Evaluation {
        score: eval.score.clamp(0.0, MAX_SCORE),
        reasoning: eval.reasoning.trim().to_string(),
        ideal_answer: eval.ideal_answer.trim().to_string(),
    })
}
