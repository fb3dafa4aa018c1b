use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Completions needed before a lesson's puzzle picture is revealed.
pub const PUZZLE_UNLOCK_COMPLETIONS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub words: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonProgress {
    pub id: String,
    pub lesson_id: String,
    pub user_id: String,
    pub successful_completions: u32,
    pub last_practiced: DateTime<Utc>,
}

impl LessonProgress {
    pub fn puzzle_unlocked(&self) -> bool {
        self.successful_completions >= PUZZLE_UNLOCK_COMPLETIONS
    }
}

/// A lesson together with the requesting user's progress on it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonOverview {
    pub lesson: Lesson,
    pub progress: Option<LessonProgress>,
}

/// Result of a finished practice run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub progress: LessonProgress,
    /// True only on the completion that reaches the unlock threshold.
    pub puzzle_unlocked: bool,
}

/// A string that is non-empty after trimming. The stored value is trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    pub fn new(value: impl AsRef<str>) -> Option<Self> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for NonEmptyString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NonEmptyString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Trims every word and drops the blank ones.
pub fn clean_words<I, S>(words: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .filter_map(|w| NonEmptyString::new(w).map(NonEmptyString::into_inner))
        .collect()
}

/// Parses the comma separated word list typed into the lesson form.
pub fn parse_word_list(input: &str) -> Vec<String> {
    clean_words(input.split(','))
}
