//! Typed repository for users, lessons and lesson progress.

use crate::models::{
    clean_words, CompletionOutcome, Lesson, LessonOverview, LessonProgress, NonEmptyString, User,
    PUZZLE_UNLOCK_COMPLETIONS,
};
use crate::store::{CollectionSchema, Schema, StoreResult, StructuredStore};
use chrono::Utc;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

pub const USERS: &str = "users";
pub const LESSONS: &str = "lessons";
pub const LESSON_PROGRESS: &str = "lessonProgress";

const COLLECTIONS: &[CollectionSchema] = &[
    CollectionSchema {
        name: USERS,
        key_path: "id",
        indexes: &["name"],
    },
    CollectionSchema {
        name: LESSONS,
        key_path: "id",
        indexes: &["userId"],
    },
    CollectionSchema {
        name: LESSON_PROGRESS,
        key_path: "id",
        indexes: &["lessonId", "userId"],
    },
];

pub const SCHEMA: Schema = Schema {
    version: 1,
    collections: COLLECTIONS,
};

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub struct PersistenceService {
    store: StructuredStore,
}

impl PersistenceService {
    pub fn new(store: StructuredStore) -> Self {
        Self { store }
    }

    /// Repository over a store at `path` using the application schema.
    pub fn open_at(path: impl AsRef<Path>) -> Self {
        Self::new(StructuredStore::new(path, SCHEMA))
    }

    pub fn store(&self) -> &StructuredStore {
        &self.store
    }

    pub async fn create_user(&self, name: NonEmptyString) -> StoreResult<User> {
        let user = User {
            id: new_id(),
            name: name.into_inner(),
            created_at: Utc::now(),
        };
        self.store.add(USERS, &user).await?;
        info!(user_id = %user.id, "user created");
        Ok(user)
    }

    pub async fn list_users(&self) -> StoreResult<Vec<User>> {
        self.store.get_all(USERS).await
    }

    pub async fn get_user(&self, id: &str) -> StoreResult<Option<User>> {
        self.store.get(USERS, id).await
    }

    /// Blank words are dropped before persisting. When nothing remains no
    /// lesson is written and `None` is returned.
    pub async fn create_lesson<I, S>(
        &self,
        user_id: &str,
        name: NonEmptyString,
        words: I,
    ) -> StoreResult<Option<Lesson>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words = clean_words(words);
        if words.is_empty() {
            debug!(user_id, "lesson skipped: no words left after filtering");
            return Ok(None);
        }

        let lesson = Lesson {
            id: new_id(),
            user_id: user_id.to_string(),
            name: name.into_inner(),
            words,
            created_at: Utc::now(),
        };
        self.store.add(LESSONS, &lesson).await?;
        info!(lesson_id = %lesson.id, user_id, words = lesson.words.len(), "lesson created");
        Ok(Some(lesson))
    }

    pub async fn list_lessons_for_user(&self, user_id: &str) -> StoreResult<Vec<Lesson>> {
        self.store.get_all_by_index(LESSONS, "userId", user_id).await
    }

    pub async fn get_lesson(&self, id: &str) -> StoreResult<Option<Lesson>> {
        self.store.get(LESSONS, id).await
    }

    /// The `lessonId` index is not unique, so the pair is resolved in memory.
    pub async fn get_progress(&self, lesson_id: &str, user_id: &str) -> StoreResult<Option<LessonProgress>> {
        let candidates: Vec<LessonProgress> = self
            .store
            .get_all_by_index(LESSON_PROGRESS, "lessonId", lesson_id)
            .await?;
        Ok(candidates.into_iter().find(|p| p.user_id == user_id))
    }

    pub async fn list_progress_for_user(&self, user_id: &str) -> StoreResult<Vec<LessonProgress>> {
        self.store
            .get_all_by_index(LESSON_PROGRESS, "userId", user_id)
            .await
    }

    /// Stores `completions` as the new counter for the pair. Read then write:
    /// callers must not run two completions for the same pair concurrently.
    pub async fn record_completion(
        &self,
        lesson_id: &str,
        user_id: &str,
        completions: u32,
    ) -> StoreResult<LessonProgress> {
        let now = Utc::now();
        let progress = match self.get_progress(lesson_id, user_id).await? {
            None => LessonProgress {
                id: new_id(),
                lesson_id: lesson_id.to_string(),
                user_id: user_id.to_string(),
                successful_completions: completions,
                last_practiced: now,
            },
            Some(mut existing) => {
                existing.successful_completions = completions;
                existing.last_practiced = now;
                existing
            }
        };

        self.store.put(LESSON_PROGRESS, &progress).await?;
        debug!(lesson_id, user_id, completions, "progress recorded");
        Ok(progress)
    }

    /// Records one more completion on top of the stored counter.
    pub async fn complete_lesson(&self, lesson_id: &str, user_id: &str) -> StoreResult<CompletionOutcome> {
        let previous = self
            .get_progress(lesson_id, user_id)
            .await?
            .map(|p| p.successful_completions)
            .unwrap_or(0);
        let progress = self
            .record_completion(lesson_id, user_id, previous.saturating_add(1))
            .await?;
        let puzzle_unlocked = progress.successful_completions == PUZZLE_UNLOCK_COMPLETIONS;
        Ok(CompletionOutcome {
            progress,
            puzzle_unlocked,
        })
    }

    /// A user's lessons, newest first, each with that user's progress.
    pub async fn lesson_overview(&self, user_id: &str) -> StoreResult<Vec<LessonOverview>> {
        let mut lessons = self.list_lessons_for_user(user_id).await?;
        lessons.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let progress = self.list_progress_for_user(user_id).await?;
        Ok(lessons
            .into_iter()
            .map(|lesson| {
                let progress = progress.iter().find(|p| p.lesson_id == lesson.id).cloned();
                LessonOverview { lesson, progress }
            })
            .collect())
    }

    /// Irreversibly deletes every user, lesson and progress record.
    pub async fn reset_all(&self) -> StoreResult<()> {
        self.store.delete_database().await?;
        info!("all local data reset");
        Ok(())
    }
}
