use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/**
 * A single survey prompt
 */
#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
pub struct Question {
    pub id: i64,
    pub text: String,
    /**
     * Unix seconds, see `published()`
     */
    pub created_at: i64,
}

impl Question {
    pub fn published(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.created_at, 0).single()
    }
}

/**
 * One selectable answer for a question
 *
 * `votes` is a cache of the number of answers pointing at this choice, and is only ever
 * changed in the same transaction as the answer row that justifies it.
 */
#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
pub struct Choice {
    pub id: i64,
    pub question_id: i64,
    pub text: String,
    pub votes: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
pub struct AnswerRecord {
    pub id: i64,
    pub user_id: i64,
    pub question_id: i64,
    pub choice_id: i64,
}
