use std::future::Future;

use log::*;

use crate::api_models::{ChoiceStats, PersonalEntry, QuestionStats};
use crate::db::Store;
use crate::errors::{Error, Result};
use crate::models::Question;

#[derive(Debug, sqlx::FromRow)]
struct ChoiceCount {
    choice_id: i64,
    text: String,
    count: i64,
}

impl Store {
    /**
     * Every answer the user has given, oldest first
     */
    pub async fn personal_stats(&self, user_id: i64) -> Result<Vec<PersonalEntry>> {
        self.with_retry("personal_stats", |_| async move {
            let entries = sqlx::query_as::<_, PersonalEntry>(
                "SELECT q.text AS question_text, c.text AS choice_text
                 FROM answers a
                 JOIN choices c ON c.id = a.choice_id
                 JOIN questions q ON q.id = a.question_id
                 WHERE a.user_id = $1
                 ORDER BY a.id ASC",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
            debug!("User {} has {} answers", user_id, entries.len());
            Ok(entries)
        })
        .await
    }

    /**
     * Tally the answers to a single question
     *
     * Counts come from the answer records themselves rather than the cached `votes` column.
     */
    pub async fn question_stats(&self, question_id: i64) -> Result<QuestionStats> {
        self.with_retry("question_stats", |_| async move {
            let question = sqlx::query_as::<_, Question>(
                "SELECT id, text, created_at FROM questions WHERE id = $1",
            )
            .bind(question_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("question", question_id))?;

            let counts = sqlx::query_as::<_, ChoiceCount>(
                "SELECT c.id AS choice_id, c.text AS text, COUNT(a.id) AS count
                 FROM choices c
                 LEFT JOIN answers a ON a.choice_id = c.id
                 WHERE c.question_id = $1
                 GROUP BY c.id, c.text
                 ORDER BY c.id ASC",
            )
            .bind(question_id)
            .fetch_all(&self.pool)
            .await?;

            let total: i64 = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM answers WHERE question_id = $1")
                .bind(question_id)
                .fetch_one(&self.pool)
                .await?;

            Ok(tally(question, counts, total))
        })
        .await
    }

    /**
     * Statistics for every question
     *
     * Each question is computed on its own; one that fails is logged and left out rather than
     * failing the whole report.
     */
    pub async fn all_stats(&self) -> Result<Vec<QuestionStats>> {
        let ids: Vec<i64> = self
            .with_retry("all_stats", |_| async move {
                let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM questions ORDER BY id ASC")
                    .fetch_all(&self.pool)
                    .await?;
                Ok(ids)
            })
            .await?;

        Ok(collect_isolated(ids, move |id| self.question_stats(id)).await)
    }
}

/**
 * Run `compute` for every id in order, keeping the successes and logging the failures
 */
async fn collect_isolated<F, Fut>(ids: Vec<i64>, mut compute: F) -> Vec<QuestionStats>
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = Result<QuestionStats>>,
{
    let mut stats = Vec::with_capacity(ids.len());
    for id in ids {
        match compute(id).await {
            Ok(s) => stats.push(s),
            Err(err) => error!("Failed to compute statistics for question {}: {}", id, err),
        }
    }
    stats
}

fn tally(question: Question, counts: Vec<ChoiceCount>, total: i64) -> QuestionStats {
    let per_choice = counts
        .into_iter()
        .map(|c| ChoiceStats {
            choice_id: c.choice_id,
            text: c.text,
            count: c.count,
            percentage: percentage(c.count, total),
        })
        .collect();

    QuestionStats {
        question_id: question.id,
        question_text: question.text,
        total_responses: total,
        per_choice,
    }
}

fn percentage(count: i64, total: i64) -> f64 {
    if total > 0 {
        count as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}
