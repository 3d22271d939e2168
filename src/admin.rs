use chrono::Utc;
use log::*;

use crate::db::Store;
use crate::errors::{is_foreign_key_violation, Error, Result};
use crate::models::{Choice, Question};

/**
 * Matches the column width the survey texts have always been stored with
 */
pub const MAX_TEXT_LEN: usize = 255;

pub const MIN_CHOICES: usize = 2;

/**
 * Trim and check a question or choice text
 */
pub fn validate_text(what: &str, text: &str) -> Result<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::InvalidInput(format!("{} text must not be empty", what)));
    }
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(Error::InvalidInput(format!(
            "{} text must be at most {} characters",
            what, MAX_TEXT_LEN
        )));
    }
    Ok(text.to_string())
}

/**
 * Split an admin's message into choices, one per line
 */
pub fn parse_choice_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/*
 * None of the mutations below go through `with_retry`: replaying a write whose commit may have
 * landed would duplicate it, so a transient failure is handed back to the caller.
 */
impl Store {
    /**
     * Create a question with its choices, all or nothing
     */
    pub async fn create_question(&self, text: &str, choices: &[String]) -> Result<i64> {
        let text = validate_text("question", text)?;
        if choices.len() < MIN_CHOICES {
            return Err(Error::InvalidInput(format!(
                "a question needs at least {} choices, got {}",
                MIN_CHOICES,
                choices.len()
            )));
        }
        let choices = choices
            .iter()
            .map(|c| validate_text("choice", c))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        let question_id: i64 =
            sqlx::query_scalar::<_, i64>("INSERT INTO questions (text, created_at) VALUES ($1, $2) RETURNING id")
                .bind(text.as_str())
                .bind(Utc::now().timestamp())
                .fetch_one(&mut tx)
                .await?;

        for choice in choices.iter() {
            sqlx::query("INSERT INTO choices (question_id, text, votes) VALUES ($1, $2, 0)")
                .bind(question_id)
                .bind(choice.as_str())
                .execute(&mut tx)
                .await?;
        }

        tx.commit().await?;
        info!(
            "Created question {} with {} choices: {:?}",
            question_id,
            choices.len(),
            text
        );
        Ok(question_id)
    }

    pub async fn list_questions(&self) -> Result<Vec<Question>> {
        self.with_retry("list_questions", |_| async move {
            let questions = sqlx::query_as::<_, Question>(
                "SELECT id, text, created_at FROM questions ORDER BY id ASC",
            )
            .fetch_all(&self.pool)
            .await?;
            debug!("Loaded {} questions", questions.len());
            Ok(questions)
        })
        .await
    }

    pub async fn question_with_choices(&self, question_id: i64) -> Result<(Question, Vec<Choice>)> {
        let question = self
            .with_retry("question_with_choices", |_| async move {
                let question = sqlx::query_as::<_, Question>(
                    "SELECT id, text, created_at FROM questions WHERE id = $1",
                )
                .bind(question_id)
                .fetch_optional(&self.pool)
                .await?;
                Ok(question)
            })
            .await?
            .ok_or_else(|| Error::not_found("question", question_id))?;

        let choices = self.list_choices(question_id).await?;
        Ok((question, choices))
    }

    pub async fn edit_question_text(&self, question_id: i64, text: &str) -> Result<()> {
        let text = validate_text("question", text)?;
        let result = sqlx::query("UPDATE questions SET text = $1 WHERE id = $2")
            .bind(text.as_str())
            .bind(question_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("question", question_id));
        }
        info!("Question {} renamed to {:?}", question_id, text);
        Ok(())
    }

    pub async fn edit_choice_text(&self, choice_id: i64, text: &str) -> Result<()> {
        let text = validate_text("choice", text)?;
        let result = sqlx::query("UPDATE choices SET text = $1 WHERE id = $2")
            .bind(text.as_str())
            .bind(choice_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("choice", choice_id));
        }
        info!("Choice {} renamed to {:?}", choice_id, text);
        Ok(())
    }

    pub async fn add_choice_to_question(&self, question_id: i64, text: &str) -> Result<i64> {
        let text = validate_text("choice", text)?;
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar::<_, i64>("SELECT id FROM questions WHERE id = $1")
            .bind(question_id)
            .fetch_optional(&mut tx)
            .await?;
        if exists.is_none() {
            return Err(Error::not_found("question", question_id));
        }

        let choice_id: i64 = sqlx::query_scalar::<_, i64>(
            "INSERT INTO choices (question_id, text, votes) VALUES ($1, $2, 0) RETURNING id",
        )
        .bind(question_id)
        .bind(text.as_str())
        .fetch_one(&mut tx)
        .await?;

        tx.commit().await?;
        info!("Added choice {} to question {}", choice_id, question_id);
        Ok(choice_id)
    }

    /**
     * Remove a choice nobody has picked yet
     *
     * A choice with answers is refused with `Error::ChoiceHasVotes`. The foreign key from
     * `answers.choice_id` does not cascade, so an answer landing concurrently makes the delete
     * fail instead of silently taking the answer with it. A question is never left with fewer
     * than two choices.
     */
    pub async fn delete_choice(&self, choice_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let question_id: i64 = sqlx::query_scalar::<_, i64>("SELECT question_id FROM choices WHERE id = $1")
            .bind(choice_id)
            .fetch_optional(&mut tx)
            .await?
            .ok_or_else(|| Error::not_found("choice", choice_id))?;

        let answers: i64 = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM answers WHERE choice_id = $1")
            .bind(choice_id)
            .fetch_one(&mut tx)
            .await?;
        if answers > 0 {
            warn!("Refusing to delete choice {} with {} answers", choice_id, answers);
            return Err(Error::ChoiceHasVotes(choice_id));
        }

        let siblings: i64 = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM choices WHERE question_id = $1")
            .bind(question_id)
            .fetch_one(&mut tx)
            .await?;
        if siblings as usize <= MIN_CHOICES {
            return Err(Error::InvalidInput(format!(
                "question {} must keep at least {} choices",
                question_id, MIN_CHOICES
            )));
        }

        let deleted = sqlx::query("DELETE FROM choices WHERE id = $1")
            .bind(choice_id)
            .execute(&mut tx)
            .await;
        match deleted {
            Err(err) if is_foreign_key_violation(&err) => {
                warn!("Choice {} picked up an answer while being deleted", choice_id);
                return Err(Error::ChoiceHasVotes(choice_id));
            }
            Err(err) => return Err(err.into()),
            Ok(_) => {}
        }

        tx.commit().await?;
        info!("Deleted choice {} from question {}", choice_id, question_id);
        Ok(())
    }

    /**
     * Delete a question along with its choices and every answer to it
     */
    pub async fn delete_question(&self, question_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let answers = sqlx::query("DELETE FROM answers WHERE question_id = $1")
            .bind(question_id)
            .execute(&mut tx)
            .await?
            .rows_affected();
        let choices = sqlx::query("DELETE FROM choices WHERE question_id = $1")
            .bind(question_id)
            .execute(&mut tx)
            .await?
            .rows_affected();
        let questions = sqlx::query("DELETE FROM questions WHERE id = $1")
            .bind(question_id)
            .execute(&mut tx)
            .await?
            .rows_affected();

        if questions == 0 {
            warn!("Attempted to delete missing question {}", question_id);
            return Err(Error::not_found("question", question_id));
        }

        tx.commit().await?;
        info!(
            "Deleted question {} with {} choices and {} answers",
            question_id, choices, answers
        );
        Ok(())
    }
}
