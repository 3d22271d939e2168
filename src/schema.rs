use log::*;
use sqlx::any::{AnyKind, AnyPool};

use crate::errors::{Error, Result};

/*
 * The two backends only disagree on how an auto-incrementing key is spelled, everything else
 * (foreign keys, the answers uniqueness constraint) is shared.
 *
 * answers.choice_id has no ON DELETE action, so removing a choice somebody picked fails
 * instead of taking their answer with it.
 */
const POSTGRES_KEY: &str = "BIGSERIAL PRIMARY KEY";
const SQLITE_KEY: &str = "INTEGER PRIMARY KEY AUTOINCREMENT";

fn tables(key: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS questions (
                id {},
                text TEXT NOT NULL,
                created_at BIGINT NOT NULL
            )",
            key
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS choices (
                id {},
                question_id BIGINT NOT NULL REFERENCES questions (id) ON DELETE CASCADE,
                text TEXT NOT NULL,
                votes BIGINT NOT NULL DEFAULT 0
            )",
            key
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS answers (
                id {},
                user_id BIGINT NOT NULL,
                question_id BIGINT NOT NULL REFERENCES questions (id) ON DELETE CASCADE,
                choice_id BIGINT NOT NULL REFERENCES choices (id),
                UNIQUE (user_id, question_id)
            )",
            key
        ),
        "CREATE INDEX IF NOT EXISTS choices_question_id ON choices (question_id)".to_string(),
        "CREATE INDEX IF NOT EXISTS answers_choice_id ON answers (choice_id)".to_string(),
    ]
}

/**
 * Create the survey tables if they do not exist yet
 */
pub async fn migrate(pool: &AnyPool) -> Result<()> {
    let key = match pool.any_kind() {
        AnyKind::Postgres => POSTGRES_KEY,
        AnyKind::Sqlite => SQLITE_KEY,
        #[allow(unreachable_patterns)]
        other => {
            return Err(Error::Config(format!(
                "Unsupported database backend: {:?}",
                other
            )))
        }
    };

    let mut tx = pool.begin().await?;
    for statement in tables(key) {
        debug!("Applying: {}", statement);
        sqlx::query(&statement).execute(&mut tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::db::test_store;

    #[async_std::test]
    async fn migrate_is_idempotent() {
        let store = test_store().await;
        super::migrate(&store.pool).await.expect("second migration");
    }

    #[async_std::test]
    async fn answers_are_unique_per_user_and_question() {
        let store = test_store().await;
        let pool = &store.pool;

        sqlx::query("INSERT INTO questions (text, created_at) VALUES ('q', 0)")
            .execute(pool)
            .await
            .expect("question");
        sqlx::query("INSERT INTO choices (question_id, text) VALUES (1, 'a')")
            .execute(pool)
            .await
            .expect("choice");
        sqlx::query("INSERT INTO answers (user_id, question_id, choice_id) VALUES (9, 1, 1)")
            .execute(pool)
            .await
            .expect("first answer");

        let err = sqlx::query("INSERT INTO answers (user_id, question_id, choice_id) VALUES (9, 1, 1)")
            .execute(pool)
            .await
            .expect_err("duplicate answer");
        assert!(crate::errors::is_unique_violation(&err));
    }
}
