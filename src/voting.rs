use std::sync::atomic::{AtomicBool, Ordering};

use log::*;

use crate::api_models::NextQuestion;
use crate::db::Store;
use crate::errors::{is_foreign_key_violation, is_unique_violation, Error, Result};
use crate::models::{AnswerRecord, Choice, Question};

impl Store {
    /**
     * Pick a random question the user has not answered yet
     *
     * The candidate set is computed by the database on every call, so a question answered a
     * moment ago is never offered again.
     */
    pub async fn next_unanswered_question(&self, user_id: i64) -> Result<NextQuestion> {
        self.with_retry("next_unanswered_question", |_| async move {
            let question = sqlx::query_as::<_, Question>(
                "SELECT id, text, created_at FROM questions
                 WHERE id NOT IN (SELECT question_id FROM answers WHERE user_id = $1)
                 ORDER BY RANDOM()
                 LIMIT 1",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

            match question {
                Some(question) => {
                    debug!(
                        "Offering question {} (published {:?}) to user {}",
                        question.id,
                        question.published(),
                        user_id
                    );
                    Ok(NextQuestion::Question(question))
                }
                None => {
                    info!("User {} has no unanswered questions left", user_id);
                    Ok(NextQuestion::Exhausted)
                }
            }
        })
        .await
    }

    pub async fn list_choices(&self, question_id: i64) -> Result<Vec<Choice>> {
        self.with_retry("list_choices", |_| async move {
            let choices = sqlx::query_as::<_, Choice>(
                "SELECT id, question_id, text, votes FROM choices WHERE question_id = $1 ORDER BY id ASC",
            )
            .bind(question_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(choices)
        })
        .await
    }

    /**
     * Look up the answer a user gave to a question, if any
     */
    pub async fn find_answer(&self, user_id: i64, question_id: i64) -> Result<Option<AnswerRecord>> {
        let answer = sqlx::query_as::<_, AnswerRecord>(
            "SELECT id, user_id, question_id, choice_id FROM answers
             WHERE user_id = $1 AND question_id = $2",
        )
        .bind(user_id)
        .bind(question_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(answer)
    }

    /**
     * Record a user's answer and bump the choice's vote counter in one transaction
     *
     * Uniqueness is enforced by the `(user_id, question_id)` constraint on `answers`; a
     * violation comes back as `Error::AlreadyAnswered` with nothing written.
     *
     * Only a failure inside `COMMIT` leaves the outcome unknown. When an earlier attempt got
     * that far, the retry first looks for the row it may have written; any other failure
     * wrote nothing, so an existing row belongs to a competing request and the retry runs the
     * insert again, which reports `AlreadyAnswered`.
     */
    pub async fn record_answer(&self, user_id: i64, question_id: i64, choice_id: i64) -> Result<()> {
        debug!(
            "Recording answer from user {} to question {}: choice {}",
            user_id, question_id, choice_id
        );

        let committing = &AtomicBool::new(false);
        self.with_retry("record_answer", |_| async move {
            if committing.load(Ordering::SeqCst) {
                if let Some(existing) = self.find_answer(user_id, question_id).await? {
                    return settle_existing(&existing, choice_id);
                }
            }
            self.insert_answer(user_id, question_id, choice_id, committing)
                .await
        })
        .await
    }

    /**
     * One attempt at writing the answer. `committing` is set once the attempt reaches `COMMIT`
     * and is never cleared.
     */
    async fn insert_answer(
        &self,
        user_id: i64,
        question_id: i64,
        choice_id: i64,
        committing: &AtomicBool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let owner: Option<i64> =
            sqlx::query_scalar::<_, i64>("SELECT question_id FROM choices WHERE id = $1")
                .bind(choice_id)
                .fetch_optional(&mut tx)
                .await?;

        if owner != Some(question_id) {
            let question: Option<i64> = sqlx::query_scalar::<_, i64>("SELECT id FROM questions WHERE id = $1")
                .bind(question_id)
                .fetch_optional(&mut tx)
                .await?;

            if question.is_none() {
                return Err(Error::not_found("question", question_id));
            }
            warn!(
                "User {} submitted choice {} which is not part of question {}",
                user_id, choice_id, question_id
            );
            return Err(Error::InvalidChoice {
                question_id,
                choice_id,
            });
        }

        let inserted = sqlx::query(
            "INSERT INTO answers (user_id, question_id, choice_id) VALUES ($1, $2, $3)",
        )
        .bind(user_id)
        .bind(question_id)
        .bind(choice_id)
        .execute(&mut tx)
        .await;

        if let Err(err) = inserted {
            return Err(insert_failure(err, user_id, question_id, choice_id));
        }

        sqlx::query("UPDATE choices SET votes = votes + 1 WHERE id = $1")
            .bind(choice_id)
            .execute(&mut tx)
            .await?;

        committing.store(true, Ordering::SeqCst);
        tx.commit().await?;
        info!(
            "User {} answered question {} with choice {}",
            user_id, question_id, choice_id
        );
        Ok(())
    }
}

/**
 * Translate a failed answer insert into the caller's terms
 *
 * A foreign-key failure means the choice was deleted after the ownership check.
 */
fn insert_failure(err: sqlx::Error, user_id: i64, question_id: i64, choice_id: i64) -> Error {
    if is_unique_violation(&err) {
        warn!("User {} already answered question {}", user_id, question_id);
        Error::AlreadyAnswered {
            user_id,
            question_id,
        }
    } else if is_foreign_key_violation(&err) {
        warn!("Choice {} disappeared while user {} was answering", choice_id, user_id);
        Error::InvalidChoice {
            question_id,
            choice_id,
        }
    } else {
        err.into()
    }
}

/**
 * Decide the outcome of a retried vote when an answer row already exists
 */
fn settle_existing(existing: &AnswerRecord, choice_id: i64) -> Result<()> {
    if existing.choice_id == choice_id {
        info!(
            "Answer from user {} to question {} was committed by an earlier attempt",
            existing.user_id, existing.question_id
        );
        Ok(())
    } else {
        Err(Error::AlreadyAnswered {
            user_id: existing.user_id,
            question_id: existing.question_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{pooled_test_store, test_store};
    use async_std::task;

    async fn choice_id(store: &Store, question_id: i64, text: &str) -> i64 {
        store
            .list_choices(question_id)
            .await
            .expect("choices")
            .into_iter()
            .find(|c| c.text == text)
            .map(|c| c.id)
            .expect("choice exists")
    }

    async fn votes(store: &Store, choice_id: i64) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT votes FROM choices WHERE id = $1")
            .bind(choice_id)
            .fetch_one(&store.pool)
            .await
            .expect("votes")
    }

    async fn answer_count(store: &Store, question_id: i64) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM answers WHERE question_id = $1")
            .bind(question_id)
            .fetch_one(&store.pool)
            .await
            .expect("count")
    }

    async fn vote_total(store: &Store, question_id: i64) -> i64 {
        store
            .list_choices(question_id)
            .await
            .expect("choices")
            .iter()
            .map(|c| c.votes)
            .sum()
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[async_std::test]
    async fn second_answer_is_rejected_without_counting() {
        let store = test_store().await;
        let q = store.create_question("Coffee?", &texts(&["yes", "no"])).await.expect("create");
        let yes = choice_id(&store, q, "yes").await;
        let no = choice_id(&store, q, "no").await;

        store.record_answer(1, q, yes).await.expect("first answer");
        assert_eq!(votes(&store, yes).await, 1);

        for again in &[yes, no] {
            let err = store.record_answer(1, q, *again).await.expect_err("second answer");
            assert!(matches!(err, Error::AlreadyAnswered { user_id: 1, .. }));
        }
        assert_eq!(votes(&store, yes).await, 1);
        assert_eq!(votes(&store, no).await, 0);
        assert_eq!(answer_count(&store, q).await, 1);
    }

    #[async_std::test]
    async fn choice_from_another_question_is_invalid() {
        let store = test_store().await;
        let q1 = store.create_question("Q1", &texts(&["yes", "no"])).await.expect("q1");
        let q2 = store.create_question("Q2", &texts(&["a", "b"])).await.expect("q2");
        let a = choice_id(&store, q2, "a").await;

        let err = store.record_answer(1, q1, a).await.expect_err("foreign choice");
        assert!(matches!(err, Error::InvalidChoice { .. }));

        let err = store.record_answer(1, q1, 9_999).await.expect_err("missing choice");
        assert!(matches!(err, Error::InvalidChoice { .. }));

        assert_eq!(votes(&store, a).await, 0);
        assert_eq!(answer_count(&store, q1).await, 0);
        assert!(store.find_answer(1, q1).await.expect("lookup").is_none());
    }

    #[async_std::test]
    async fn answering_a_missing_question_is_not_found() {
        let store = test_store().await;
        let err = store.record_answer(1, 404, 1).await.expect_err("no question");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[async_std::test]
    async fn questions_are_offered_until_exhausted() {
        let store = test_store().await;
        let q1 = store.create_question("Q1", &texts(&["yes", "no"])).await.expect("q1");
        let q2 = store.create_question("Q2", &texts(&["a", "b"])).await.expect("q2");
        let user = 77;

        store
            .record_answer(user, q1, choice_id(&store, q1, "yes").await)
            .await
            .expect("answer q1");

        for _ in 0..10 {
            match store.next_unanswered_question(user).await.expect("next") {
                NextQuestion::Question(q) => assert_eq!(q.id, q2),
                NextQuestion::Exhausted => panic!("Q2 is still unanswered"),
            }
        }

        store
            .record_answer(user, q2, choice_id(&store, q2, "b").await)
            .await
            .expect("answer q2");
        assert_eq!(
            store.next_unanswered_question(user).await.expect("next"),
            NextQuestion::Exhausted
        );

        // Another user still sees both
        assert!(matches!(
            store.next_unanswered_question(user + 1).await.expect("next"),
            NextQuestion::Question(_)
        ));
    }

    #[async_std::test]
    async fn no_questions_means_exhausted() {
        let store = test_store().await;
        assert_eq!(
            store.next_unanswered_question(1).await.expect("next"),
            NextQuestion::Exhausted
        );
    }

    #[async_std::test]
    async fn choices_are_listed_in_id_order() {
        let store = test_store().await;
        let q = store
            .create_question("Pick", &texts(&["first", "second", "third"]))
            .await
            .expect("create");

        let choices = store.list_choices(q).await.expect("choices");
        let ids: Vec<i64> = choices.iter().map(|c| c.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(
            choices.iter().map(|c| c.text.as_str()).collect::<Vec<_>>(),
            vec!["first", "second", "third"]
        );
    }

    #[async_std::test]
    async fn vote_counters_match_answer_records() {
        let store = test_store().await;
        let q = store.create_question("Tea?", &texts(&["green", "black"])).await.expect("create");
        let green = choice_id(&store, q, "green").await;
        let black = choice_id(&store, q, "black").await;

        for user in 1..=5 {
            let choice = if user % 2 == 0 { green } else { black };
            store.record_answer(user, q, choice).await.expect("answer");
            // A duplicate attempt must not move the counters
            let _ = store.record_answer(user, q, green).await;
            assert_eq!(vote_total(&store, q).await, answer_count(&store, q).await);
        }

        assert_eq!(votes(&store, green).await, 2);
        assert_eq!(votes(&store, black).await, 3);
    }

    async fn race(store: &Store, user_id: i64, q: i64, first: i64, second: i64) -> Vec<Result<()>> {
        let a = {
            let store = store.clone();
            task::spawn(async move { store.record_answer(user_id, q, first).await })
        };
        let b = {
            let store = store.clone();
            task::spawn(async move { store.record_answer(user_id, q, second).await })
        };
        vec![a.await, b.await]
    }

    fn assert_one_winner(user_id: i64, results: &[Result<()>]) {
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(Error::AlreadyAnswered { .. })))
            .count();
        assert_eq!(succeeded, 1, "user {} got {} successes", user_id, succeeded);
        assert_eq!(duplicates, 1, "user {} got {} duplicates", user_id, duplicates);
    }

    #[async_std::test]
    async fn concurrent_answers_from_one_user_count_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = pooled_test_store(&dir).await;
        let q = store.create_question("Q1", &texts(&["yes", "no"])).await.expect("create");
        let yes = choice_id(&store, q, "yes").await;
        let no = choice_id(&store, q, "no").await;

        for user in 1..=25 {
            let results = race(&store, user, q, yes, no).await;
            assert_one_winner(user, &results);
        }
        assert_eq!(vote_total(&store, q).await, 25);
        assert_eq!(answer_count(&store, q).await, 25);
    }

    #[async_std::test]
    async fn identical_concurrent_answers_report_the_duplicate() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = pooled_test_store(&dir).await;
        let q = store.create_question("Q1", &texts(&["yes", "no"])).await.expect("create");
        let yes = choice_id(&store, q, "yes").await;

        for user in 1..=25 {
            let results = race(&store, user, q, yes, yes).await;
            assert_one_winner(user, &results);
        }
        assert_eq!(votes(&store, yes).await, 25);
        assert_eq!(answer_count(&store, q).await, 25);
    }

    #[async_std::test]
    async fn vanished_choice_is_an_invalid_choice() {
        let store = test_store().await;
        let q = store.create_question("Q1", &texts(&["yes", "no"])).await.expect("create");

        let err = sqlx::query("INSERT INTO answers (user_id, question_id, choice_id) VALUES ($1, $2, $3)")
            .bind(1_i64)
            .bind(q)
            .bind(9_999_i64)
            .execute(&store.pool)
            .await
            .expect_err("choice does not exist");
        assert!(matches!(
            insert_failure(err, 1, q, 9_999),
            Error::InvalidChoice { choice_id: 9_999, .. }
        ));
    }

    #[test]
    fn retried_vote_settles_against_committed_answer() {
        let existing = AnswerRecord {
            id: 1,
            user_id: 3,
            question_id: 4,
            choice_id: 5,
        };
        assert!(settle_existing(&existing, 5).is_ok());
        assert!(matches!(
            settle_existing(&existing, 6),
            Err(Error::AlreadyAnswered { user_id: 3, question_id: 4 })
        ));
    }
}
