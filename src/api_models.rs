use serde::{Deserialize, Serialize};

use crate::models::{Choice, Question};

/**
 * Result of asking for a user's next question
 */
#[derive(Clone, Debug, PartialEq)]
pub enum NextQuestion {
    Question(Question),
    /**
     * The user has answered every question there is
     */
    Exhausted,
}

/**
 * A question together with the choices to offer, ordered by id
 */
#[derive(Debug, Serialize)]
pub struct Prompt {
    pub question: Question,
    pub choices: Vec<Choice>,
}

/**
 * Response body for `GET /api/v1/users/:user_id/next`
 */
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum NextResponse {
    Prompt(Prompt),
    Exhausted { exhausted: bool },
}

/**
 * User-provided details to create a question
 */
#[derive(Debug, Deserialize)]
pub struct InsertableQuestion {
    pub text: String,
    /**
     * Just the text of each choice
     */
    pub choices: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Ballot {
    pub user_id: i64,
    pub choice_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TextUpdate {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct Created {
    pub id: i64,
}

/**
 * One line of a user's personal statistics
 */
#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
pub struct PersonalEntry {
    pub question_text: String,
    pub choice_text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChoiceStats {
    pub choice_id: i64,
    pub text: String,
    pub count: i64,
    pub percentage: f64,
}

/**
 * Results from a given question
 */
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuestionStats {
    pub question_id: i64,
    pub question_text: String,
    pub total_responses: i64,
    pub per_choice: Vec<ChoiceStats>,
}

/**
 * A message from an admin in the middle of a dialog
 */
#[derive(Debug, Deserialize)]
pub struct DialogMessage {
    pub text: String,
}
