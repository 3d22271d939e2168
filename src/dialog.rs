use std::collections::HashMap;
use std::sync::Arc;

use async_std::sync::Mutex;
use chrono::{DateTime, Utc};
use log::*;
use serde::{Deserialize, Serialize};

use crate::admin::{parse_choice_lines, validate_text};
use crate::db::Store;
use crate::errors::{Error, Result};

/**
 * Where an admin is in a multi-step edit
 */
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DialogState {
    Idle,
    AwaitingQuestionText,
    AwaitingChoices { question_text: String },
    AwaitingQuestionEdit { question_id: i64 },
    AwaitingChoiceEdit { choice_id: i64 },
    AwaitingNewChoice { question_id: i64 },
}

/**
 * The action an admin picked from the menu
 */
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DialogStart {
    CreateQuestion,
    EditQuestion { question_id: i64 },
    EditChoice { choice_id: i64 },
    AddChoice { question_id: i64 },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum DialogReply {
    AskChoices,
    QuestionCreated { question_id: i64 },
    QuestionUpdated { question_id: i64 },
    ChoiceUpdated { choice_id: i64 },
    ChoiceAdded { question_id: i64, choice_id: i64 },
    /**
     * The user has no dialog in progress, the text is not for us
     */
    NoDialog,
}

#[derive(Clone, Debug, Serialize)]
pub struct DialogSession {
    pub state: DialogState,
    pub updated_at: DateTime<Utc>,
}

/**
 * Per-user dialog sessions
 *
 * This is conversation bookkeeping only. Nothing in the voting or statistics code looks at it,
 * and losing it (a restart) just drops the admin back to the menu.
 */
#[derive(Clone, Debug)]
pub struct Dialogs {
    sessions: Arc<Mutex<HashMap<i64, DialogSession>>>,
}

impl Default for Dialogs {
    fn default() -> Self {
        Dialogs {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Dialogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session(&self, user_id: i64) -> Option<DialogSession> {
        self.sessions.lock().await.get(&user_id).cloned()
    }

    #[cfg(test)]
    pub async fn state(&self, user_id: i64) -> DialogState {
        self.session(user_id)
            .await
            .map(|s| s.state)
            .unwrap_or(DialogState::Idle)
    }

    pub async fn begin(&self, user_id: i64, start: DialogStart) -> DialogState {
        let state = match start {
            DialogStart::CreateQuestion => DialogState::AwaitingQuestionText,
            DialogStart::EditQuestion { question_id } => {
                DialogState::AwaitingQuestionEdit { question_id }
            }
            DialogStart::EditChoice { choice_id } => DialogState::AwaitingChoiceEdit { choice_id },
            DialogStart::AddChoice { question_id } => {
                DialogState::AwaitingNewChoice { question_id }
            }
        };
        debug!("User {} starts dialog {:?}", user_id, state);
        self.set(user_id, state.clone()).await;
        state
    }

    pub async fn cancel(&self, user_id: i64) {
        self.set(user_id, DialogState::Idle).await;
    }

    /**
     * Remove and return the user's state, leaving them idle
     */
    async fn take(&self, user_id: i64) -> DialogState {
        self.sessions
            .lock()
            .await
            .remove(&user_id)
            .map(|s| s.state)
            .unwrap_or(DialogState::Idle)
    }

    async fn set(&self, user_id: i64, state: DialogState) {
        let mut sessions = self.sessions.lock().await;
        if state == DialogState::Idle {
            sessions.remove(&user_id);
        } else {
            sessions.insert(
                user_id,
                DialogSession {
                    state,
                    updated_at: Utc::now(),
                },
            );
        }
    }

    /**
     * Feed the next message of an admin's dialog
     *
     * Invalid input leaves the dialog where it is so the admin can try again; any other outcome
     * ends it. The session is taken out of the map while the store is being written, so a second
     * message arriving meanwhile gets `NoDialog` instead of acting on the same step twice.
     */
    pub async fn handle_text(&self, store: &Store, user_id: i64, text: &str) -> Result<DialogReply> {
        let state = self.take(user_id).await;

        let (next, outcome) = match state {
            DialogState::Idle => return Ok(DialogReply::NoDialog),
            DialogState::AwaitingQuestionText => match validate_text("question", text) {
                Ok(question_text) => (
                    DialogState::AwaitingChoices { question_text },
                    Ok(DialogReply::AskChoices),
                ),
                Err(err) => (DialogState::AwaitingQuestionText, Err(err)),
            },
            DialogState::AwaitingChoices { ref question_text } => {
                let choices = parse_choice_lines(text);
                let result = store
                    .create_question(question_text, &choices)
                    .await
                    .map(|question_id| DialogReply::QuestionCreated { question_id });
                (DialogState::Idle, result)
            }
            DialogState::AwaitingQuestionEdit { question_id } => {
                let result = store
                    .edit_question_text(question_id, text)
                    .await
                    .map(|_| DialogReply::QuestionUpdated { question_id });
                (DialogState::Idle, result)
            }
            DialogState::AwaitingChoiceEdit { choice_id } => {
                let result = store
                    .edit_choice_text(choice_id, text)
                    .await
                    .map(|_| DialogReply::ChoiceUpdated { choice_id });
                (DialogState::Idle, result)
            }
            DialogState::AwaitingNewChoice { question_id } => {
                let result = store
                    .add_choice_to_question(question_id, text)
                    .await
                    .map(|choice_id| DialogReply::ChoiceAdded {
                        question_id,
                        choice_id,
                    });
                (DialogState::Idle, result)
            }
        };

        match outcome {
            Err(Error::InvalidInput(reason)) => {
                warn!("User {} sent invalid dialog input: {}", user_id, reason);
                // Stay put and let them try again
                self.set(user_id, state).await;
                Err(Error::InvalidInput(reason))
            }
            other => {
                self.set(user_id, next).await;
                other
            }
        }
    }
}
