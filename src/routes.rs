/*!
 * The routes module contains all the tide routes and the logic to fulfill the responses for each
 * route.
 *
 * These handlers are a thin adapter: they parse ids and bodies, run the admin guard where
 * needed, and hand everything else to the `Store`.
 */
use log::*;
use tide::{Request, StatusCode};

use crate::errors::Error;
use crate::AppState;

/**
 * Map a core error onto an HTTP status
 */
pub fn http_error(err: Error) -> tide::Error {
    let status = match err {
        Error::NotFound(_) => StatusCode::NotFound,
        Error::AlreadyAnswered { .. } | Error::ChoiceHasVotes(_) => StatusCode::Conflict,
        Error::InvalidChoice { .. } | Error::InvalidInput(_) => StatusCode::UnprocessableEntity,
        Error::StorageUnavailable(_) => StatusCode::ServiceUnavailable,
        Error::Storage(_) | Error::Config(_) => {
            error!("Request failed: {}", err);
            StatusCode::InternalServerError
        }
    };
    tide::Error::from_str(status, err.to_string())
}

fn id_param(req: &Request<AppState>, name: &str) -> tide::Result<i64> {
    req.param(name)?
        .parse::<i64>()
        .map_err(|_| tide::Error::from_str(StatusCode::BadRequest, format!("Invalid {}", name)))
}

/**
 * The id of the user making the request, from the `X-User-Id` header
 */
fn caller(req: &Request<AppState>) -> tide::Result<i64> {
    req.header("X-User-Id")
        .and_then(|values| values.last().as_str().trim().parse::<i64>().ok())
        .ok_or_else(|| tide::Error::from_str(StatusCode::Unauthorized, "Missing X-User-Id"))
}

/**
 * Guard for every administrative handler, returns the admin's id
 */
fn require_admin(req: &Request<AppState>) -> tide::Result<i64> {
    let user_id = caller(req)?;
    if req.state().settings.is_admin(user_id) {
        Ok(user_id)
    } else {
        warn!("User {} attempted an admin operation", user_id);
        Err(tide::Error::from_str(
            StatusCode::Forbidden,
            "Administrator access required",
        ))
    }
}

/**
 *  GET /
 */
pub async fn index(_req: Request<AppState>) -> tide::Result<String> {
    Ok("Wilkommen".to_string())
}

pub mod users {
    use tide::{Body, Request};

    use super::{http_error, id_param};
    use crate::api_models::{NextQuestion, NextResponse, Prompt};
    use crate::AppState;

    /**
     *  GET /api/v1/users/:user_id/next
     */
    pub async fn next(req: Request<AppState>) -> tide::Result<Body> {
        let user_id = id_param(&req, "user_id")?;
        let store = &req.state().store;

        let response = match store.next_unanswered_question(user_id).await.map_err(http_error)? {
            NextQuestion::Question(question) => {
                let choices = store.list_choices(question.id).await.map_err(http_error)?;
                NextResponse::Prompt(Prompt { question, choices })
            }
            NextQuestion::Exhausted => NextResponse::Exhausted { exhausted: true },
        };
        Body::from_json(&response)
    }

    /**
     *  GET /api/v1/users/:user_id/stats
     */
    pub async fn stats(req: Request<AppState>) -> tide::Result<Body> {
        let user_id = id_param(&req, "user_id")?;
        let entries = req
            .state()
            .store
            .personal_stats(user_id)
            .await
            .map_err(http_error)?;
        Body::from_json(&entries)
    }
}

pub mod questions {
    use log::*;
    use tide::{Body, Request, Response, StatusCode};

    use super::{http_error, id_param, require_admin};
    use crate::api_models::{Ballot, Created, InsertableQuestion, Prompt, TextUpdate};
    use crate::AppState;

    /**
     *  POST /api/v1/questions/:id/answers
     */
    pub async fn answer(mut req: Request<AppState>) -> tide::Result<Response> {
        let question_id = id_param(&req, "id")?;
        let ballot: Ballot = req.body_json().await?;
        debug!("Ballot received for question {}: {:?}", question_id, ballot);

        req.state()
            .store
            .record_answer(ballot.user_id, question_id, ballot.choice_id)
            .await
            .map_err(http_error)?;
        Ok(Response::builder(StatusCode::Created).body("voted").build())
    }

    /**
     *  GET /api/v1/questions
     */
    pub async fn list(req: Request<AppState>) -> tide::Result<Body> {
        require_admin(&req)?;
        let questions = req.state().store.list_questions().await.map_err(http_error)?;
        Body::from_json(&questions)
    }

    /**
     *  PUT /api/v1/questions
     */
    pub async fn create(mut req: Request<AppState>) -> tide::Result<Response> {
        let admin = require_admin(&req)?;
        let question: InsertableQuestion = req.body_json().await?;
        debug!("Question received from {}: {:?}", admin, question);

        let id = req
            .state()
            .store
            .create_question(&question.text, &question.choices)
            .await
            .map_err(http_error)?;
        Ok(Response::builder(StatusCode::Created)
            .body(Body::from_json(&Created { id })?)
            .build())
    }

    /**
     *  GET /api/v1/questions/:id
     */
    pub async fn get(req: Request<AppState>) -> tide::Result<Body> {
        require_admin(&req)?;
        let id = id_param(&req, "id")?;
        let (question, choices) = req
            .state()
            .store
            .question_with_choices(id)
            .await
            .map_err(http_error)?;
        Body::from_json(&Prompt { question, choices })
    }

    /**
     *  PATCH /api/v1/questions/:id
     */
    pub async fn rename(mut req: Request<AppState>) -> tide::Result<StatusCode> {
        require_admin(&req)?;
        let id = id_param(&req, "id")?;
        let update: TextUpdate = req.body_json().await?;
        req.state()
            .store
            .edit_question_text(id, &update.text)
            .await
            .map_err(http_error)?;
        Ok(StatusCode::NoContent)
    }

    /**
     *  DELETE /api/v1/questions/:id
     */
    pub async fn delete(req: Request<AppState>) -> tide::Result<StatusCode> {
        let admin = require_admin(&req)?;
        let id = id_param(&req, "id")?;
        req.state().store.delete_question(id).await.map_err(http_error)?;
        info!("Admin {} deleted question {}", admin, id);
        Ok(StatusCode::NoContent)
    }

    /**
     *  POST /api/v1/questions/:id/choices
     */
    pub async fn add_choice(mut req: Request<AppState>) -> tide::Result<Response> {
        require_admin(&req)?;
        let id = id_param(&req, "id")?;
        let choice: TextUpdate = req.body_json().await?;
        let choice_id = req
            .state()
            .store
            .add_choice_to_question(id, &choice.text)
            .await
            .map_err(http_error)?;
        Ok(Response::builder(StatusCode::Created)
            .body(Body::from_json(&Created { id: choice_id })?)
            .build())
    }

    /**
     *  GET /api/v1/questions/:id/stats
     */
    pub async fn stats(req: Request<AppState>) -> tide::Result<Body> {
        require_admin(&req)?;
        let id = id_param(&req, "id")?;
        let stats = req.state().store.question_stats(id).await.map_err(http_error)?;
        Body::from_json(&stats)
    }

    /**
     *  GET /api/v1/stats
     */
    pub async fn all_stats(req: Request<AppState>) -> tide::Result<Body> {
        require_admin(&req)?;
        let stats = req.state().store.all_stats().await.map_err(http_error)?;
        Body::from_json(&stats)
    }
}

pub mod choices {
    use tide::{Request, StatusCode};

    use super::{http_error, id_param, require_admin};
    use crate::api_models::TextUpdate;
    use crate::AppState;

    /**
     *  PATCH /api/v1/choices/:id
     */
    pub async fn rename(mut req: Request<AppState>) -> tide::Result<StatusCode> {
        require_admin(&req)?;
        let id = id_param(&req, "id")?;
        let update: TextUpdate = req.body_json().await?;
        req.state()
            .store
            .edit_choice_text(id, &update.text)
            .await
            .map_err(http_error)?;
        Ok(StatusCode::NoContent)
    }

    /**
     *  DELETE /api/v1/choices/:id
     */
    pub async fn delete(req: Request<AppState>) -> tide::Result<StatusCode> {
        require_admin(&req)?;
        let id = id_param(&req, "id")?;
        req.state().store.delete_choice(id).await.map_err(http_error)?;
        Ok(StatusCode::NoContent)
    }
}

pub mod dialog {
    use tide::{Body, Request, StatusCode};

    use super::{http_error, require_admin};
    use crate::api_models::DialogMessage;
    use crate::dialog::DialogStart;
    use crate::AppState;

    /**
     *  GET /api/v1/dialog
     */
    pub async fn get(req: Request<AppState>) -> tide::Result<Body> {
        let admin = require_admin(&req)?;
        let session = req.state().dialogs.session(admin).await;
        Body::from_json(&session)
    }

    /**
     *  POST /api/v1/dialog/start
     */
    pub async fn start(mut req: Request<AppState>) -> tide::Result<Body> {
        let admin = require_admin(&req)?;
        let start: DialogStart = req.body_json().await?;
        let state = req.state().dialogs.begin(admin, start).await;
        Body::from_json(&state)
    }

    /**
     *  POST /api/v1/dialog
     */
    pub async fn message(mut req: Request<AppState>) -> tide::Result<Body> {
        let admin = require_admin(&req)?;
        let message: DialogMessage = req.body_json().await?;
        let state = req.state();
        let reply = state
            .dialogs
            .handle_text(&state.store, admin, &message.text)
            .await
            .map_err(http_error)?;
        Body::from_json(&reply)
    }

    /**
     *  DELETE /api/v1/dialog
     */
    pub async fn cancel(req: Request<AppState>) -> tide::Result<StatusCode> {
        let admin = require_admin(&req)?;
        req.state().dialogs.cancel(admin).await;
        Ok(StatusCode::NoContent)
    }
}

/**
 * Mount every route onto a new tide server
 */
pub fn build(state: AppState) -> tide::Server<AppState> {
    let mut app = tide::with_state(state);
    app.at("/").get(index);
    app.at("/api/v1/users/:user_id/next").get(users::next);
    app.at("/api/v1/users/:user_id/stats").get(users::stats);
    app.at("/api/v1/questions")
        .get(questions::list)
        .put(questions::create);
    app.at("/api/v1/questions/:id")
        .get(questions::get)
        .patch(questions::rename)
        .delete(questions::delete);
    app.at("/api/v1/questions/:id/answers").post(questions::answer);
    app.at("/api/v1/questions/:id/choices").post(questions::add_choice);
    app.at("/api/v1/questions/:id/stats").get(questions::stats);
    app.at("/api/v1/stats").get(questions::all_stats);
    app.at("/api/v1/choices/:id")
        .patch(choices::rename)
        .delete(choices::delete);
    app.at("/api/v1/dialog")
        .get(dialog::get)
        .post(dialog::message)
        .delete(dialog::cancel);
    app.at("/api/v1/dialog/start").post(dialog::start);
    app
}
