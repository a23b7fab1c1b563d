use std::convert::Infallible;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use super::quiz_websocket::{self, ConnectQuery};
use crate::error::QuizError;
use crate::quiz::{FinalizeOutcome, QuizService};
use crate::storage::{QuizDefinition, QuizEvent, QuizEventId, User};

#[derive(Debug, Deserialize)]
pub struct CreateQuizRequest {
    pub quiz_event_name: String,
    pub quiz_json: QuizDefinition,
}

#[derive(Debug, Serialize)]
pub struct CreateQuizResponse {
    pub channel_code: String,
    pub quiz_event: QuizEvent,
    pub websocket_url: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinQuizRequest {
    pub channel_code: String,
}

/// `GET /ws?channel_code=..&user_id=..`
pub fn quiz_websocket_route(
    service: Arc<QuizService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<ConnectQuery>())
        .and(with_service(service))
        .map(|ws: warp::ws::Ws, query: ConnectQuery, service: Arc<QuizService>| {
            ws.on_upgrade(move |websocket| {
                quiz_websocket::handle_quiz_websocket(websocket, service, query)
            })
        })
}

/// Moderator and participant HTTP actions under `/quiz`.
pub fn quiz_action_routes(
    service: Arc<QuizService>,
    ws_base: String,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let create = warp::path!("quiz")
        .and(warp::post())
        .and(authenticated(service.clone()))
        .and(warp::body::json())
        .and(with_service(service.clone()))
        .and(warp::any().map(move || ws_base.clone()))
        .and_then(create_quiz);

    let join = warp::path!("quiz" / "join")
        .and(warp::post())
        .and(authenticated(service.clone()))
        .and(warp::body::json())
        .and(with_service(service.clone()))
        .and_then(join_quiz);

    let start = warp::path!("quiz" / QuizEventId / "start")
        .and(warp::post())
        .and(authenticated(service.clone()))
        .and(with_service(service.clone()))
        .and_then(start_quiz);

    let end = warp::path!("quiz" / QuizEventId / "end")
        .and(warp::post())
        .and(authenticated(service.clone()))
        .and(with_service(service.clone()))
        .and_then(end_quiz);

    let results = warp::path!("quiz" / QuizEventId / "results")
        .and(warp::get())
        .and(authenticated(service.clone()))
        .and(with_service(service))
        .and_then(quiz_results);

    join.or(create).or(start).or(end).or(results)
}

pub fn health_check() -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "Quiz Room Server",
                "version": env!("CARGO_PKG_VERSION")
            }))
        })
}

async fn create_quiz(
    user: User,
    request: CreateQuizRequest,
    service: Arc<QuizService>,
    ws_base: String,
) -> Result<impl Reply, Rejection> {
    let event = service
        .create_event(&user, request.quiz_event_name, request.quiz_json)
        .await
        .map_err(warp::reject::custom)?;

    let websocket_url = format!(
        "{}/ws?channel_code={}&user_id={}",
        ws_base,
        urlencoding::encode(&event.channel_code),
        user.id
    );
    let response = CreateQuizResponse {
        channel_code: event.channel_code.clone(),
        quiz_event: event,
        websocket_url,
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&response),
        StatusCode::CREATED,
    ))
}

async fn join_quiz(
    user: User,
    request: JoinQuizRequest,
    service: Arc<QuizService>,
) -> Result<impl Reply, Rejection> {
    let event = service
        .join_event(&user, &request.channel_code)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&serde_json::json!({
        "joined": true,
        "quiz_event": event,
    })))
}

async fn start_quiz(
    quiz_event_id: QuizEventId,
    user: User,
    service: Arc<QuizService>,
) -> Result<impl Reply, Rejection> {
    let schedule = service
        .start_event(&user, quiz_event_id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&serde_json::json!({
        "quiz_id": quiz_event_id,
        "start_time": schedule.start_time,
        "end_time": schedule.end_time,
    })))
}

async fn end_quiz(
    quiz_event_id: QuizEventId,
    user: User,
    service: Arc<QuizService>,
) -> Result<impl Reply, Rejection> {
    let outcome = service
        .end_event(&user, quiz_event_id)
        .await
        .map_err(warp::reject::custom)?;

    let body = match outcome {
        FinalizeOutcome::Finalized { scored, failed } => serde_json::json!({
            "quiz_id": quiz_event_id,
            "finalized": true,
            "scored": scored,
            "failed": failed,
        }),
        FinalizeOutcome::AlreadyFinalized => serde_json::json!({
            "quiz_id": quiz_event_id,
            "finalized": false,
        }),
    };
    Ok(warp::reply::json(&body))
}

async fn quiz_results(
    quiz_event_id: QuizEventId,
    user: User,
    service: Arc<QuizService>,
) -> Result<impl Reply, Rejection> {
    let results = service
        .results(&user, quiz_event_id)
        .await
        .map_err(warp::reject::custom)?;

    Ok(warp::reply::json(&results))
}

/// Resolves `Authorization: Bearer <token>` to a user.
fn authenticated(
    service: Arc<QuizService>,
) -> impl Filter<Extract = (User,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_service(service))
        .and_then(|header: Option<String>, service: Arc<QuizService>| async move {
            let Some(token) = header
                .as_deref()
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim)
                .filter(|token| !token.is_empty())
            else {
                return Err(warp::reject::custom(QuizError::Unauthenticated(
                    "missing bearer token".to_string(),
                )));
            };

            service
                .authenticate(token)
                .await
                .map_err(warp::reject::custom)
        })
}

fn with_service(
    service: Arc<QuizService>,
) -> impl Filter<Extract = (Arc<QuizService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

/// Turns every rejection into a `{"error": ...}` JSON body.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(e) = err.find::<QuizError>() {
        (e.status_code(), e.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        tracing::error!(rejection = ?err, "Unhandled rejection");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    };

    if status.is_server_error() {
        tracing::error!(status = %status, error = %message, "Request failed");
    } else {
        tracing::debug!(status = %status, error = %message, "Request rejected");
    }

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message })),
        status,
    ))
}
