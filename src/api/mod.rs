pub mod quiz_routes;
pub mod quiz_websocket;

use std::convert::Infallible;
use std::sync::Arc;

use warp::{Filter, Reply};

use crate::quiz::QuizService;

/// Every route the server exposes, with rejections rendered as JSON.
pub fn routes(
    service: Arc<QuizService>,
    ws_base: String,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    quiz_routes::quiz_websocket_route(service.clone())
        .or(quiz_routes::quiz_action_routes(service, ws_base))
        .or(quiz_routes::health_check())
        .recover(quiz_routes::handle_rejection)
        .with(warp::trace::request())
}
