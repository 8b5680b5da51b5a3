//! The axum surface.

mod accesses;
mod auth;
mod events;
mod users;

use axum::Router;
use axum::extract::FromRequest;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::RequestError;
use crate::SharedState;

/// JSON body wrapper whose rejection maps into the API error taxonomy
/// (`invalid-parameters-format`) instead of axum's default.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(RequestError))]
pub struct AppJson<T>(pub T);

impl<T> IntoResponse for AppJson<T>
where
    axum::Json<T>: IntoResponse,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/users", post(users::register))
        .route("/users/{username}", delete(users::delete_user))
        .route("/{username}/auth/login", post(auth::login))
        .route("/{username}/auth/logout", post(auth::logout))
        .route(
            "/{username}/events",
            get(events::list).post(events::create),
        )
        .route(
            "/{username}/events/{id}",
            get(events::get_one)
                .put(events::update)
                .delete(events::delete),
        )
        .route(
            "/{username}/accesses",
            get(accesses::list).post(accesses::create),
        )
        .route("/{username}/accesses/check-app", post(accesses::check_app))
        .route("/{username}/accesses/{id}", delete(accesses::delete))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
