//! HTTP routes: `GET /`, `GET /health` and `POST /sync`.

mod health;
mod sync;

pub use health::HealthResponse;

use crate::AppState;
use axum::Router;

pub fn create_routes() -> Router<AppState> {
    Router::new().merge(health::routes()).merge(sync::routes())
}
