pub mod agents;
pub mod helpers;
pub mod sessions;

use axum::Router;
use axum::routing::get;

use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(agents::router())
        .merge(sessions::router())
        .route("/agent/ws", get(crate::channel::socket::agent_channel))
        .route("/vnc/{session_id}", get(crate::proxy::vnc_stream))
        .route("/vnc-viewer/{session_id}", get(crate::proxy::vnc_viewer))
}
