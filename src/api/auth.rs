//! Authorization endpoints.
//!
//! - `GET /auth/{provider}` redirects to the provider's consent screen
//! - `GET /auth/{provider}/callback` completes the flow and answers with the
//!   popup page
//! - `GET /auth/callback` is the older Xero callback path

use super::{BrokerAppState, ProviderState};
use crate::error::BrokerError;
use crate::oauth::{CallbackQuery, PopupMessage};
use crate::provider::ProviderKind;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tracing::warn;

/// Create authorization router
pub fn create_auth_router(state: Arc<BrokerAppState>) -> Router {
    let mut router = Router::new();

    for kind in ProviderKind::ALL {
        let scoped = ProviderState {
            kind,
            app: state.clone(),
        };
        router = router
            .route(
                &format!("/auth/{}", kind),
                get(begin_auth).with_state(scoped.clone()),
            )
            .route(
                &format!("/auth/{}/callback", kind),
                get(callback).with_state(scoped),
            );
    }

    router.route(
        "/auth/callback",
        get(callback).with_state(ProviderState {
            kind: ProviderKind::Xero,
            app: state,
        }),
    )
}

/// GET /auth/{provider}
async fn begin_auth(State(state): State<ProviderState>) -> Result<Redirect, BrokerError> {
    let url = state.handle()?.flow.begin_auth();
    Ok(Redirect::temporary(&url))
}

/// GET /auth/{provider}/callback
///
/// Always answers with the popup page so the opener hears about failures
/// too. The status code still reflects the outcome.
async fn callback(State(state): State<ProviderState>, Query(query): Query<CallbackQuery>) -> Response {
    let outcome = match state.handle() {
        Ok(handle) => handle.flow.handle_callback(query).await,
        Err(e) => Err(e),
    };

    let (status, message) = match outcome {
        Ok(summary) => (StatusCode::OK, PopupMessage::success(summary)),
        Err(e) => {
            warn!(provider = %state.kind, error = %e, "Authorization callback failed");
            (e.status_code(), PopupMessage::error(state.kind, e.to_string()))
        }
    };

    (status, Html(message.render_page())).into_response()
}
