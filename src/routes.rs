use std::{fmt::Display, sync::Arc};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{
            ACCEPT, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
            ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_TYPE,
            LOCATION,
        },
    },
    middleware,
    response::{IntoResponse, Response},
    routing,
};
use time::OffsetDateTime;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    api::{CreateLinkPayload, Error, ShortenedLink, SweepResult},
    link_service::LinkService,
};

#[derive(Clone)]
pub struct AppState {
    pub links: Arc<dyn LinkService>,
    /// Bearer token the on-demand sweep requires, if any.
    pub sweep_token: Option<Arc<str>>,
}

/// Every method on every path is served by the same handlers.
pub fn router(state: AppState) -> Router {
    let methods = routing::post(create_link)
        .delete(sweep_links)
        .options(preflight)
        .fallback(method_not_allowed);

    Router::new()
        .route("/", methods.clone())
        .route("/{*path}", methods)
        .layer(middleware::map_response(with_cors_headers))
        .with_state(state)
}

async fn with_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, DELETE, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    response
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn method_not_allowed() -> Response {
    error_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
}

#[instrument(skip(state, headers, body))]
async fn create_link(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let CreateLinkPayload { long_url, redirect } = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}"));
        }
    };

    let created = match state
        .links
        .create_link(long_url.as_deref().unwrap_or_default())
        .await
    {
        Ok(created) => created,
        Err(error) if error.is_client_error() => {
            return error_response(StatusCode::BAD_REQUEST, &error);
        }
        Err(error) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &error),
    };

    let short_url = created.record.short_url.clone();
    if redirect.is_some_and(|flag| flag.is_set()) {
        return (StatusCode::FOUND, [(LOCATION, short_url)]).into_response();
    }
    if prefers_plain_text(&headers) {
        return (
            [(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))],
            short_url,
        )
            .into_response();
    }
    Json(ShortenedLink::from(created)).into_response()
}

#[instrument(skip(state, headers))]
async fn sweep_links(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = &state.sweep_token {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if presented != Some(token.as_ref()) {
            return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    }

    match state.links.sweep_expired(OffsetDateTime::now_utc()).await {
        Ok(report) => Json(SweepResult::from(report)).into_response(),
        Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &error),
    }
}

fn error_response(status: StatusCode, error: impl Display) -> Response {
    let err_uuid = Uuid::new_v4();
    let message = error.to_string();
    if status.is_server_error() {
        error!(?err_uuid, %status, error = %message, "Encountered an error during a request");
    } else {
        info!(?err_uuid, %status, error = %message, "User submitted a bad request");
    }
    (
        status,
        Json(Error {
            error: message,
            error_id: err_uuid.to_string(),
        }),
    )
        .into_response()
}

/// Whether the highest-ranked media type in `Accept` is plain text or HTML.
fn prefers_plain_text(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(ACCEPT).and_then(|value| value.to_str().ok()) else {
        return false;
    };

    let mut best: Option<(&str, f32)> = None;
    for entry in accept.split(',') {
        let mut parts = entry.split(';');
        let media_type = parts.next().unwrap_or_default().trim();
        if media_type.is_empty() {
            continue;
        }
        let quality = parts
            .filter_map(|param| param.trim().strip_prefix("q="))
            .find_map(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);
        if best.is_none_or(|(_, best_quality)| quality > best_quality) {
            best = Some((media_type, quality));
        }
    }

    best.is_some_and(|(media_type, quality)| {
        quality > 0.0
            && (media_type.eq_ignore_ascii_case("text/plain")
                || media_type.eq_ignore_ascii_case("text/html"))
    })
}
