use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::alert::{ActiveAlert, AlertBoard};
use crate::projector::{next_reminder_label, Occurrence};
use crate::runtime::TimetableService;
use crate::session::{SessionError, SessionStatus};
use crate::timetable::{Entry, NewEntry};

#[derive(Clone)]
pub struct AppState {
    pub service: TimetableService,
    pub board: Arc<AlertBoard>,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn err(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

fn bad_body(rejection: JsonRejection) -> Response {
    info!("rejected request body: {rejection}");
    err(StatusCode::BAD_REQUEST, "bad_request")
}

#[derive(Deserialize)]
struct SwitchRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Serialize)]
struct StatusView {
    #[serde(flatten)]
    session: SessionStatus,
    alert: Option<ActiveAlert>,
}

#[derive(Serialize)]
struct NextView {
    label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    occurrence: Option<Occurrence>,
}

#[derive(Serialize)]
struct SaveView {
    saved: bool,
    message: &'static str,
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/session/switch", post(post_switch).options(options_ok))
        .route("/entries", get(get_entries).post(post_entry).options(options_ok))
        .route("/entries/:id", delete(delete_entry).options(options_ok))
        .route("/entries/clear", post(post_clear).options(options_ok))
        .route("/entries/save", post(post_save).options(options_ok))
        .route("/reminders/enable", post(post_reminders_enable).options(options_ok))
        .route("/reminders/disable", post(post_reminders_disable).options(options_ok))
        .route("/reminders/stop", post(post_reminders_stop).options(options_ok))
        .route("/reminders/next", get(get_next_reminder))
        .route("/reminders/alert", get(get_alert))
        .with_state(state)
        .layer(cors)
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

async fn health() -> impl IntoResponse {
    ok(HealthInfo {
        service: "timetable_core",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_status(State(state): State<AppState>) -> Response {
    let now = state.service.clock().now();
    let session = state.service.lock().await.session.status(now);
    ok(StatusView {
        session,
        alert: state.board.current(),
    })
}

async fn post_switch(
    State(state): State<AppState>,
    body: Result<Json<SwitchRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.service.switch_user(&req.username, &req.password).await {
        Ok(()) => get_status(State(state)).await,
        Err(SessionError::PasswordRequired) => {
            err(StatusCode::BAD_REQUEST, SessionError::PasswordRequired.code())
        }
        Err(e) => {
            error!("switch_user failed: {e}");
            err(StatusCode::INTERNAL_SERVER_ERROR, e.code())
        }
    }
}

async fn get_entries(State(state): State<AppState>) -> Response {
    let entries: Vec<Entry> = state.service.lock().await.session.sorted_entries();
    ok(entries)
}

async fn post_entry(
    State(state): State<AppState>,
    body: Result<Json<NewEntry>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    let mut shared = state.service.lock().await;
    match shared.session.add_entry(req) {
        Ok(entry) => {
            info!("entry added: {} {} {}-{}", entry.day, entry.subject, entry.start, entry.end);
            ok(entry)
        }
        Err(e) => err(StatusCode::BAD_REQUEST, e.code()),
    }
}

async fn delete_entry(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let mut shared = state.service.lock().await;
    if !shared.session.remove_entry(&id) {
        return err(StatusCode::NOT_FOUND, "not_found");
    }
    ok(SaveView {
        saved: shared.session.is_saved(),
        message: shared.session.save_status().message(),
    })
}

async fn post_clear(State(state): State<AppState>) -> Response {
    let mut shared = state.service.lock().await;
    shared.session.clear_entries();
    ok(SaveView {
        saved: shared.session.is_saved(),
        message: shared.session.save_status().message(),
    })
}

async fn post_save(State(state): State<AppState>) -> Response {
    let mut shared = state.service.lock().await;
    if shared.session.save_entries().is_err() {
        return err(StatusCode::INTERNAL_SERVER_ERROR, "save_failed");
    }
    ok(SaveView {
        saved: shared.session.is_saved(),
        message: shared.session.save_status().message(),
    })
}

async fn post_reminders_enable(State(state): State<AppState>) -> Response {
    state.service.enable_reminders().await;
    get_status(State(state)).await
}

async fn post_reminders_disable(State(state): State<AppState>) -> Response {
    state.service.disable_reminders().await;
    get_status(State(state)).await
}

async fn post_reminders_stop(State(state): State<AppState>) -> Response {
    state.service.stop_alert().await;
    get_status(State(state)).await
}

async fn get_next_reminder(State(state): State<AppState>) -> Response {
    let now = state.service.clock().now();
    let occurrence = state.service.lock().await.session.next_occurrence(now);
    ok(NextView {
        label: next_reminder_label(occurrence.as_ref()),
        occurrence,
    })
}

/// `data` is absent while no alert is active.
async fn get_alert(State(state): State<AppState>) -> Response {
    Json(OkResponse {
        ok: true,
        data: state.board.current(),
    })
    .into_response()
}
