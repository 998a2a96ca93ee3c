use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

use crate::arbiter::{Origin, SharedController};
use crate::error::ControllerError;
use crate::schedule::ZoneSchedule;
use crate::supervisor::Mode;

const INDEX_HTML: &str = include_str!("ui/index.html");

#[derive(Clone)]
pub struct AppState {
    pub controller: SharedController,
    pub mode: watch::Receiver<Mode>,
}

impl IntoResponse for ControllerError {
    fn into_response(self) -> Response {
        let status = match self {
            ControllerError::InvalidZone { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ControllerError>;

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RelayChange {
    zone: usize,
    on: bool,
    changed: bool,
}

#[derive(Debug, Deserialize)]
struct TimerBody {
    minutes: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleBody {
    #[serde(default)]
    days: Vec<String>,
    on_time: Option<String>,
    off_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnabledBody {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RainDelayBody {
    days: u32,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/relay/{zone}/{state}", get(toggle_relay).post(toggle_relay))
        .route("/timer/{zone}", post(start_timer).delete(cancel_timer))
        .route("/set-schedule/{zone}", post(set_schedule))
        .route("/schedule/{zone}/enabled", post(set_schedule_enabled))
        .route("/rain-delay", post(set_rain_delay))
        .route("/get-relay-states", get(relay_states))
        .route("/get-schedules", get(schedules))
        .route("/api/status", get(api_status))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn toggle_relay(
    State(app): State<AppState>,
    Path((zone, state)): Path<(usize, String)>,
) -> ApiResult<RelayChange> {
    let changed = app.controller.toggle_relay(zone, &state).await?;
    let on = app.controller.relay_states().await[zone];
    Ok(Json(RelayChange { zone, on, changed }))
}

async fn start_timer(
    State(app): State<AppState>,
    Path(zone): Path<usize>,
    Json(body): Json<TimerBody>,
) -> ApiResult<serde_json::Value> {
    let now = Instant::now();
    let end = app
        .controller
        .start_timer(zone, body.minutes, now, Origin::Manual)
        .await?;
    Ok(Json(json!({
        "zone": zone,
        "minutes": body.minutes,
        "remaining_secs": end.saturating_duration_since(now).as_secs(),
    })))
}

async fn cancel_timer(
    State(app): State<AppState>,
    Path(zone): Path<usize>,
) -> ApiResult<serde_json::Value> {
    let cancelled = app.controller.cancel_timer(zone).await?;
    Ok(Json(json!({ "zone": zone, "cancelled": cancelled })))
}

async fn set_schedule(
    State(app): State<AppState>,
    Path(zone): Path<usize>,
    Json(body): Json<ScheduleBody>,
) -> ApiResult<ZoneSchedule> {
    let updated = app
        .controller
        .set_schedule(
            zone,
            &body.days,
            body.on_time.as_deref(),
            body.off_time.as_deref(),
        )
        .await?;
    Ok(Json(updated))
}

async fn set_schedule_enabled(
    State(app): State<AppState>,
    Path(zone): Path<usize>,
    Json(body): Json<EnabledBody>,
) -> ApiResult<serde_json::Value> {
    app.controller
        .set_schedule_enabled(zone, body.enabled, Origin::Manual)
        .await?;
    Ok(Json(json!({ "zone": zone, "enabled": body.enabled })))
}

async fn set_rain_delay(
    State(app): State<AppState>,
    Json(body): Json<RainDelayBody>,
) -> ApiResult<serde_json::Value> {
    let days = app.controller.set_rain_delay(body.days).await?;
    Ok(Json(json!({ "days": days })))
}

async fn relay_states(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.controller.relay_states().await)
}

async fn schedules(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.controller.schedules().await)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let mode = *app.mode.borrow();
    Json(app.controller.status(mode, Instant::now()).await)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web ui listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{controller, Harness};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn app(zones: usize) -> (Harness, Router, watch::Sender<Mode>) {
        let h = controller(zones).await;
        let (tx, rx) = watch::channel(Mode::Full);
        let router = router(AppState {
            controller: h.ctl.clone(),
            mode: rx,
        });
        (h, router, tx)
    }

    async fn send(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(v) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    // -- Relay --------------------------------------------------------------

    #[tokio::test]
    async fn relay_toggle_on_then_states() {
        let (_h, router, _tx) = app(3).await;

        let (status, body) = send(&router, Method::GET, "/relay/2/on", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "zone": 2, "on": true, "changed": true }));

        let (_, body) = send(&router, Method::POST, "/relay/2/on", None).await;
        assert_eq!(body["changed"], false);

        let (_, body) = send(&router, Method::GET, "/get-relay-states", None).await;
        assert_eq!(body, json!([false, false, true]));
    }

    #[tokio::test]
    async fn relay_invalid_zone_is_404() {
        let (_h, router, _tx) = app(2).await;
        let (status, body) = send(&router, Method::GET, "/relay/5/on", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("zone 5"));
    }

    #[tokio::test]
    async fn relay_bad_state_word_is_400() {
        let (_h, router, _tx) = app(2).await;
        let (status, _) = send(&router, Method::GET, "/relay/0/flip", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_numeric_zone_is_rejected() {
        let (_h, router, _tx) = app(2).await;
        let (status, _) = send(&router, Method::GET, "/relay/front/on", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // -- Timers -------------------------------------------------------------

    #[tokio::test]
    async fn timer_start_and_cancel() {
        let (h, router, _tx) = app(2).await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/timer/1",
            Some(json!({ "minutes": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining_secs"], 600);
        assert_eq!(h.ctl.relay_states().await, vec![false, true]);

        let (_, body) = send(&router, Method::DELETE, "/timer/1", None).await;
        assert_eq!(body, json!({ "zone": 1, "cancelled": true }));
        assert_eq!(h.ctl.relay_states().await, vec![false, false]);
    }

    #[tokio::test]
    async fn timer_zero_minutes_is_400() {
        let (_h, router, _tx) = app(1).await;
        let (status, _) = send(
            &router,
            Method::POST,
            "/timer/0",
            Some(json!({ "minutes": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // -- Schedules ----------------------------------------------------------

    #[tokio::test]
    async fn set_schedule_then_list() {
        let (_h, router, _tx) = app(2).await;

        let (status, body) = send(
            &router,
            Method::POST,
            "/set-schedule/1",
            Some(json!({ "days": ["Mon", "Thursday"], "onTime": "06:15", "offTime": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "enabled": false, "days": ["Mon", "Thu"], "onTime": "06:15", "offTime": null })
        );

        let (status, _) = send(
            &router,
            Method::POST,
            "/schedule/1/enabled",
            Some(json!({ "enabled": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&router, Method::GET, "/get-schedules", None).await;
        assert_eq!(body[1]["enabled"], true);
        assert_eq!(body[0]["days"], json!([]));
    }

    #[tokio::test]
    async fn set_schedule_bad_time_names_field() {
        let (_h, router, _tx) = app(1).await;
        let (status, body) = send(
            &router,
            Method::POST,
            "/set-schedule/0",
            Some(json!({ "days": ["Mon"], "onTime": "25:00" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("onTime"));
    }

    // -- Rain delay & status ------------------------------------------------

    #[tokio::test]
    async fn rain_delay_shows_in_status() {
        let (_h, router, tx) = app(2).await;
        let (status, body) = send(
            &router,
            Method::POST,
            "/rain-delay",
            Some(json!({ "days": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "days": 2 }));

        tx.send_replace(Mode::NetworkOnly);
        let (_, body) = send(&router, Method::GET, "/api/status", None).await;
        assert_eq!(body["rain_delay_days"], 2);
        assert_eq!(body["mode"], "NETWORK_ONLY");
        assert_eq!(body["zones"].as_array().unwrap().len(), 2);
        assert!(body["events"]
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["kind"] == "rain_delay"));
    }

    #[tokio::test]
    async fn index_serves_html() {
        let (_h, router, _tx) = app(1).await;
        let resp = router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
    }
}
