//! HTTP control surface
//!
//! Every controller call can block for up to the join timeout, so handlers
//! hop onto the blocking pool for them.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info, warn};
use packetlights_core::pattern::MIN_CHASE_HZ;
use packetlights_core::{Pattern, StatusSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::command_executor::{self as cmd, CommandResult, InvalidInput};
use crate::config::MAX_CHASE_HZ;

pub type Shared = Arc<crate::State>;

const INDEX_HTML: &str = include_str!("index.html");

/// Error body `{ok: false, error}` with a status code
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl From<InvalidInput> for ApiError {
    fn from(e: InvalidInput) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::BadRequest(error) => (StatusCode::BAD_REQUEST, error),
            Self::Internal(error) => (StatusCode::INTERNAL_SERVER_ERROR, error),
        };
        (status, Json(json!({ "ok": false, "error": error }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(state: Shared) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/start", get(start))
        .route("/stop", get(stop))
        .route("/off", get(off))
        .route("/on/:line", get(on_line))
        .route("/status", get(status))
        .route("/demo/packet", post(demo_packet))
        .route("/demo/roundtrip", post(demo_roundtrip))
        .route("/demo/breathe", post(demo_breathe))
        .route("/demo/error", post(demo_error))
        .route("/demo/alert", post(demo_alert))
        .route("/ping", get(ping))
        .route("/snmp/walk", get(snmp_walk))
        .route("/snmp/portdown", get(snmp_portdown))
        .route("/snmp/portup", get(snmp_portup))
        .route("/snmp/interfaces", get(snmp_interfaces))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

/// Feed the attack monitor and add CORS headers to every response
///
/// The request is recorded after the handler ran, so an alert it triggers
/// wins over whatever the handler started. While the alert lasts, later
/// requests put the alert pattern back.
async fn track_requests(State(state): State<Shared>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let preflight = request.method() == Method::OPTIONS;

    let mut response = if preflight {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    if !state.monitor.config().is_ignored(&path) {
        let monitored = state.clone();
        // Alert transitions restart the animation, which may block
        let tracked = tokio::task::spawn_blocking(move || {
            monitored.monitor.record(&path);
            monitored.monitor.hold_alert()
        })
        .await;
        match tracked {
            Ok(true) => debug!("Alert held"),
            Ok(false) => {}
            Err(e) => warn!("Request tracking failed: {e}"),
        }
    }

    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type,Authorization"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET,PUT,POST,DELETE,OPTIONS"),
    );
    response
}

/// Run `f` against the shared state on the blocking pool
async fn blocking<T, F>(state: &Shared, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&crate::State) -> T + Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn play(state: &Shared, pattern: Pattern) -> Result<bool, ApiError> {
    let kind = pattern.kind();
    let started = blocking(state, move |s| s.controller.start(pattern)).await?;
    debug!("Started {kind}: {started}");
    Ok(started)
}

async fn index(State(state): State<Shared>) -> Html<String> {
    Html(INDEX_HTML.replace("__SSE_PORT__", &state.config.sse_port.to_string()))
}

#[derive(Debug, Deserialize)]
struct StartQuery {
    hz: Option<String>,
}

/// Parse a requested chase rate leniently, falling back to `default`
fn chase_hz(requested: Option<&str>, default: f32) -> f32 {
    let hz = requested
        .and_then(|s| s.trim().parse::<f32>().ok())
        .filter(|hz| hz.is_finite())
        .unwrap_or(default);
    hz.clamp(MIN_CHASE_HZ, MAX_CHASE_HZ)
}

async fn start(State(state): State<Shared>, Query(query): Query<StartQuery>) -> ApiResult {
    let hz = chase_hz(query.hz.as_deref(), state.config.animation.chase_hz);
    let pattern = state.patterns.chase(hz);
    let started = blocking(&state, move |s| s.controller.start_if_idle(pattern)).await?;
    Ok(Json(json!({ "ok": started, "anim": "chase", "hz": hz })))
}

async fn stop(State(state): State<Shared>) -> ApiResult {
    blocking(&state, |s| s.controller.stop()).await?;
    Ok(Json(json!({ "ok": true, "stopped": true })))
}

async fn off(State(state): State<Shared>) -> ApiResult {
    blocking(&state, |s| {
        s.controller.stop();
        s.controller.driver().all_off();
    })
    .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn on_line(State(state): State<Shared>, Path(line): Path<String>) -> ApiResult {
    let index = line
        .parse::<u8>()
        .ok()
        .and_then(|line| state.controller.driver().index_of_line(line));
    let Some(index) = index else {
        debug!("/on/{line}: not a configured pin");
        return Ok(Json(json!({ "ok": false })));
    };
    let lit = blocking(&state, move |s| s.controller.light_single(index)).await?;
    Ok(Json(json!({ "ok": lit })))
}

#[derive(Serialize)]
struct StatusReply {
    ok: bool,
    #[serde(flatten)]
    status: StatusSnapshot,
}

async fn status(State(state): State<Shared>) -> Result<Json<StatusReply>, ApiError> {
    let status = blocking(&state, |s| s.status()).await?;
    Ok(Json(StatusReply { ok: true, status }))
}

async fn demo_packet(State(state): State<Shared>) -> ApiResult {
    let ok = play(&state, state.patterns.wave()).await?;
    Ok(Json(json!({ "ok": ok })))
}

async fn demo_roundtrip(State(state): State<Shared>) -> ApiResult {
    let ok = play(&state, state.patterns.roundtrip()).await?;
    Ok(Json(json!({ "ok": ok })))
}

async fn demo_breathe(State(state): State<Shared>) -> ApiResult {
    let ok = play(&state, state.patterns.breathing()).await?;
    Ok(Json(json!({ "ok": ok })))
}

async fn demo_error(State(state): State<Shared>) -> ApiResult {
    let ok = play(&state, state.patterns.strobe()).await?;
    Ok(Json(json!({ "ok": ok })))
}

async fn demo_alert(State(state): State<Shared>) -> ApiResult {
    let ok = play(&state, state.patterns.alert()).await?;
    Ok(Json(json!({ "ok": ok })))
}

#[derive(Debug, Default, Deserialize)]
struct CommandQuery {
    #[serde(default)]
    target: String,
    #[serde(default)]
    ifindex: String,
    community: Option<String>,
}

impl CommandQuery {
    fn community(&self, default: &'static str) -> Result<String, InvalidInput> {
        let community = self.community.as_deref().unwrap_or(default);
        cmd::validate_community(community).map(ToString::to_string)
    }
}

fn command_json(result: &CommandResult) -> Value {
    json!({
        "ok": result.ok(),
        "cmd": result.cmd,
        "code": result.code,
        "stdout": result.stdout,
        "stderr": result.stderr,
    })
}

const fn secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

async fn ping(State(state): State<Shared>, Query(query): Query<CommandQuery>) -> ApiResult {
    let target = cmd::validate_target(&query.target)?.to_string();
    blocking(&state, |s| s.controller.stop()).await?;

    let result = cmd::run(&cmd::ping_argv(&target), secs(state.config.commands.ping_secs)).await;
    let pattern = if result.ok() {
        state.patterns.wave()
    } else {
        state.patterns.strobe()
    };
    play(&state, pattern).await?;
    Ok(Json(command_json(&result)))
}

async fn snmp_walk(State(state): State<Shared>, Query(query): Query<CommandQuery>) -> ApiResult {
    let target = cmd::validate_target(&query.target)?.to_string();
    let community = query.community("public")?;
    blocking(&state, |s| s.controller.stop()).await?;

    let argv = cmd::if_names_argv(&community, &target);
    let result = cmd::run(&argv, secs(state.config.commands.snmp_secs)).await;
    let pattern = if result.ok() {
        state.patterns.snmp_success()
    } else {
        state.patterns.strobe()
    };
    play(&state, pattern).await?;
    Ok(Json(command_json(&result)))
}

async fn snmp_portdown(State(state): State<Shared>, Query(query): Query<CommandQuery>) -> ApiResult {
    set_admin_status(&state, &query, false).await
}

async fn snmp_portup(State(state): State<Shared>, Query(query): Query<CommandQuery>) -> ApiResult {
    set_admin_status(&state, &query, true).await
}

/// `snmpset` ifAdminStatus, animate, then read back ifOperStatus
async fn set_admin_status(state: &Shared, query: &CommandQuery, up: bool) -> ApiResult {
    if query.target.trim().is_empty() {
        return Err(InvalidInput("target and numeric ifindex required").into());
    }
    let target = cmd::validate_target(&query.target)?.to_string();
    let ifindex = cmd::validate_ifindex(&query.ifindex)?;
    let community = query.community("private")?;
    blocking(state, |s| s.controller.stop()).await?;

    let timeout = secs(state.config.commands.default_secs);
    let set = cmd::run(&cmd::admin_status_argv(&community, &target, ifindex, up), timeout).await;
    let pattern = match (set.ok(), up) {
        (true, true) => state.patterns.port_up(),
        (true, false) => state.patterns.port_down(),
        (false, _) => state.patterns.strobe(),
    };
    play(state, pattern).await?;

    let confirm = cmd::run(&cmd::oper_status_argv(&target, ifindex), timeout).await;
    info!(
        "ifindex {ifindex} on {target} set {}: {}",
        if up { "up" } else { "down" },
        set.code
    );
    Ok(Json(json!({
        "ok": set.ok(),
        "set_cmd": set.cmd,
        "set_code": set.code,
        "set_stdout": set.stdout,
        "set_stderr": set.stderr,
        "confirm_cmd": confirm.cmd,
        "confirm_code": confirm.code,
        "confirm_stdout": confirm.stdout,
        "confirm_stderr": confirm.stderr,
    })))
}

async fn snmp_interfaces(State(state): State<Shared>, Query(query): Query<CommandQuery>) -> ApiResult {
    let target = cmd::validate_target(&query.target)?.to_string();
    let community = query.community("public")?;
    blocking(&state, |s| s.controller.stop()).await?;

    let timeout = secs(state.config.commands.snmp_secs);
    let names = cmd::run(&cmd::if_names_argv(&community, &target), timeout).await;
    let admin = cmd::run(&cmd::if_admin_argv(&community, &target), timeout).await;
    let oper = cmd::run(&cmd::if_oper_argv(&community, &target), timeout).await;

    let ok = names.ok() && admin.ok() && oper.ok();
    if ok {
        play(&state, state.patterns.interfaces_flash()).await?;
    }
    Ok(Json(json!({
        "ok": ok,
        "interfaces": {
            "names": names.stdout,
            "admin_status": admin.stdout,
            "oper_status": oper.stdout,
        },
        "commands": {
            "names": names.cmd,
            "admin": admin.cmd,
            "oper": oper.cmd,
        },
        "errors": {
            "names": names.stderr,
            "admin": admin.stderr,
            "oper": oper.stderr,
        },
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use packetlights_core::{AttackPhase, MemoryBackend, PatternKind};
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};

    fn shared() -> (Shared, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let state = crate::State::new(Config::default(), backend.clone());
        (Arc::new(state), backend)
    }

    /// Serve the router on an ephemeral port
    async fn serve(state: Shared) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        addr
    }

    /// Issue one raw request and return the whole reply
    async fn send(addr: SocketAddr, method: &str, path: &str) -> String {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        tokio::task::spawn_blocking(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            stream.write_all(raw.as_bytes()).unwrap();
            let mut reply = String::new();
            stream.read_to_string(&mut reply).unwrap();
            reply
        })
        .await
        .unwrap()
    }

    async fn request(state: Shared, method: &str, path: &str) -> String {
        let addr = serve(state).await;
        send(addr, method, path).await
    }

    #[test]
    fn chase_rate_is_parsed_leniently() {
        assert!((chase_hz(Some("2.5"), 1.0) - 2.5).abs() < f32::EPSILON);
        assert!((chase_hz(Some("fast"), 1.0) - 1.0).abs() < f32::EPSILON);
        assert!((chase_hz(None, 3.0) - 3.0).abs() < f32::EPSILON);
        assert!((chase_hz(Some("0"), 1.0) - MIN_CHASE_HZ).abs() < f32::EPSILON);
        assert!((chase_hz(Some("1e9"), 1.0) - MAX_CHASE_HZ).abs() < f32::EPSILON);
        assert!((chase_hz(Some("NaN"), 1.0) - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_refuses_while_running_then_stop_blanks() {
        let (state, _backend) = shared();

        let Json(first) = start(State(state.clone()), Query(StartQuery { hz: Some("5".into()) }))
            .await
            .unwrap();
        assert_eq!(first["ok"], true);
        assert_eq!(first["anim"], "chase");
        assert_eq!(state.controller.current(), Some(PatternKind::Chase));

        let Json(second) = start(State(state.clone()), Query(StartQuery { hz: None }))
            .await
            .unwrap();
        assert_eq!(second["ok"], false);

        let Json(stopped) = stop(State(state.clone())).await.unwrap();
        assert_eq!(stopped, json!({ "ok": true, "stopped": true }));
        assert!(state.status().is_dark());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn on_line_lights_the_matching_led() {
        let (state, _backend) = shared();

        let Json(reply) = on_line(State(state.clone()), Path("22".into())).await.unwrap();
        assert_eq!(reply["ok"], true);
        let leds = state.controller.driver().snapshot();
        assert_eq!(leds.iter().filter(|on| **on).count(), 1);
        assert!(leds[2]);

        let Json(reply) = on_line(State(state.clone()), Path("4".into())).await.unwrap();
        assert_eq!(reply["ok"], false);
        let Json(reply) = on_line(State(state), Path("gpio".into())).await.unwrap();
        assert_eq!(reply["ok"], false);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_targets_are_rejected_before_running() {
        let (state, _backend) = shared();
        let query = CommandQuery {
            target: "-oProxyCommand".into(),
            ..CommandQuery::default()
        };
        let err = ping(State(state.clone()), Query(query)).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let query = CommandQuery {
            target: "10.0.0.1".into(),
            ifindex: "x".into(),
            ..CommandQuery::default()
        };
        let err = snmp_portdown(State(state), Query(query)).await.unwrap_err();
        let ApiError::BadRequest(message) = err else {
            panic!("expected a bad request");
        };
        assert_eq!(message, "target and numeric ifindex required");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_route_reports_bank_and_cors() {
        let (state, _backend) = shared();
        let reply = request(state.clone(), "GET", "/status").await;

        assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
        assert!(reply.to_ascii_lowercase().contains("access-control-allow-origin: *"));
        assert!(reply.contains(r#""ok":true"#));
        assert!(reply.contains(r#""pins":{"17":0,"27":0"#));
        // /status is on the ignore list
        assert_eq!(state.monitor.buffered(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requests_feed_the_monitor() {
        let (state, _backend) = shared();
        let reply = request(state.clone(), "GET", "/stop").await;
        assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
        assert_eq!(state.monitor.buffered(), 1);
        assert_eq!(
            state.monitor.status().last_endpoint.as_deref(),
            Some("/stop")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_query_gives_json_400() {
        let (state, _backend) = shared();
        let reply = request(state, "GET", "/snmp/walk?target=").await;
        assert!(reply.starts_with("HTTP/1.1 400"), "{reply}");
        assert!(reply.contains(r#""error":"target required""#));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn preflight_gets_cors_headers() {
        let (state, _backend) = shared();
        let reply = request(state, "OPTIONS", "/start").await;
        assert!(reply.starts_with("HTTP/1.1 204"), "{reply}");
        assert!(reply.contains("GET,PUT,POST,DELETE,OPTIONS"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn request_burst_leaves_the_alert_running() {
        let (state, _backend) = shared();
        let addr = serve(state.clone()).await;

        for _ in 0..3 {
            let reply = send(addr, "POST", "/demo/breathe").await;
            assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
        }
        assert_eq!(state.monitor.phase(), AttackPhase::Alert);
        assert_eq!(state.controller.current(), Some(PatternKind::Alert));

        // Later requests inside the cooldown cannot displace the alert
        let reply = send(addr, "POST", "/demo/breathe").await;
        assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
        assert_eq!(state.controller.current(), Some(PatternKind::Alert));
        let reply = send(addr, "GET", "/stop").await;
        assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
        assert_eq!(state.controller.current(), Some(PatternKind::Alert));

        state.controller.stop();
    }
}
