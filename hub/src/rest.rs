use crate::auth::{AuthError, AuthGate, Credentials, SessionToken};
use crate::commit::{CommitService, Committed};
use crate::errors::Error;
use crate::ingest::{IngestChannel, IngestUpdate};
use crate::model::{
    ControlConfig, DisplayReadings, Slot, StreamState, TelemetrySnapshot, Topic,
};
use crate::store::StateStore;
use crate::subscription::{Caller, SubscriptionService};
use crate::validate::parse_config;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Request, State,
    },
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub subscriptions: SubscriptionService,
    pub commits: Arc<CommitService>,
    pub ingest: IngestChannel,
    pub auth: Arc<AuthGate>,
}

/// Token the current request was authenticated with.
#[derive(Debug, Clone)]
struct BearerToken(String);

pub fn create_router(state: AppState) -> Router {
    let operator = Router::new()
        .route("/api/v1/logout", post(logout))
        .route("/api/v1/metrics", get(get_metrics))
        .route("/api/v1/metrics/display", get(get_display))
        .route("/api/v1/controls", get(get_controls).put(submit_controls))
        .route("/api/v1/stream", get(get_stream))
        .route("/api/v1/subscribe/:topic", get(subscribe))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_operator,
        ));

    let device = Router::new()
        .route("/api/v1/device/controls", get(device_controls))
        .route("/api/v1/device/metrics", post(device_metrics))
        .route("/api/v1/device/stream", post(device_stream));

    Router::new()
        .route("/api/v1/session", post(login))
        .merge(operator)
        .merge(device)
        .with_state(state)
}

async fn require_operator(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())
        .or_else(|| query_token(req.uri().query()))
        .ok_or(AuthError::MissingToken)?;
    let caller = state.auth.verify(&token)?;

    req.extensions_mut().insert(caller);
    req.extensions_mut().insert(BearerToken(token));
    Ok(next.run(req).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

/// Browsers cannot set headers on a WebSocket handshake, so the token may
/// also come as `?token=`.
fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
}

async fn login(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<SessionToken>, AppError> {
    Ok(Json(state.auth.authenticate(&credentials)?))
}

async fn logout(
    State(state): State<AppState>,
    Extension(BearerToken(token)): Extension<BearerToken>,
) -> StatusCode {
    state.auth.revoke(&token);
    StatusCode::NO_CONTENT
}

async fn get_metrics(State(state): State<AppState>) -> Json<Slot<TelemetrySnapshot>> {
    Json(state.store.metrics().get())
}

async fn get_display(State(state): State<AppState>) -> Json<Slot<DisplayReadings>> {
    Json(state.store.metrics().get().map(|m| m.display()))
}

async fn get_controls(State(state): State<AppState>) -> Json<Slot<ControlConfig>> {
    Json(state.store.controls().get())
}

async fn get_stream(State(state): State<AppState>) -> Json<Slot<StreamState>> {
    Json(state.store.stream().get())
}

async fn submit_controls(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Result<Json<Committed>, AppError> {
    let config = parse_config(&body)?;
    let committed = state.commits.submit(&caller, config).await?;
    Ok(Json(committed))
}

async fn subscribe(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(topic): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let topic: Topic = topic.parse()?;
    let subscriptions = state.subscriptions.clone();
    Ok(ws.on_upgrade(move |socket| serve_subscription(socket, subscriptions, topic, caller)))
}

/// Pumps one subscription into a WebSocket until either side goes away.
async fn serve_subscription(
    mut socket: WebSocket,
    subscriptions: SubscriptionService,
    topic: Topic,
    caller: Caller,
) {
    let mut sub = subscriptions.subscribe(topic, caller);

    loop {
        tokio::select! {
            delivery = sub.next() => {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("Closing WebSocket: {}", e);
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                };

                let text = match serde_json::to_string(&delivery) {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Failed to serialize {} delivery: {}", topic, e);
                        continue;
                    }
                };

                if let Err(e) = socket.send(Message::Text(text)).await {
                    sub.mark_broken(&e.to_string());
                    return;
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        sub.unsubscribe();
                        return;
                    }
                    Some(Err(e)) => {
                        sub.mark_broken(&e.to_string());
                        return;
                    }
                    Some(Ok(_)) => {
                        debug!("Ignoring client message on {} subscription", topic);
                    }
                }
            }
        }
    }
}

async fn device_controls(State(state): State<AppState>) -> Result<Json<ControlConfig>, AppError> {
    let current = state.store.controls().get().ready(Topic::Controls)?;
    Ok(Json(current.value))
}

async fn device_metrics(
    State(state): State<AppState>,
    Json(snapshot): Json<TelemetrySnapshot>,
) -> StatusCode {
    state.ingest.publish(IngestUpdate::Metrics(snapshot)).await;
    StatusCode::ACCEPTED
}

async fn device_stream(State(state): State<AppState>, body: Bytes) -> StatusCode {
    state
        .ingest
        .publish(IngestUpdate::Stream {
            payload: body.to_vec(),
            received_at: Utc::now(),
        })
        .await;
    StatusCode::ACCEPTED
}

#[derive(Debug)]
pub struct AppError(Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidConfig(_) | Error::InvalidPayload(_) | Error::Json(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Uninitialized(_) | Error::UnknownTopic(_) => StatusCode::NOT_FOUND,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::TransportUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::SubscriptionBroken(_) => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
        } else {
            debug!("API error: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: status.to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryBackend;

    fn state() -> AppState {
        let store = StateStore::new();
        AppState {
            store: store.clone(),
            subscriptions: SubscriptionService::new(store.clone()),
            commits: Arc::new(CommitService::new(
                store.clone(),
                Arc::new(MemoryBackend::default()),
            )),
            ingest: IngestChannel::new(store),
            auth: Arc::new(AuthGate::new("admin", "admin", chrono::Duration::hours(1))),
        }
    }

    const VALID: &[u8] = br#"{
        "tempRange": 24,
        "phRange": 6.2,
        "pumpCycle": {"onFor": 30, "offFor": 300},
        "nutrientPumpRunningTime": 600
    }"#;

    #[test]
    fn test_query_token() {
        assert_eq!(query_token(Some("a=1&token=abc")), Some("abc".to_string()));
        assert_eq!(query_token(Some("a=1")), None);
        assert_eq!(query_token(None), None);
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123".to_string()));

        headers.insert(header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_submit_then_read_controls() {
        let state = state();
        let caller = Caller::new("op");

        let Json(committed) = submit_controls(
            State(state.clone()),
            Extension(caller),
            Bytes::from_static(VALID),
        )
        .await
        .unwrap();
        assert_eq!(committed.revision, 1);

        let Json(slot) = get_controls(State(state.clone())).await;
        assert_eq!(slot.ready(Topic::Controls).unwrap().value.pump_cycle.off_for, 300);

        let Json(device_view) = device_controls(State(state)).await.unwrap();
        assert_eq!(device_view.nutrient_pump_running_time, 600);
    }

    #[tokio::test]
    async fn test_malformed_submit_is_bad_request() {
        let state = state();
        let err = submit_controls(
            State(state.clone()),
            Extension(Caller::new("op")),
            Bytes::from_static(br#"{"tempRange": 24}"#),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(!state.store.controls().get().is_ready());
    }

    #[tokio::test]
    async fn test_device_controls_uninitialized_is_not_found() {
        let err = device_controls(State(state())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_device_stream_post() {
        let state = state();
        let status = device_stream(State(state.clone()), Bytes::from_static(b"jpeg")).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let Json(slot) = get_stream(State(state)).await;
        assert!(slot.ready(Topic::Stream).unwrap().value.live);
    }

    #[tokio::test]
    async fn test_metrics_uninitialized_then_ready() {
        let state = state();
        let Json(slot) = get_metrics(State(state.clone())).await;
        assert_eq!(slot, Slot::Uninitialized);

        let snapshot = TelemetrySnapshot {
            temperature: 22.0,
            humidity: 104.0,
            ph: 6.0,
            water_level: 50.0,
            captured_at: Utc::now(),
        };
        device_metrics(State(state.clone()), Json(snapshot)).await;

        let Json(display) = get_display(State(state)).await;
        assert_eq!(display.ready(Topic::Metrics).unwrap().value.humidity, 100.0);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            AppError::from(Error::TransportUnavailable("db".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::from(AuthError::InvalidCredentials).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(Error::UnknownTopic("x".into())).status(),
            StatusCode::NOT_FOUND
        );
    }

    mod router {
        use super::*;
        use axum::body::Body;
        use axum::http::{Method, Request as HttpRequest};
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite;
        use tower::ServiceExt;

        async fn send(
            app: &Router,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Body,
        ) -> Response {
            let mut req = HttpRequest::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(token) = token {
                req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            app.clone().oneshot(req.body(body).unwrap()).await.unwrap()
        }

        async fn json_body(resp: Response) -> serde_json::Value {
            let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            serde_json::from_slice(&bytes).unwrap()
        }

        async fn login(app: &Router) -> String {
            let resp = send(
                app,
                Method::POST,
                "/api/v1/session",
                None,
                Body::from(r#"{"username":"admin","password":"admin"}"#),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::OK);
            json_body(resp).await["token"].as_str().unwrap().to_string()
        }

        #[tokio::test]
        async fn test_operator_routes_require_valid_token() {
            let state = state();
            let app = create_router(state.clone());

            let resp = send(&app, Method::PUT, "/api/v1/controls", None, Body::from(VALID)).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

            let resp = send(&app, Method::PUT, "/api/v1/controls", Some("bogus"), Body::from(VALID)).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(
                json_body(resp).await["message"],
                "Authentication failed: unknown session token"
            );

            let resp = send(&app, Method::GET, "/api/v1/metrics", None, Body::empty()).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

            assert!(!state.store.controls().get().is_ready());
        }

        #[tokio::test]
        async fn test_wrong_password_is_unauthorized() {
            let app = create_router(state());
            let resp = send(
                &app,
                Method::POST,
                "/api/v1/session",
                None,
                Body::from(r#"{"username":"admin","password":"nope"}"#),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn test_login_submit_logout() {
            let state = state();
            let app = create_router(state.clone());
            let token = login(&app).await;

            let resp = send(&app, Method::PUT, "/api/v1/controls", Some(&token), Body::from(VALID)).await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(json_body(resp).await["revision"], 1);

            let resp = send(&app, Method::GET, "/api/v1/controls", Some(&token), Body::empty()).await;
            assert_eq!(resp.status(), StatusCode::OK);
            let body = json_body(resp).await;
            assert_eq!(body["status"], "ready");
            assert_eq!(body["value"]["pumpCycle"]["offFor"], 300);

            let resp = send(&app, Method::POST, "/api/v1/logout", Some(&token), Body::empty()).await;
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);

            let resp = send(&app, Method::PUT, "/api/v1/controls", Some(&token), Body::from(VALID)).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(state.store.controls().get().revision(), 1);
        }

        #[tokio::test]
        async fn test_rejected_submit_through_router() {
            let state = state();
            let app = create_router(state.clone());
            let token = login(&app).await;

            let bad = r#"{"tempRange":24,"phRange":6.2,"pumpCycle":{"onFor":-5,"offFor":300},"nutrientPumpRunningTime":600}"#;
            let resp = send(&app, Method::PUT, "/api/v1/controls", Some(&token), Body::from(bad)).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert!(!state.store.controls().get().is_ready());
        }

        #[tokio::test]
        async fn test_query_token_is_accepted() {
            let app = create_router(state());
            let token = login(&app).await;

            let uri = format!("/api/v1/metrics?token={}", token);
            let resp = send(&app, Method::GET, &uri, None, Body::empty()).await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(json_body(resp).await["status"], "uninitialized");
        }

        #[tokio::test]
        async fn test_device_routes_are_open() {
            let state = state();
            let app = create_router(state.clone());

            // Nothing committed yet: not found, not unauthorized
            let resp = send(&app, Method::GET, "/api/v1/device/controls", None, Body::empty()).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);

            let reading = r#"{"temperature":22.5,"humidity":70,"pH":6.1,"waterLevel":80}"#;
            let resp = send(&app, Method::POST, "/api/v1/device/metrics", None, Body::from(reading)).await;
            assert_eq!(resp.status(), StatusCode::ACCEPTED);

            let resp = send(&app, Method::POST, "/api/v1/device/stream", None, Body::from(&b"jpeg"[..])).await;
            assert_eq!(resp.status(), StatusCode::ACCEPTED);

            assert_eq!(state.store.metrics().get().revision(), 1);
            assert!(state.store.stream().get().ready(Topic::Stream).unwrap().value.live);

            let token = state
                .auth
                .authenticate(&Credentials {
                    username: "admin".into(),
                    password: "admin".into(),
                })
                .unwrap()
                .token;
            send(&app, Method::PUT, "/api/v1/controls", Some(&token), Body::from(VALID)).await;

            let resp = send(&app, Method::GET, "/api/v1/device/controls", None, Body::empty()).await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(json_body(resp).await["nutrientPumpRunningTime"], 600);
        }

        async fn serve(state: AppState) -> std::net::SocketAddr {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, create_router(state)).await.unwrap();
            });
            addr
        }

        async fn next_json<S>(ws: &mut S) -> serde_json::Value
        where
            S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
        {
            let msg = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
                .await
                .expect("no message")
                .unwrap()
                .unwrap();
            match msg {
                tungstenite::Message::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected message {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_websocket_sends_snapshot_then_updates() {
            let state = state();
            let token = state
                .auth
                .authenticate(&Credentials {
                    username: "admin".into(),
                    password: "admin".into(),
                })
                .unwrap()
                .token;
            state
                .ingest
                .publish(IngestUpdate::Metrics(TelemetrySnapshot {
                    temperature: 21.0,
                    humidity: 60.0,
                    ph: 6.0,
                    water_level: 75.0,
                    captured_at: Utc::now(),
                }))
                .await;

            let addr = serve(state.clone()).await;
            let url = format!("ws://{}/api/v1/subscribe/metrics?token={}", addr, token);
            let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

            let first = next_json(&mut ws).await;
            assert_eq!(first["topic"], "metrics");
            assert_eq!(first["status"], "ready");
            assert_eq!(first["revision"], 1);
            assert_eq!(first["value"]["temperature"], 21.0);

            state
                .ingest
                .publish(IngestUpdate::Metrics(TelemetrySnapshot {
                    temperature: 23.0,
                    humidity: 60.0,
                    ph: 6.0,
                    water_level: 75.0,
                    captured_at: Utc::now(),
                }))
                .await;

            let second = next_json(&mut ws).await;
            assert_eq!(second["revision"], 2);
            assert_eq!(second["value"]["temperature"], 23.0);
        }

        #[tokio::test]
        async fn test_websocket_uninitialized_snapshot() {
            let state = state();
            let token = state
                .auth
                .authenticate(&Credentials {
                    username: "admin".into(),
                    password: "admin".into(),
                })
                .unwrap()
                .token;

            let addr = serve(state).await;
            let url = format!("ws://{}/api/v1/subscribe/controls?token={}", addr, token);
            let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

            let first = next_json(&mut ws).await;
            assert_eq!(first["topic"], "controls");
            assert_eq!(first["status"], "uninitialized");
        }

        #[tokio::test]
        async fn test_websocket_without_token_is_refused() {
            let addr = serve(state()).await;
            let url = format!("ws://{}/api/v1/subscribe/metrics", addr);
            match tokio_tungstenite::connect_async(url).await {
                Err(tungstenite::Error::Http(resp)) => {
                    assert_eq!(resp.status().as_u16(), 401)
                }
                other => panic!("expected 401, got {:?}", other.map(|(_, r)| r.status())),
            }
        }
    }
}
