use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::protocol::Protocol;
use crate::state::{ProcessStatus, SharedState};
use crate::subscription::Publisher;

#[derive(Clone)]
struct AppState {
    uuid: Arc<str>,
    publisher: Publisher,
}

/// `GET /sub` と `GET /<uuid>` で現在の購読内容を返す
pub fn router(uuid: &str, publisher: Publisher) -> Router {
    Router::new()
        .route("/sub", get(subscription))
        .route("/{token}", get(subscription_by_uuid))
        .fallback(not_found)
        .with_state(AppState {
            uuid: Arc::from(uuid),
            publisher,
        })
}

async fn subscription(State(app): State<AppState>) -> Response {
    plain_text(app.publisher.current().await.render())
}

async fn subscription_by_uuid(State(app): State<AppState>, Path(token): Path<String>) -> Response {
    if token != *app.uuid {
        debug!("Rejected subscription path /{}", token);
        return not_found().await;
    }
    plain_text(app.publisher.current().await.render())
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404").into_response()
}

fn plain_text(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

/// 購読エンドポイントを起動して停止要求まで動かす
/// 待ち受けの成否は HTTP-SUB の状態として反映する
pub async fn run_server(
    bind_addr: SocketAddr,
    uuid: String,
    publisher: Publisher,
    state: SharedState,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Subscription endpoint failed to bind {}: {}", bind_addr, e);
            state.update_process(Protocol::HttpSub, |p| {
                p.status = ProcessStatus::Failed;
                p.last_exit = Some(e.to_string());
            });
            return Err(e).with_context(|| format!("Failed to bind to {}", bind_addr));
        }
    };
    serve(listener, &uuid, publisher, state, shutdown_rx).await
}

/// 待ち受け済みのソケットで受け付けを続ける
pub async fn serve(
    listener: TcpListener,
    uuid: &str,
    publisher: Publisher,
    state: SharedState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let local_addr = listener.local_addr().context("Failed to read local address")?;
    info!("Subscription endpoint listening on {}", local_addr);
    state.update_process(Protocol::HttpSub, |p| {
        p.status = ProcessStatus::Running;
        p.pid = Some(std::process::id());
        p.started_at = Some(Instant::now());
    });

    let result = axum::serve(listener, router(uuid, publisher))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Subscription endpoint shutting down");
        })
        .await;

    state.update_process(Protocol::HttpSub, |p| {
        p.pid = None;
        match &result {
            Ok(()) => p.status = ProcessStatus::ExitedClean,
            Err(e) => {
                p.status = ProcessStatus::Failed;
                p.last_exit = Some(e.to_string());
            }
        }
    });
    result.context("Subscription endpoint stopped unexpectedly")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::SubscriptionDescriptor;
    use tokio::task::JoinHandle;

    const UUID: &str = "11111111-2222-4333-8444-555555555555";

    async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
        let response = reqwest::get(format!("http://{}{}", addr, path)).await.unwrap();
        let status = response.status().as_u16();
        (status, response.text().await.unwrap())
    }

    type Running = (SocketAddr, broadcast::Sender<()>, JoinHandle<Result<()>>);

    async fn start(publisher: &Publisher, state: &SharedState) -> Running {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let publisher = publisher.clone();
        let state = state.clone();
        let handle = tokio::spawn(async move {
            serve(listener, UUID, publisher, state, shutdown_rx).await
        });
        (addr, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_serves_current_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Publisher::new(dir.path());
        publisher
            .publish(SubscriptionDescriptor {
                revision: 1,
                uris: vec!["hysteria2://a@h:443/?x#y".into()],
                tunnel_host: None,
            })
            .await
            .unwrap();

        let state = SharedState::new([Protocol::HttpSub], None);
        let (addr, shutdown_tx, handle) = start(&publisher, &state).await;

        let (status, body) = get(addr, "/sub").await;
        assert_eq!(status, 200);
        assert!(body.ends_with("hysteria2://a@h:443/?x#y\n"));
        assert!(state.snapshot().is_live(Protocol::HttpSub));

        let (status, _) = get(addr, &format!("/{}", UUID)).await;
        assert_eq!(status, 200);
        let (status, _) = get(addr, "/sub?flag=clash").await;
        assert_eq!(status, 200);

        // 再公開後は新しい内容を返す
        publisher
            .publish(SubscriptionDescriptor {
                revision: 2,
                uris: vec!["tuic://b@h:2083?x#y".into()],
                tunnel_host: None,
            })
            .await
            .unwrap();
        let (_, body) = get(addr, "/sub").await;
        assert!(body.ends_with("tuic://b@h:2083?x#y\n"));

        let _ = shutdown_tx.send(());
        handle.await.unwrap().unwrap();
        assert_eq!(
            state.snapshot().status_of(Protocol::HttpSub),
            Some(ProcessStatus::ExitedClean)
        );
    }

    #[tokio::test]
    async fn test_unknown_paths_and_methods() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = Publisher::new(dir.path());
        let state = SharedState::new([Protocol::HttpSub], None);
        let (addr, shutdown_tx, handle) = start(&publisher, &state).await;

        for path in ["/", "/nope", "/subscribe", "/11111111-2222-4333-8444-000000000000"] {
            let (status, _) = get(addr, path).await;
            assert_eq!(status, 404, "{}", path);
        }

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/sub", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

        let response = client
            .head(format!("http://{}/sub", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()[reqwest::header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );

        let _ = shutdown_tx.send(());
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let state = SharedState::new([Protocol::HttpSub], None);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let result = run_server(
            addr,
            UUID.to_string(),
            Publisher::new(dir.path()),
            state.clone(),
            shutdown_rx,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(
            state.snapshot().status_of(Protocol::HttpSub),
            Some(ProcessStatus::Failed)
        );
    }
}
