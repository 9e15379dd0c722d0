use backoff::backoff::Backoff;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::state::{SharedState, TunnelFailure, TunnelMode};
use crate::supervisor::{terminate, RestartPolicy};

const QUICK_TUNNEL_SUFFIX: &str = ".trycloudflare.com";

/// トンネルの身元
#[derive(Debug, Clone)]
pub enum TunnelIdentity {
    /// 実行ごとにランダムなホスト名
    Ephemeral,
    /// 事前登録済みのトークンとドメイン
    Fixed { token: String, domain: String },
}

impl TunnelIdentity {
    pub fn mode(&self) -> TunnelMode {
        match self {
            TunnelIdentity::Ephemeral => TunnelMode::Ephemeral,
            TunnelIdentity::Fixed { domain, .. } => TunnelMode::Fixed {
                domain: domain.clone(),
            },
        }
    }
}

/// 起動するトンネルクライアント
#[derive(Debug, Clone)]
pub struct TunnelCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl TunnelCommand {
    /// cloudflared の引数を組み立てる
    pub fn cloudflared(program: &Path, identity: &TunnelIdentity, local_port: u16) -> Self {
        let args: Vec<String> = match identity {
            TunnelIdentity::Ephemeral => vec![
                "tunnel".into(),
                "--edge-ip-version".into(),
                "auto".into(),
                "--protocol".into(),
                "http2".into(),
                "--no-autoupdate".into(),
                "--url".into(),
                format!("http://127.0.0.1:{}", local_port),
            ],
            TunnelIdentity::Fixed { token, .. } => vec![
                "tunnel".into(),
                "--no-autoupdate".into(),
                "run".into(),
                "--token".into(),
                token.clone(),
            ],
        };
        Self {
            program: program.to_path_buf(),
            args,
        }
    }
}

/// タイムアウトと再試行の設定
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// 一時トンネルのホスト名待ち
    pub hostname_timeout: Duration,
    /// 固定トンネルの登録待ち
    pub register_timeout: Duration,
    /// 登録ログが出ないときの HTTP 到達確認
    pub reach_timeout: Duration,
    pub reach_scheme: String,
    pub reach_port: u16,
    pub policy: RestartPolicy,
}

impl TunnelSettings {
    /// 固定ドメインの到達確認に使う URL
    pub fn reach_url(&self, domain: &str) -> String {
        format!("{}://{}:{}/", self.reach_scheme, domain, self.reach_port)
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            hostname_timeout: Duration::from_secs(30),
            register_timeout: Duration::from_secs(20),
            reach_timeout: Duration::from_secs(5),
            reach_scheme: "https".to_string(),
            reach_port: 443,
            policy: RestartPolicy::default(),
        }
    }
}

/// トンネルクライアントの出力から読み取れる事象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSignal {
    Hostname(String),
    Registered,
    AuthFailure(String),
}

/// `https://<label>.trycloudflare.com` からホスト名を取り出す
pub fn extract_quick_tunnel_host(line: &str) -> Option<String> {
    let mut rest = line;
    while let Some(start) = rest.find("https://") {
        let candidate = &rest[start + "https://".len()..];
        let end = candidate
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '.'))
            .unwrap_or(candidate.len());
        let host = &candidate[..end];
        if let Some(label) = host.strip_suffix(QUICK_TUNNEL_SUFFIX) {
            // api.trycloudflare.com はエラーメッセージ中の API URL
            if !label.is_empty() && !label.contains('.') && label != "api" {
                return Some(host.to_string());
            }
        }
        rest = &candidate[end..];
    }
    None
}

/// 1行を分類する
pub fn classify_line(line: &str, identity: &TunnelIdentity) -> Option<OutputSignal> {
    match identity {
        TunnelIdentity::Ephemeral => extract_quick_tunnel_host(line).map(OutputSignal::Hostname),
        TunnelIdentity::Fixed { .. } => {
            let lower = line.to_ascii_lowercase();
            if lower.contains("registered tunnel connection") {
                Some(OutputSignal::Registered)
            } else if [
                "unauthorized",
                "invalid tunnel secret",
                "token is not valid",
                "invalid token",
                "failed to parse token",
            ]
            .iter()
            .any(|needle| lower.contains(needle))
            {
                Some(OutputSignal::AuthFailure(line.trim().to_string()))
            } else {
                None
            }
        }
    }
}

/// 起動中のトンネル
pub struct Tunnel {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<Result<(), Error>>,
}

impl Tunnel {
    /// 管理タスクが終わるまで待つ
    /// 固定トンネルが最終的に失敗した場合はそのエラーを返す
    pub async fn wait(self) -> Result<(), Error> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("Tunnel task panicked: {}", e);
                Ok(())
            }
        }
    }

    /// トンネルをシャットダウン
    pub async fn shutdown(self) -> Result<(), Error> {
        let _ = self.shutdown_tx.send(());
        self.wait().await
    }
}

/// トンネルを開始（状態は `state` に反映される）
pub fn start_tunnel(
    command: TunnelCommand,
    identity: TunnelIdentity,
    settings: TunnelSettings,
    state: SharedState,
) -> Tunnel {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(run_tunnel(command, identity, settings, state, shutdown_rx));
    Tunnel {
        shutdown_tx,
        handle,
    }
}

/// 1回の起動の結果
enum Attempt {
    Connected(String),
    AuthFailed(String),
    Exited(String),
    TimedOut,
    Shutdown,
}

/// 接続後の監視結果
enum Session {
    Lost(String),
    Shutdown,
}

async fn run_tunnel(
    command: TunnelCommand,
    identity: TunnelIdentity,
    settings: TunnelSettings,
    state: SharedState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), Error> {
    let policy = &settings.policy;
    let mut backoff = policy.backoff();
    let mut attempts = 0u32;
    let mut cause = TunnelFailure::Unreachable;
    let mut detail = String::new();

    loop {
        attempts += 1;
        state.update_tunnel(|t| {
            t.connecting();
            t.attempts = attempts;
        });
        info!("Starting tunnel client (attempt {})", attempts);

        match spawn(&command) {
            Err(e) => {
                warn!("Failed to start tunnel client {}: {}", command.program.display(), e);
                cause = TunnelFailure::Unreachable;
                detail = e.to_string();
            }
            Ok((mut child, mut lines)) => {
                let attempt =
                    wait_for_connection(&mut child, &mut lines, &identity, &settings, &mut shutdown_rx)
                        .await;
                match attempt {
                    Attempt::Shutdown => {
                        terminate(&mut child, policy.stop_timeout).await;
                        return Ok(());
                    }
                    Attempt::Connected(host) => {
                        info!("Tunnel connected: {}", host);
                        state.update_tunnel(|t| t.connected(&host));
                        let since = Instant::now();

                        match monitor(&mut child, &mut lines, &mut shutdown_rx).await {
                            Session::Shutdown => {
                                terminate(&mut child, policy.stop_timeout).await;
                                return Ok(());
                            }
                            Session::Lost(reason) => {
                                warn!("Tunnel client exited after connecting: {}", reason);
                                if matches!(identity, TunnelIdentity::Ephemeral) {
                                    // 一時トンネルのホスト名は再発行できない
                                    state.update_tunnel(|t| t.failed(TunnelFailure::Lost));
                                    return Ok(());
                                }
                                state.update_tunnel(|t| t.connecting());
                                if policy.is_stable(since.elapsed()) {
                                    attempts = 0;
                                    backoff.reset();
                                }
                                cause = TunnelFailure::Unreachable;
                                detail = reason;
                            }
                        }
                    }
                    Attempt::AuthFailed(line) => {
                        warn!("Tunnel authentication rejected: {}", line);
                        terminate(&mut child, policy.stop_timeout).await;
                        cause = TunnelFailure::AuthFailed;
                        detail = line;
                    }
                    Attempt::Exited(reason) => {
                        warn!("Tunnel client exited before connecting: {}", reason);
                        cause = TunnelFailure::Unreachable;
                        detail = reason;
                    }
                    Attempt::TimedOut => match &identity {
                        TunnelIdentity::Ephemeral => {
                            warn!(
                                "No tunnel hostname within {:?}, publishing without tunnel",
                                settings.hostname_timeout
                            );
                            terminate(&mut child, policy.stop_timeout).await;
                            state.update_tunnel(|t| t.failed(TunnelFailure::NoHostname));
                            return Ok(());
                        }
                        TunnelIdentity::Fixed { domain, .. } => {
                            let url = settings.reach_url(domain);
                            if is_reachable(&url, settings.reach_timeout).await {
                                info!("No registration signal, but {} is reachable", url);
                                state.update_tunnel(|t| t.connected(domain));
                                let since = Instant::now();
                                match monitor(&mut child, &mut lines, &mut shutdown_rx).await {
                                    Session::Shutdown => {
                                        terminate(&mut child, policy.stop_timeout).await;
                                        return Ok(());
                                    }
                                    Session::Lost(reason) => {
                                        warn!("Tunnel client exited after connecting: {}", reason);
                                        state.update_tunnel(|t| t.connecting());
                                        if policy.is_stable(since.elapsed()) {
                                            attempts = 0;
                                            backoff.reset();
                                        }
                                        cause = TunnelFailure::Unreachable;
                                        detail = reason;
                                    }
                                }
                            } else {
                                terminate(&mut child, policy.stop_timeout).await;
                                cause = TunnelFailure::Unreachable;
                                detail = format!(
                                    "no registration within {:?} and {} unreachable",
                                    settings.register_timeout, url
                                );
                            }
                        }
                    },
                }
            }
        }

        if attempts > policy.max_restarts {
            return match give_up(&identity, &state, cause, attempts, detail) {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }

        let delay = backoff.next_backoff().unwrap_or(policy.max_backoff);
        info!("Retrying tunnel in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

/// 再試行を使い切ったときの最終状態
/// 一時トンネルは認証を持たないので到達不能エラーにはしない
fn give_up(
    identity: &TunnelIdentity,
    state: &SharedState,
    cause: TunnelFailure,
    attempts: u32,
    detail: String,
) -> Option<Error> {
    if let TunnelIdentity::Ephemeral = identity {
        warn!(
            "Ephemeral tunnel failed after {} attempts ({}), publishing without tunnel",
            attempts, detail
        );
        state.update_tunnel(|t| t.failed(TunnelFailure::NoHostname));
        return None;
    }

    state.update_tunnel(|t| t.failed(cause));
    let err = match cause {
        TunnelFailure::AuthFailed => Error::TunnelAuthFailed { attempts, detail },
        _ => Error::TunnelUnreachable { attempts, detail },
    };
    error!("{}", err);
    Some(err)
}

fn spawn(command: &TunnelCommand) -> std::io::Result<(Child, mpsc::Receiver<String>)> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // cloudflared はホスト名を stderr に出すため両方を1本にまとめる
    let (tx, rx) = mpsc::channel(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_lines(stderr, tx));
    }
    Ok((child, rx))
}

async fn read_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

async fn wait_for_connection(
    child: &mut Child,
    lines: &mut mpsc::Receiver<String>,
    identity: &TunnelIdentity,
    settings: &TunnelSettings,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Attempt {
    let limit = match identity {
        TunnelIdentity::Ephemeral => settings.hostname_timeout,
        TunnelIdentity::Fixed { .. } => settings.register_timeout,
    };
    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    let mut output_open = true;

    loop {
        tokio::select! {
            line = lines.recv(), if output_open => match line {
                Some(line) => {
                    debug!(target: "subvisor::tunnel", "{}", line);
                    match classify_line(&line, identity) {
                        Some(OutputSignal::Hostname(host)) => return Attempt::Connected(host),
                        Some(OutputSignal::Registered) => {
                            if let TunnelIdentity::Fixed { domain, .. } = identity {
                                return Attempt::Connected(domain.clone());
                            }
                        }
                        Some(OutputSignal::AuthFailure(line)) => return Attempt::AuthFailed(line),
                        None => {}
                    }
                }
                None => output_open = false,
            },
            status = child.wait() => {
                // 終了直前に出た認証エラーを取りこぼさない
                if let Some(line) = drain_auth_failure(lines, identity).await {
                    return Attempt::AuthFailed(line);
                }
                return Attempt::Exited(match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                });
            }
            _ = &mut deadline => return Attempt::TimedOut,
            _ = shutdown_rx.recv() => return Attempt::Shutdown,
        }
    }
}

/// 終了したプロセスの残り出力から認証エラーを探す
async fn drain_auth_failure(
    lines: &mut mpsc::Receiver<String>,
    identity: &TunnelIdentity,
) -> Option<String> {
    let drain = async {
        while let Some(line) = lines.recv().await {
            debug!(target: "subvisor::tunnel", "{}", line);
            if let Some(OutputSignal::AuthFailure(line)) = classify_line(&line, identity) {
                return Some(line);
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(1), drain)
        .await
        .ok()
        .flatten()
}

/// 接続後も出力を読み続け、終了か停止要求を待つ
async fn monitor(
    child: &mut Child,
    lines: &mut mpsc::Receiver<String>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Session {
    let mut output_open = true;
    loop {
        tokio::select! {
            line = lines.recv(), if output_open => match line {
                Some(line) => debug!(target: "subvisor::tunnel", "{}", line),
                None => output_open = false,
            },
            status = child.wait() => {
                return Session::Lost(match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                });
            }
            _ = shutdown_rx.recv() => return Session::Shutdown,
        }
    }
}

/// URL に HTTP で到達できるか確認する
/// オリジン不通時に Cloudflare が返すエラー応答は到達不能とみなす
pub async fn is_reachable(url: &str, limit: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(limit).build() {
        Ok(client) => client,
        Err(e) => {
            warn!("Failed to build HTTP client: {}", e);
            return false;
        }
    };
    match client.get(url).send().await {
        Ok(response) if is_edge_error(response.status()) => {
            debug!("{} answered {}", url, response.status());
            false
        }
        Ok(_) => true,
        Err(e) => {
            debug!("{} is not reachable: {}", url, e);
            false
        }
    }
}

/// 502/503/504 と 52x/530（Argo Tunnel error 1033 など）
fn is_edge_error(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 502..=504 | 520..=527 | 530)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TunnelStatus;
    use axum::http::StatusCode;
    use axum::Router;
    use tokio::net::TcpListener;

    fn sh(script: &str) -> TunnelCommand {
        TunnelCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn fast_settings(reach_port: u16) -> TunnelSettings {
        TunnelSettings {
            hostname_timeout: Duration::from_millis(300),
            register_timeout: Duration::from_millis(300),
            reach_timeout: Duration::from_millis(500),
            reach_scheme: "http".to_string(),
            reach_port,
            policy: RestartPolicy {
                max_restarts: 2,
                grace: Duration::from_millis(100),
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                stop_timeout: Duration::from_secs(2),
                stable_after: Duration::from_secs(60),
            },
        }
    }

    /// 常に同じステータスを返す HTTP サーバー
    async fn answering(status: StatusCode) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().fallback(move || async move { (status, "edge") });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn fixed(domain: &str) -> TunnelIdentity {
        TunnelIdentity::Fixed {
            token: "token".to_string(),
            domain: domain.to_string(),
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_hostname(state: &SharedState, published: bool) {
        let mut rx = state.subscribe();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if rx.borrow_and_update().tunnel_hostname().is_some() == published {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("tunnel hostname did not change");
    }

    async fn wait_connected(state: &SharedState) {
        wait_hostname(state, true).await;
    }

    #[test]
    fn test_extract_quick_tunnel_host() {
        let line = "2024-01-15T10:00:00Z INF |  https://random-slug.trycloudflare.com   |";
        assert_eq!(
            extract_quick_tunnel_host(line).as_deref(),
            Some("random-slug.trycloudflare.com")
        );
        assert_eq!(
            extract_quick_tunnel_host("Visit it at: https://abc-def.trycloudflare.com/").as_deref(),
            Some("abc-def.trycloudflare.com")
        );
        assert!(extract_quick_tunnel_host("Requesting new quick Tunnel on trycloudflare.com...").is_none());
        assert!(extract_quick_tunnel_host(
            r#"failed to request quick Tunnel: Post "https://api.trycloudflare.com/tunnel""#
        )
        .is_none());
        assert!(extract_quick_tunnel_host("https://example.com").is_none());
        assert!(extract_quick_tunnel_host("").is_none());
    }

    #[test]
    fn test_classify_fixed_lines() {
        let identity = fixed("node.example.com");
        assert_eq!(
            classify_line(
                "INF Registered tunnel connection connIndex=0 location=nrt01",
                &identity
            ),
            Some(OutputSignal::Registered)
        );
        assert!(matches!(
            classify_line("ERR Register tunnel error error=\"Unauthorized: Invalid tunnel secret\"", &identity),
            Some(OutputSignal::AuthFailure(_))
        ));
        assert_eq!(classify_line("INF Starting tunnel", &identity), None);
        // 固定トンネルではランダムホスト名を採用しない
        assert_eq!(
            classify_line("https://x.trycloudflare.com", &identity),
            None
        );
    }

    #[test]
    fn test_cloudflared_args() {
        let quick = TunnelCommand::cloudflared(Path::new("cloudflared"), &TunnelIdentity::Ephemeral, 8081);
        assert!(quick.args.contains(&"http://127.0.0.1:8081".to_string()));
        let named = TunnelCommand::cloudflared(Path::new("cloudflared"), &fixed("a.example.com"), 8081);
        assert_eq!(named.args.last().map(String::as_str), Some("token"));
        assert!(named.args.contains(&"run".to_string()));
    }

    #[tokio::test]
    async fn test_ephemeral_connects() {
        let state = SharedState::new([], Some(TunnelMode::Ephemeral));
        let tunnel = start_tunnel(
            sh("echo 'INF |  https://calm-river.trycloudflare.com  |' >&2; sleep 30"),
            TunnelIdentity::Ephemeral,
            fast_settings(443),
            state.clone(),
        );
        wait_connected(&state).await;
        assert_eq!(
            state.snapshot().tunnel_hostname(),
            Some("calm-river.trycloudflare.com")
        );
        tunnel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ephemeral_without_hostname_fails_quietly() {
        let state = SharedState::new([], Some(TunnelMode::Ephemeral));
        let tunnel = start_tunnel(
            sh("echo starting; sleep 30"),
            TunnelIdentity::Ephemeral,
            fast_settings(443),
            state.clone(),
        );
        // 到達不能エラーは返さない
        tunnel.wait().await.unwrap();
        let snapshot = state.snapshot();
        let t = snapshot.tunnel.as_ref().unwrap();
        assert_eq!(t.status, TunnelStatus::Failed);
        assert_eq!(t.failure, Some(TunnelFailure::NoHostname));
        assert_eq!(snapshot.tunnel_hostname(), None);
    }

    #[tokio::test]
    async fn test_ephemeral_crash_is_retried_boundedly() {
        let state = SharedState::new([], Some(TunnelMode::Ephemeral));
        let tunnel = start_tunnel(
            sh("exit 1"),
            TunnelIdentity::Ephemeral,
            fast_settings(443),
            state.clone(),
        );
        tunnel.wait().await.unwrap();
        let snapshot = state.snapshot();
        let t = snapshot.tunnel.as_ref().unwrap();
        assert_eq!(t.status, TunnelStatus::Failed);
        assert_eq!(t.failure, Some(TunnelFailure::NoHostname));
        assert_eq!(t.attempts, 3);
    }

    #[tokio::test]
    async fn test_fixed_registration() {
        let state = SharedState::new([], Some(fixed("node.example.com").mode()));
        let tunnel = start_tunnel(
            sh("echo 'INF Registered tunnel connection connIndex=0'; sleep 30"),
            fixed("node.example.com"),
            fast_settings(443),
            state.clone(),
        );
        wait_connected(&state).await;
        assert_eq!(state.snapshot().tunnel_hostname(), Some("node.example.com"));
        tunnel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fixed_wrong_token() {
        let state = SharedState::new([], Some(fixed("node.example.com").mode()));
        let tunnel = start_tunnel(
            sh("echo 'ERR Register tunnel error error=\"Unauthorized: Invalid tunnel secret\"' >&2; sleep 30"),
            fixed("node.example.com"),
            fast_settings(443),
            state.clone(),
        );
        match tunnel.wait().await {
            Err(Error::TunnelAuthFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {:?}", other),
        }
        let snapshot = state.snapshot();
        assert_eq!(
            snapshot.tunnel.as_ref().unwrap().failure,
            Some(TunnelFailure::AuthFailed)
        );
    }

    #[tokio::test]
    async fn test_fixed_auth_error_on_exit() {
        let state = SharedState::new([], Some(fixed("node.example.com").mode()));
        let tunnel = start_tunnel(
            sh("echo 'ERR Provided Tunnel token is not valid.' >&2; exit 1"),
            fixed("node.example.com"),
            fast_settings(443),
            state.clone(),
        );
        assert!(matches!(
            tunnel.wait().await,
            Err(Error::TunnelAuthFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_fixed_unreachable() {
        let port = closed_port().await;
        let state = SharedState::new([], Some(fixed("127.0.0.1").mode()));
        let tunnel = start_tunnel(
            sh("sleep 30"),
            fixed("127.0.0.1"),
            fast_settings(port),
            state.clone(),
        );
        match tunnel.wait().await {
            Err(err @ Error::TunnelUnreachable { .. }) => assert_eq!(err.exit_code(), 5),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fixed_reachable_without_registration_line() {
        let port = answering(StatusCode::OK).await;
        let state = SharedState::new([], Some(fixed("127.0.0.1").mode()));
        let tunnel = start_tunnel(
            sh("sleep 30"),
            fixed("127.0.0.1"),
            fast_settings(port),
            state.clone(),
        );
        wait_connected(&state).await;
        assert_eq!(state.snapshot().tunnel_hostname(), Some("127.0.0.1"));
        tunnel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fixed_edge_error_page_is_unreachable() {
        // 接続は受け付けるがトンネル不通のエラーページを返す
        let port = answering(StatusCode::from_u16(530).unwrap()).await;
        let state = SharedState::new([], Some(fixed("127.0.0.1").mode()));
        let tunnel = start_tunnel(
            sh("sleep 30"),
            fixed("127.0.0.1"),
            fast_settings(port),
            state.clone(),
        );
        match tunnel.wait().await {
            Err(err @ Error::TunnelUnreachable { .. }) => assert_eq!(err.exit_code(), 5),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(state.snapshot().tunnel_hostname(), None);
    }

    #[tokio::test]
    async fn test_is_reachable_by_status() {
        let limit = Duration::from_secs(2);
        let ok = answering(StatusCode::OK).await;
        assert!(is_reachable(&format!("http://127.0.0.1:{}/", ok), limit).await);
        let not_found = answering(StatusCode::NOT_FOUND).await;
        assert!(is_reachable(&format!("http://127.0.0.1:{}/", not_found), limit).await);

        for code in [502, 530] {
            let port = answering(StatusCode::from_u16(code).unwrap()).await;
            assert!(
                !is_reachable(&format!("http://127.0.0.1:{}/", port), limit).await,
                "{}",
                code
            );
        }
        let closed = closed_port().await;
        assert!(!is_reachable(&format!("http://127.0.0.1:{}/", closed), limit).await);
    }

    #[tokio::test]
    async fn test_fixed_session_loss_withdraws_hostname() {
        let mut settings = fast_settings(443);
        settings.policy.initial_backoff = Duration::from_secs(3);
        settings.policy.max_backoff = Duration::from_secs(3);
        let state = SharedState::new([], Some(fixed("node.example.com").mode()));
        let tunnel = start_tunnel(
            sh("echo 'INF Registered tunnel connection connIndex=0'; sleep 0.3; exit 1"),
            fixed("node.example.com"),
            settings,
            state.clone(),
        );
        wait_connected(&state).await;

        // 再接続待ちの間はホスト名を公開しない
        wait_hostname(&state, false).await;
        let snapshot = state.snapshot();
        let t = snapshot.tunnel.as_ref().unwrap();
        assert_eq!(t.status, TunnelStatus::Connecting);
        assert_eq!(snapshot.tunnel_hostname(), None);
        tunnel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fixed_stable_session_resets_attempts() {
        let mut settings = fast_settings(443);
        settings.policy.max_restarts = 1;
        settings.policy.grace = Duration::from_millis(50);
        settings.policy.stable_after = Duration::from_millis(100);
        let state = SharedState::new([], Some(fixed("node.example.com").mode()));
        let tunnel = start_tunnel(
            sh("echo 'INF Registered tunnel connection connIndex=0'; sleep 0.4; exit 1"),
            fixed("node.example.com"),
            settings,
            state.clone(),
        );

        // 上限1回でも接続が安定していれば3回目の接続まで進む
        let mut rx = state.subscribe();
        let mut connections = 0;
        tokio::time::timeout(Duration::from_secs(10), async {
            let mut was_connected = false;
            loop {
                let connected = rx.borrow_and_update().tunnel_hostname().is_some();
                if connected && !was_connected {
                    connections += 1;
                    if connections == 3 {
                        return;
                    }
                }
                was_connected = connected;
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("tunnel gave up despite stable sessions");
        tunnel.shutdown().await.unwrap();
    }
}
