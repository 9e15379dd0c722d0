use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::protocol::{LaunchSpec, Protocol};
use crate::state::{ProcessStatus, SharedState};

/// 異常終了時に残す出力行数
const OUTPUT_TAIL_LINES: usize = 5;

/// 再起動と停止のポリシー
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// 再起動の上限回数
    pub max_restarts: u32,
    /// この時間生きていれば Running とみなす
    pub grace: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// SIGTERM 後、強制終了までの猶予
    pub stop_timeout: Duration,
    /// Running 後この時間動き続けた実行は再起動回数を数え直す
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            grace: Duration::from_secs(2),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
            stable_after: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// 再起動回数を数え直してよい稼働時間か
    pub fn is_stable(&self, uptime: Duration) -> bool {
        uptime >= self.grace + self.stable_after
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// プロセスの終わり方
enum Exit {
    Exited(ExitStatus),
    WaitFailed(std::io::Error),
    Shutdown,
}

/// プロトコルごとのプロセス監視
pub struct Supervisor {
    state: SharedState,
    policy: RestartPolicy,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(Protocol, JoinHandle<ProcessStatus>)>,
}

impl Supervisor {
    pub fn new(state: SharedState, policy: RestartPolicy) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            state,
            policy,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// 1プロトコル分の監視タスクを開始
    pub fn launch(&mut self, spec: LaunchSpec) {
        let protocol = spec.protocol;
        let state = self.state.clone();
        let policy = self.policy.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(supervise(spec, state, policy, shutdown_rx));
        self.handles.push((protocol, handle));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// 全タスクが自然に終わるまで待つ
    pub async fn wait(&mut self) {
        for (protocol, handle) in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("Supervisor task for {} panicked: {}", protocol, e);
            }
        }
    }

    /// 全プロセスに停止を通知し、終了を待つ
    pub async fn shutdown(mut self) {
        info!("Stopping {} supervised process(es)", self.handles.len());
        let _ = self.shutdown_tx.send(());
        self.wait().await;
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // 残っているタスクにも停止を伝える（子プロセスは kill_on_drop で回収）
        let _ = self.shutdown_tx.send(());
    }
}

/// 起動・監視・再起動のループ
async fn supervise(
    spec: LaunchSpec,
    state: SharedState,
    policy: RestartPolicy,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ProcessStatus {
    let protocol = spec.protocol;
    let mut backoff = policy.backoff();
    let mut restarts = 0u32;

    loop {
        let tail = Arc::new(Mutex::new(VecDeque::new()));
        let mut uptime = Duration::ZERO;

        let last_exit = match spawn(&spec, &tail) {
            Ok(mut child) => {
                let pid = child.id();
                let started = Instant::now();
                info!("{} started (pid {:?})", protocol, pid);
                state.update_process(protocol, |p| {
                    p.status = ProcessStatus::Starting;
                    p.pid = pid;
                    p.started_at = Some(started);
                });

                let exit = run_until_exit(&mut child, protocol, &state, &policy, &mut shutdown_rx).await;
                uptime = started.elapsed();
                match exit {
                    Exit::Shutdown => {
                        terminate(&mut child, policy.stop_timeout).await;
                        info!("{} stopped", protocol);
                        state.update_process(protocol, |p| {
                            p.status = ProcessStatus::ExitedClean;
                            p.pid = None;
                        });
                        return ProcessStatus::ExitedClean;
                    }
                    Exit::Exited(status) if status.success() => {
                        info!("{} exited cleanly", protocol);
                        state.update_process(protocol, |p| {
                            p.status = ProcessStatus::ExitedClean;
                            p.pid = None;
                            p.last_exit = Some(status.to_string());
                        });
                        return ProcessStatus::ExitedClean;
                    }
                    Exit::Exited(status) => status.to_string(),
                    Exit::WaitFailed(e) => format!("wait failed: {}", e),
                }
            }
            Err(e) => {
                let err = Error::ProcessLaunchFailed { protocol, source: e };
                error!("{}", err);
                err.to_string()
            }
        };

        let output = tail
            .lock()
            .map(|t| t.iter().cloned().collect::<Vec<_>>().join(" | "))
            .unwrap_or_default();
        warn!("{} exited with error: {} {}", protocol, last_exit, output);
        state.update_process(protocol, |p| {
            p.status = ProcessStatus::ExitedError;
            p.pid = None;
            p.last_exit = Some(last_exit.clone());
        });

        if restarts > 0 && policy.is_stable(uptime) {
            info!(
                "{} ran for {:?} before failing, resetting restart count",
                protocol, uptime
            );
            restarts = 0;
            backoff.reset();
        }

        if restarts >= policy.max_restarts {
            let err = Error::ProcessCrashLoop {
                protocol,
                attempts: restarts + 1,
                last_exit,
            };
            error!("{}", err);
            state.set_status(protocol, ProcessStatus::Failed);
            return ProcessStatus::Failed;
        }

        restarts += 1;
        let delay = backoff.next_backoff().unwrap_or(policy.max_backoff);
        info!(
            "Restarting {} in {:?} (attempt {}/{})",
            protocol, delay, restarts, policy.max_restarts
        );
        state.update_process(protocol, |p| {
            p.status = ProcessStatus::RestartPending;
            p.restarts = restarts;
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => {
                state.set_status(protocol, ProcessStatus::ExitedClean);
                return ProcessStatus::ExitedClean;
            }
        }
    }
}

fn spawn(spec: &LaunchSpec, tail: &Arc<Mutex<VecDeque<String>>>) -> std::io::Result<Child> {
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(stdout, spec.protocol, tail.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(stderr, spec.protocol, tail.clone()));
    }
    Ok(child)
}

/// 子プロセスの出力をログに流し、末尾数行を保持
async fn forward_output<R>(reader: R, protocol: Protocol, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "subvisor::child", "[{}] {}", protocol, line);
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

/// 終了・停止要求のどちらかまで待つ
/// 猶予時間を越えて生きていれば Running に遷移
async fn run_until_exit(
    child: &mut Child,
    protocol: Protocol,
    state: &SharedState,
    policy: &RestartPolicy,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Exit {
    let grace = tokio::time::sleep(policy.grace);
    tokio::pin!(grace);
    let mut running = false;

    loop {
        tokio::select! {
            result = child.wait() => {
                return match result {
                    Ok(status) => Exit::Exited(status),
                    Err(e) => Exit::WaitFailed(e),
                };
            }
            _ = &mut grace, if !running => {
                running = true;
                debug!("{} survived grace period", protocol);
                state.set_status(protocol, ProcessStatus::Running);
            }
            _ = shutdown_rx.recv() => {
                return Exit::Shutdown;
            }
        }
    }
}

/// SIGTERM を送り、猶予内に終わらなければ強制終了
pub async fn terminate(child: &mut Child, stop_timeout: Duration) {
    if send_sigterm(child) {
        if tokio::time::timeout(stop_timeout, child.wait()).await.is_ok() {
            return;
        }
        warn!("Process {:?} ignored SIGTERM, killing", child.id());
    }
    let _ = child.kill().await;
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    match child.id() {
        Some(pid) => {
            // SAFETY: 自分が起動した子プロセスへのシグナル送信のみ
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
        }
        None => false,
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}
