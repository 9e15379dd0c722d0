use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::warn;

use crate::protocol::Protocol;

/// 監視中プロセスの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Starting,
    Running,
    ExitedClean,
    ExitedError,
    RestartPending,
    /// 再起動上限に達した（以後変化しない）
    Failed,
}

impl ProcessStatus {
    pub fn is_live(self) -> bool {
        self == ProcessStatus::Running
    }

    /// これ以上遷移しない状態
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessStatus::ExitedClean | ProcessStatus::Failed)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::ExitedClean => "exited-clean",
            ProcessStatus::ExitedError => "exited-error",
            ProcessStatus::RestartPending => "restart-pending",
            ProcessStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessState {
    pub protocol: Protocol,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub restarts: u32,
    pub last_exit: Option<String>,
}

impl ProcessState {
    fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            status: ProcessStatus::Starting,
            pid: None,
            started_at: None,
            restarts: 0,
            last_exit: None,
        }
    }
}

/// トンネルの動作モード（トークンは状態に含めない）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMode {
    Ephemeral,
    Fixed { domain: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    NotStarted,
    Connecting,
    Connected,
    Failed,
}

/// トンネル失敗の原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelFailure {
    /// 一時トンネルでホスト名が得られなかった
    NoHostname,
    AuthFailed,
    Unreachable,
    /// 接続後にプロセスが終了した
    Lost,
}

#[derive(Debug, Clone)]
pub struct TunnelState {
    pub mode: TunnelMode,
    pub status: TunnelStatus,
    hostname: Option<String>,
    pub failure: Option<TunnelFailure>,
    pub attempts: u32,
}

impl TunnelState {
    pub fn new(mode: TunnelMode) -> Self {
        Self {
            mode,
            status: TunnelStatus::NotStarted,
            hostname: None,
            failure: None,
            attempts: 0,
        }
    }

    /// 接続中のときだけホスト名を返す
    pub fn hostname(&self) -> Option<&str> {
        match self.status {
            TunnelStatus::Connected => self.hostname.as_deref(),
            _ => None,
        }
    }

    pub fn connecting(&mut self) {
        self.status = TunnelStatus::Connecting;
        self.failure = None;
    }

    /// ホスト名は一度決まったら変えない
    pub fn connected(&mut self, hostname: &str) {
        match &self.hostname {
            Some(existing) if existing != hostname => {
                warn!(
                    "Tunnel reported hostname {} but {} is already published; keeping it",
                    hostname, existing
                );
            }
            Some(_) => {}
            None => self.hostname = Some(hostname.to_string()),
        }
        self.status = TunnelStatus::Connected;
        self.failure = None;
    }

    pub fn failed(&mut self, cause: TunnelFailure) {
        self.status = TunnelStatus::Failed;
        self.failure = Some(cause);
    }

    /// 接続済みか、これ以上変化しない状態
    pub fn is_settled(&self) -> bool {
        matches!(self.status, TunnelStatus::Connected | TunnelStatus::Failed)
    }
}

/// ある時点の全体状態（読み取り専用のコピー）
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub revision: u64,
    pub processes: BTreeMap<Protocol, ProcessState>,
    pub tunnel: Option<TunnelState>,
}

impl Snapshot {
    pub fn status_of(&self, protocol: Protocol) -> Option<ProcessStatus> {
        self.processes.get(&protocol).map(|p| p.status)
    }

    pub fn is_live(&self, protocol: Protocol) -> bool {
        self.status_of(protocol).map_or(false, ProcessStatus::is_live)
    }

    pub fn live_protocols(&self) -> Vec<Protocol> {
        self.processes
            .values()
            .filter(|p| p.status.is_live())
            .map(|p| p.protocol)
            .collect()
    }

    /// まだ Running にも終端状態にもなっていないプロトコル
    pub fn pending_protocols(&self) -> Vec<Protocol> {
        self.processes
            .values()
            .filter(|p| !p.status.is_live() && !p.status.is_terminal())
            .map(|p| p.protocol)
            .collect()
    }

    pub fn tunnel_hostname(&self) -> Option<&str> {
        self.tunnel.as_ref().and_then(TunnelState::hostname)
    }

    /// 全プロトコルとトンネルが落ち着いたか
    pub fn is_settled(&self) -> bool {
        self.pending_protocols().is_empty()
            && self.tunnel.as_ref().map_or(true, TunnelState::is_settled)
    }
}

/// 全体状態の唯一の保持者
/// 書き込みは `send_modify` で一括適用し、読み手にはスナップショットを渡す
#[derive(Clone)]
pub struct SharedState {
    tx: Arc<watch::Sender<Snapshot>>,
}

impl SharedState {
    pub fn new(protocols: impl IntoIterator<Item = Protocol>, tunnel: Option<TunnelMode>) -> Self {
        let snapshot = Snapshot {
            revision: 0,
            processes: protocols
                .into_iter()
                .map(|p| (p, ProcessState::new(p)))
                .collect(),
            tunnel: tunnel.map(TunnelState::new),
        };
        let (tx, _rx) = watch::channel(snapshot);
        Self { tx: Arc::new(tx) }
    }

    pub fn update_process(&self, protocol: Protocol, f: impl FnOnce(&mut ProcessState)) {
        self.tx.send_modify(|snapshot| {
            let entry = snapshot
                .processes
                .entry(protocol)
                .or_insert_with(|| ProcessState::new(protocol));
            f(entry);
            snapshot.revision += 1;
        });
    }

    pub fn set_status(&self, protocol: Protocol, status: ProcessStatus) {
        self.update_process(protocol, |p| p.status = status);
    }

    pub fn update_tunnel(&self, f: impl FnOnce(&mut TunnelState)) {
        self.tx.send_modify(|snapshot| {
            if let Some(tunnel) = snapshot.tunnel.as_mut() {
                f(tunnel);
                snapshot.revision += 1;
            }
        });
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_detached() {
        let state = SharedState::new([Protocol::Hy2, Protocol::Tuic], None);
        let before = state.snapshot();
        state.set_status(Protocol::Hy2, ProcessStatus::Running);
        assert_eq!(before.status_of(Protocol::Hy2), Some(ProcessStatus::Starting));
        let after = state.snapshot();
        assert!(after.is_live(Protocol::Hy2));
        assert!(after.revision > before.revision);
        assert_eq!(after.live_protocols(), vec![Protocol::Hy2]);
        assert_eq!(after.pending_protocols(), vec![Protocol::Tuic]);
    }

    #[test]
    fn test_settled_requires_terminal_or_running() {
        let state = SharedState::new([Protocol::Hy2], Some(TunnelMode::Ephemeral));
        state.set_status(Protocol::Hy2, ProcessStatus::Running);
        assert!(!state.snapshot().is_settled());
        state.update_tunnel(|t| t.failed(TunnelFailure::NoHostname));
        assert!(state.snapshot().is_settled());
        assert_eq!(state.snapshot().tunnel_hostname(), None);
    }

    #[test]
    fn test_hostname_is_immutable() {
        let mut tunnel = TunnelState::new(TunnelMode::Ephemeral);
        tunnel.connecting();
        assert_eq!(tunnel.hostname(), None);
        tunnel.connected("a.trycloudflare.com");
        tunnel.connected("b.trycloudflare.com");
        assert_eq!(tunnel.hostname(), Some("a.trycloudflare.com"));

        tunnel.failed(TunnelFailure::Lost);
        assert_eq!(tunnel.hostname(), None);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let state = SharedState::new([Protocol::Hy2], None);
        let mut rx = state.subscribe();
        state.set_status(Protocol::Hy2, ProcessStatus::Running);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_live(Protocol::Hy2));
    }
}
