use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::Protocol;

/// オーケストレーターのエラー分類
#[derive(Debug, Error)]
pub enum Error {
    /// 範囲外・数値でないポート指定（警告としてスキップされる）
    #[error("invalid port {value:?}: must be an integer in 1-65535")]
    InvalidPort { value: String },

    /// 明示指定・ファイル・自動検出のいずれでもポートを得られなかった
    #[error("no ports available: {reason}")]
    NoPortsAvailable { reason: String },

    /// ポート不足で一部のプロトコルを割り当てられなかった
    #[error("insufficient ports: dropped {}", format_protocols(.dropped))]
    InsufficientPorts { dropped: Vec<Protocol> },

    #[error("failed to launch {protocol}: {source}")]
    ProcessLaunchFailed {
        protocol: Protocol,
        #[source]
        source: std::io::Error,
    },

    /// 再起動の上限に達した
    #[error("{protocol} exited {attempts} times, giving up: {last_exit}")]
    ProcessCrashLoop {
        protocol: Protocol,
        attempts: u32,
        last_exit: String,
    },

    #[error("tunnel authentication failed after {attempts} attempts: {detail}")]
    TunnelAuthFailed { attempts: u32, detail: String },

    #[error("tunnel unreachable after {attempts} attempts: {detail}")]
    TunnelUnreachable { attempts: u32, detail: String },

    /// 待機時間内に全エンドポイントが揃わなかった
    #[error("endpoints still pending after settle timeout: {}", format_protocols(.pending))]
    AssemblyTimeout { pending: Vec<Protocol> },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{context} ({}): {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// プロセス終了コード
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NoPortsAvailable { .. } => 2,
            Error::InsufficientPorts { .. } => 3,
            Error::TunnelAuthFailed { .. } => 4,
            Error::TunnelUnreachable { .. } => 5,
            _ => 1,
        }
    }
}

fn format_protocols(protocols: &[Protocol]) -> String {
    protocols
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `anyhow::Error` から終了コードを取り出す
pub fn exit_code_of(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map(Error::exit_code)
        .unwrap_or(1)
}
