use socket2::{Domain, SockAddr, Socket, Type};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Error;

/// 1ポートあたりの自動検出試行回数
const ATTEMPTS_PER_PORT: usize = 8;

/// ポートの取得元
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSource {
    Explicit,
    File,
    Ephemeral,
}

impl fmt::Display for PortSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSource::Explicit => f.write_str("explicit"),
            PortSource::File => f.write_str("file"),
            PortSource::Ephemeral => f.write_str("ephemeral"),
        }
    }
}

/// 検証済みのポート
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub port: u16,
    pub source: PortSource,
}

/// 各戦略の結果
#[derive(Debug)]
pub enum Resolution {
    Found(Vec<PortSpec>),
    /// 使えるポートがなかった（理由つき）
    Skipped(String),
}

/// ポート解決の戦略（明示指定 → ファイル → 自動検出 の順に試す）
pub trait PortStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self, wanted: usize) -> Resolution;
}

/// ポート文字列を解析（空白・カンマ区切り）
/// 不正な値はスキップし、その内容を返す
pub fn parse_port_list(text: &str, source: PortSource) -> (Vec<PortSpec>, Vec<Error>) {
    let mut ports = BTreeSet::new();
    let mut rejected = Vec::new();

    let tokens = text
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(|line| line.split(|c: char| c.is_whitespace() || c == ','))
        .filter(|token| !token.is_empty());

    for token in tokens {
        match token.parse::<u16>() {
            Ok(port) if port >= 1 => {
                ports.insert(port);
            }
            _ => rejected.push(Error::InvalidPort {
                value: token.to_string(),
            }),
        }
    }

    let ports = ports
        .into_iter()
        .map(|port| PortSpec { port, source })
        .collect();
    (ports, rejected)
}

fn found_or_skipped(source: PortSource, text: &str) -> Resolution {
    let (ports, rejected) = parse_port_list(text, source);
    for err in &rejected {
        warn!("Skipping {} port: {}", source, err);
    }
    if ports.is_empty() {
        Resolution::Skipped(format!("no valid {} ports", source))
    } else {
        Resolution::Found(ports)
    }
}

/// 明示指定されたポート一覧
pub struct ExplicitList(pub Option<String>);

impl PortStrategy for ExplicitList {
    fn name(&self) -> &'static str {
        "explicit"
    }

    fn resolve(&self, _wanted: usize) -> Resolution {
        match self.0.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => found_or_skipped(PortSource::Explicit, text),
            _ => Resolution::Skipped("not set".to_string()),
        }
    }
}

/// 1行1ポートのフォールバックファイル
pub struct FallbackFile(pub Option<PathBuf>);

impl PortStrategy for FallbackFile {
    fn name(&self) -> &'static str {
        "file"
    }

    fn resolve(&self, _wanted: usize) -> Resolution {
        let path = match &self.0 {
            Some(path) => path,
            None => return Resolution::Skipped("not set".to_string()),
        };
        match std::fs::read_to_string(path) {
            Ok(text) => found_or_skipped(PortSource::File, &text),
            Err(e) => Resolution::Skipped(format!("cannot read {}: {}", path.display(), e)),
        }
    }
}

/// OS のエフェメラルポートを確保してすぐ解放する
pub struct EphemeralPorts;

impl EphemeralPorts {
    /// TCP で空きポートを取り、同じ番号が UDP でもバインド可能か確認
    fn reserve_one() -> std::io::Result<u16> {
        let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        let tcp = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP))?;
        tcp.bind(&SockAddr::from(any))?;
        let port = tcp
            .local_addr()?
            .as_socket()
            .map(|addr| addr.port())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no local address"))?;

        let udp = Socket::new(Domain::IPV4, Type::DGRAM, Some(socket2::Protocol::UDP))?;
        udp.bind(&SockAddr::from(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))))?;
        Ok(port)
    }
}

impl PortStrategy for EphemeralPorts {
    fn name(&self) -> &'static str {
        "ephemeral"
    }

    fn resolve(&self, wanted: usize) -> Resolution {
        let attempts = wanted.max(1) * ATTEMPTS_PER_PORT;
        let mut allocated = HashSet::new();
        let mut last_error = None;

        for _ in 0..attempts {
            if allocated.len() >= wanted {
                break;
            }
            match Self::reserve_one() {
                Ok(port) => {
                    allocated.insert(port);
                }
                Err(e) => {
                    debug!("Ephemeral port reservation failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        if allocated.is_empty() {
            let reason = last_error
                .map(|e| format!("binding failed: {}", e))
                .unwrap_or_else(|| "no ephemeral port could be bound".to_string());
            return Resolution::Skipped(reason);
        }

        let mut ports: Vec<_> = allocated
            .into_iter()
            .map(|port| PortSpec {
                port,
                source: PortSource::Ephemeral,
            })
            .collect();
        ports.sort_by_key(|spec| spec.port);
        Resolution::Found(ports)
    }
}

/// ポート解決器
pub struct PortResolver {
    strategies: Vec<Box<dyn PortStrategy>>,
}

impl PortResolver {
    /// 標準の戦略順で作成
    pub fn new(explicit: Option<String>, fallback_file: Option<&Path>) -> Self {
        Self::with_strategies(vec![
            Box::new(ExplicitList(explicit)),
            Box::new(FallbackFile(fallback_file.map(Path::to_path_buf))),
            Box::new(EphemeralPorts),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn PortStrategy>>) -> Self {
        Self { strategies }
    }

    /// 最初に成功した戦略の結果を返す
    /// `wanted` は自動検出時に確保するポート数
    pub fn resolve(&self, wanted: usize) -> Result<Vec<PortSpec>, Error> {
        let mut reasons = Vec::new();
        for strategy in &self.strategies {
            match strategy.resolve(wanted) {
                Resolution::Found(ports) => {
                    info!(
                        "Resolved {} port(s) via {}: {}",
                        ports.len(),
                        strategy.name(),
                        ports
                            .iter()
                            .map(|p| p.port.to_string())
                            .collect::<Vec<_>>()
                            .join(" ")
                    );
                    return Ok(ports);
                }
                Resolution::Skipped(reason) => {
                    debug!("Port strategy {} skipped: {}", strategy.name(), reason);
                    reasons.push(format!("{}: {}", strategy.name(), reason));
                }
            }
        }
        Err(Error::NoPortsAvailable {
            reason: reasons.join("; "),
        })
    }
}
