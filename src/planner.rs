use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::Error;
use crate::port_resolver::{PortSource, PortSpec};
use crate::protocol::{Protocol, Transport};

/// 複数ポートモードでの割り当て優先順
const MULTI_PORT_PRIORITY: [Protocol; 4] = [
    Protocol::Hy2,
    Protocol::HttpSub,
    Protocol::Tuic,
    Protocol::Reality,
];

/// 動作モードの指定
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// ポートが1つなら単一、複数なら複数ポートモード
    Auto,
    Single,
    Multi,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Auto
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Mode::Auto),
            "single" => Ok(Mode::Single),
            "multi" => Ok(Mode::Multi),
            other => Err(format!("unknown mode '{}' (expected auto, single or multi)", other)),
        }
    }
}

impl Mode {
    /// 自動検出で確保すべきポート数
    pub fn wanted_ports(self) -> usize {
        match self {
            Mode::Single => 1,
            Mode::Auto | Mode::Multi => MULTI_PORT_PRIORITY.len(),
        }
    }
}

/// 実際に採用したモード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveMode {
    SinglePort,
    MultiPort,
}

impl fmt::Display for EffectiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectiveMode::SinglePort => f.write_str("single-port"),
            EffectiveMode::MultiPort => f.write_str("multi-port"),
        }
    }
}

/// 同一ポートを共有してよいプロトコルの組
/// 表にない組み合わせは未対応として扱う
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxPolicy {
    allowed: HashSet<(Protocol, Protocol)>,
}

impl Default for MuxPolicy {
    fn default() -> Self {
        // UDP と TCP で待ち受けが分かれる組のみ
        Self::from_pairs([
            (Protocol::Hy2, Protocol::HttpSub),
            (Protocol::Tuic, Protocol::HttpSub),
        ])
    }
}

impl MuxPolicy {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Protocol, Protocol)>) -> Self {
        Self {
            allowed: pairs.into_iter().map(|(a, b)| ordered(a, b)).collect(),
        }
    }

    /// 空の表（共有を一切許さない）
    pub fn deny_all() -> Self {
        Self {
            allowed: HashSet::new(),
        }
    }

    pub fn allow(&mut self, a: Protocol, b: Protocol) {
        self.allowed.insert(ordered(a, b));
    }

    /// 表に載っていても UDP 同士の組は共有させない
    pub fn allows(&self, a: Protocol, b: Protocol) -> bool {
        a != b && !both_udp(a, b) && self.allowed.contains(&ordered(a, b))
    }
}

/// 2つとも UDP で待ち受ける組（1つのソケットを取り合う）
pub fn both_udp(a: Protocol, b: Protocol) -> bool {
    a.transport() == Transport::Udp && b.transport() == Transport::Udp
}

fn ordered(a: Protocol, b: Protocol) -> (Protocol, Protocol) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// 計画に必要な入力
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub mode: Mode,
    pub tuic: bool,
    pub reality: bool,
    /// トンネル用ローカルポート（None ならトンネル無効）
    pub argo_port: Option<u16>,
}

/// プロトコルとポートの対応
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub protocol: Protocol,
    pub port: PortSpec,
}

/// 割り当て結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub mode: EffectiveMode,
    /// プロトコル優先度順
    pub assignments: Vec<Assignment>,
    /// ポート不足で落としたプロトコル
    pub dropped: Vec<Protocol>,
    /// 共有規則により無効化したプロトコル
    pub unsupported: Vec<Protocol>,
}

impl Plan {
    pub fn port_of(&self, protocol: Protocol) -> Option<u16> {
        self.assignments
            .iter()
            .find(|a| a.protocol == protocol)
            .map(|a| a.port.port)
    }

    pub fn protocols(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.assignments.iter().map(|a| a.protocol)
    }

    /// ポート不足の報告（致命的ではない）
    pub fn insufficient(&self) -> Option<Error> {
        if self.dropped.is_empty() {
            None
        } else {
            Some(Error::InsufficientPorts {
                dropped: self.dropped.clone(),
            })
        }
    }

    /// 同一ポートを共有している組がすべて許可されているか確認
    pub fn validate(&self, policy: &MuxPolicy) -> Result<(), Error> {
        for (i, a) in self.assignments.iter().enumerate() {
            for b in &self.assignments[i + 1..] {
                if a.port.port == b.port.port && !policy.allows(a.protocol, b.protocol) {
                    return Err(Error::Config(format!(
                        "{} and {} cannot share port {}",
                        a.protocol, b.protocol, a.port.port
                    )));
                }
            }
        }
        Ok(())
    }
}

/// ポート集合とモードから割り当てを決める
/// 入力の順序に依存せず、同じ入力には同じ結果を返す
pub fn plan(ports: &[PortSpec], options: &PlanOptions, policy: &MuxPolicy) -> Plan {
    let unique: BTreeSet<u16> = ports.iter().map(|p| p.port).collect();
    let sorted: Vec<PortSpec> = unique
        .iter()
        .map(|port| {
            let source = ports
                .iter()
                .filter(|p| p.port == *port)
                .map(|p| p.source)
                .min_by_key(|s| *s as u8)
                .unwrap_or(PortSource::Explicit);
            PortSpec { port: *port, source }
        })
        .collect();

    let mode = match options.mode {
        Mode::Single => EffectiveMode::SinglePort,
        Mode::Auto if sorted.len() <= 1 => EffectiveMode::SinglePort,
        Mode::Multi if sorted.len() <= 1 => {
            warn!("Multi-port mode needs more than one port, falling back to single-port mode");
            EffectiveMode::SinglePort
        }
        Mode::Auto | Mode::Multi => EffectiveMode::MultiPort,
    };

    let mut plan = Plan {
        mode,
        assignments: Vec::new(),
        dropped: Vec::new(),
        unsupported: Vec::new(),
    };

    let first = match sorted.first() {
        Some(first) => *first,
        None => return plan,
    };

    match mode {
        EffectiveMode::SinglePort => {
            plan.assignments.push(Assignment {
                protocol: Protocol::Hy2,
                port: first,
            });
            plan.assignments.push(Assignment {
                protocol: Protocol::HttpSub,
                port: first,
            });
            if options.tuic {
                let shareable = plan
                    .assignments
                    .iter()
                    .all(|a| policy.allows(a.protocol, Protocol::Tuic));
                if shareable {
                    plan.assignments.push(Assignment {
                        protocol: Protocol::Tuic,
                        port: first,
                    });
                } else {
                    plan.unsupported.push(Protocol::Tuic);
                }
            }
        }
        EffectiveMode::MultiPort => {
            let wanted = MULTI_PORT_PRIORITY.iter().copied().filter(|p| match p {
                Protocol::Tuic => options.tuic,
                Protocol::Reality => options.reality,
                _ => true,
            });
            let mut available = sorted.iter();
            for protocol in wanted {
                match available.next() {
                    Some(port) => plan.assignments.push(Assignment {
                        protocol,
                        port: *port,
                    }),
                    None => plan.dropped.push(protocol),
                }
            }
        }
    }

    if let Some(argo_port) = options.argo_port {
        let collides = plan
            .assignments
            .iter()
            .any(|a| a.port.port == argo_port && !policy.allows(a.protocol, Protocol::ArgoWs));
        if collides {
            plan.unsupported.push(Protocol::ArgoWs);
        } else {
            plan.assignments.push(Assignment {
                protocol: Protocol::ArgoWs,
                port: PortSpec {
                    port: argo_port,
                    source: PortSource::Explicit,
                },
            });
        }
    }

    plan.assignments.sort_by_key(|a| a.protocol);
    plan
}

/// 計画内容をログに出す
pub fn log_plan(plan: &Plan) {
    info!("Mode: {}", plan.mode);
    for a in &plan.assignments {
        info!("  {} -> port {} ({})", a.protocol, a.port.port, a.port.source);
    }
    if let Some(err) = plan.insufficient() {
        warn!("{}", err);
    }
    for protocol in &plan.unsupported {
        warn!("{} disabled: cannot share its port in this mode", protocol);
    }
}
