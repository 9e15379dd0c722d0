use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use url::form_urlencoded;

use crate::credentials::Credentials;
use crate::error::Error;
use crate::planner::Plan;
use crate::protocol::Protocol;
use crate::state::{SharedState, Snapshot};

/// 購読に載せる順序
const URI_ORDER: [Protocol; 5] = [
    Protocol::Tuic,
    Protocol::Hy2,
    Protocol::Reality,
    Protocol::ArgoWs,
    Protocol::HttpSub,
];

/// URI 生成に使うノード情報
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub public_host: String,
    pub credentials: Credentials,
    pub tls_sni: String,
    pub reality_sni: String,
    /// トンネル経由ノードの接続先（CDN のフロントドメイン）
    pub cf_domain: String,
    pub label: String,
}

/// 公開する購読内容
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDescriptor {
    pub revision: u64,
    pub uris: Vec<String>,
    pub tunnel_host: Option<String>,
}

impl SubscriptionDescriptor {
    /// 1行1URI、末尾改行つき
    pub fn render(&self) -> String {
        let mut out = String::new();
        for uri in &self.uris {
            out.push_str(uri);
            out.push('\n');
        }
        out
    }
}

fn query(pairs: &[(&str, &str)]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in pairs {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

fn fragment(prefix: &str, label: &str) -> String {
    let name = format!("{}-{}", prefix, label);
    form_urlencoded::byte_serialize(name.as_bytes()).collect()
}

/// IPv6 アドレスは角括弧で囲む
fn host_for_uri(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// 1プロトコル分の接続 URI
pub fn protocol_uri(protocol: Protocol, port: u16, node: &NodeInfo, tunnel_host: Option<&str>) -> Option<String> {
    let creds = &node.credentials;
    let host = host_for_uri(&node.public_host);
    let uri = match protocol {
        Protocol::Tuic => format!(
            "tuic://{}:{}@{}:{}?{}#{}",
            creds.uuid,
            creds.tuic_password,
            host,
            port,
            query(&[
                ("sni", &node.tls_sni),
                ("alpn", "h3"),
                ("congestion_control", "bbr"),
                ("allowInsecure", "1"),
            ]),
            fragment("TUIC", &node.label)
        ),
        Protocol::Hy2 => format!(
            "hysteria2://{}@{}:{}/?{}#{}",
            creds.uuid,
            host,
            port,
            query(&[("sni", &node.tls_sni), ("insecure", "1")]),
            fragment("Hysteria2", &node.label)
        ),
        Protocol::Reality => {
            let keys = creds.reality.as_ref()?;
            format!(
                "vless://{}@{}:{}?{}#{}",
                creds.uuid,
                host,
                port,
                query(&[
                    ("encryption", "none"),
                    ("flow", "xtls-rprx-vision"),
                    ("security", "reality"),
                    ("sni", &node.reality_sni),
                    ("fp", "chrome"),
                    ("pbk", &keys.public_key),
                    ("type", "tcp"),
                ]),
                fragment("Reality", &node.label)
            )
        }
        Protocol::ArgoWs => {
            // トンネル経由はローカルポートではなくトンネルのホスト名を使う
            let tunnel_host = tunnel_host?;
            format!(
                "vless://{}@{}:443?{}#{}",
                creds.uuid,
                node.cf_domain,
                query(&[
                    ("encryption", "none"),
                    ("security", "tls"),
                    ("sni", tunnel_host),
                    ("type", "ws"),
                    ("host", tunnel_host),
                    ("path", &creds.ws_path()),
                ]),
                fragment("Argo", &node.label)
            )
        }
        Protocol::HttpSub => format!("http://{}:{}/sub", host, port),
    };
    Some(uri)
}

/// スナップショットから購読内容を組み立てる
/// Running のプロトコルだけを載せる
pub fn build_descriptor(snapshot: &Snapshot, plan: &Plan, node: &NodeInfo) -> SubscriptionDescriptor {
    let tunnel_host = snapshot.tunnel_hostname();
    let uris = URI_ORDER
        .iter()
        .filter(|protocol| snapshot.is_live(**protocol))
        .filter_map(|protocol| {
            let port = plan.port_of(*protocol)?;
            protocol_uri(*protocol, port, node, tunnel_host)
        })
        .collect();

    SubscriptionDescriptor {
        revision: snapshot.revision,
        uris,
        tunnel_host: tunnel_host.map(str::to_string),
    }
}

/// 購読内容の公開先（メモリとファイル）
#[derive(Clone)]
pub struct Publisher {
    current: Arc<RwLock<Arc<SubscriptionDescriptor>>>,
    files: Vec<PathBuf>,
}

impl Publisher {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(SubscriptionDescriptor::default()))),
            files: vec![work_dir.join("sub.txt"), work_dir.join("list.txt")],
        }
    }

    /// 現在公開中の内容
    pub async fn current(&self) -> Arc<SubscriptionDescriptor> {
        self.current.read().await.clone()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// 一時ファイルに書いてから rename し、途中の内容が読まれないようにする
    pub async fn publish(&self, descriptor: SubscriptionDescriptor) -> Result<Arc<SubscriptionDescriptor>> {
        let text = descriptor.render();
        for path in &self.files {
            let tmp = path.with_extension("txt.tmp");
            tokio::fs::write(&tmp, &text)
                .await
                .with_context(|| format!("Failed to write {}", tmp.display()))?;
            tokio::fs::rename(&tmp, path)
                .await
                .with_context(|| format!("Failed to replace {}", path.display()))?;
        }

        let descriptor = Arc::new(descriptor);
        *self.current.write().await = descriptor.clone();
        Ok(descriptor)
    }
}

/// 状態変化のたびに購読内容を作り直す
pub struct Assembler {
    state: SharedState,
    plan: Plan,
    node: NodeInfo,
    publisher: Publisher,
    settle_timeout: Duration,
}

impl Assembler {
    pub fn new(
        state: SharedState,
        plan: Plan,
        node: NodeInfo,
        publisher: Publisher,
        settle_timeout: Duration,
    ) -> Self {
        Self {
            state,
            plan,
            node,
            publisher,
            settle_timeout,
        }
    }

    /// 全エンドポイントが落ち着くか、待機時間が過ぎるまで待つ
    pub async fn settle(&self) -> Snapshot {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let settled = rx.borrow_and_update().is_settled();
                if settled {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };

        if tokio::time::timeout(self.settle_timeout, wait).await.is_err() {
            let snapshot = self.state.snapshot();
            if snapshot.tunnel.as_ref().map_or(false, |t| !t.is_settled()) {
                warn!("Tunnel still connecting at settle timeout");
            }
            warn!(
                "{}",
                Error::AssemblyTimeout {
                    pending: snapshot.pending_protocols()
                }
            );
        }
        self.state.snapshot()
    }

    /// 指定スナップショットから作って公開
    pub async fn publish(&self, snapshot: &Snapshot) -> Result<Arc<SubscriptionDescriptor>> {
        let descriptor = build_descriptor(snapshot, &self.plan, &self.node);
        info!(
            "Publishing subscription with {} endpoint(s) (revision {})",
            descriptor.uris.len(),
            descriptor.revision
        );
        self.publisher.publish(descriptor).await
    }

    /// 以降の状態変化に追従して再公開し続ける
    pub async fn follow(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut rx = self.state.subscribe();
        loop {
            let snapshot = rx.borrow_and_update().clone();
            let descriptor = build_descriptor(&snapshot, &self.plan, &self.node);
            let current = self.publisher.current().await;
            if descriptor.uris != current.uris {
                self.publisher.publish(descriptor).await?;
                info!(
                    "Subscription updated: {} endpoint(s) (revision {})",
                    self.publisher.current().await.uris.len(),
                    snapshot.revision
                );
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }
}
