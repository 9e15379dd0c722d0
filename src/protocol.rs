use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::credentials::Credentials;

/// 管理対象のプロトコル
/// 並び順は複数ポートモードでの割り当て優先度を兼ねる
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Hy2,
    #[serde(rename = "http")]
    HttpSub,
    Tuic,
    Reality,
    /// トンネルの転送先となるローカル VLESS-WS
    #[serde(rename = "argo")]
    ArgoWs,
}

/// 待ち受けに使うトランスポート
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Hy2,
        Protocol::HttpSub,
        Protocol::Tuic,
        Protocol::Reality,
        Protocol::ArgoWs,
    ];

    pub fn transport(self) -> Transport {
        match self {
            Protocol::Hy2 | Protocol::Tuic => Transport::Udp,
            Protocol::Reality | Protocol::HttpSub | Protocol::ArgoWs => Transport::Tcp,
        }
    }

    /// 外部プロセス（sing-box）で動かすかどうか
    /// HTTP購読エンドポイントはプロセス内で提供する
    pub fn is_external(self) -> bool {
        self != Protocol::HttpSub
    }

    /// sing-box の inbound タグ
    pub fn tag(self) -> &'static str {
        match self {
            Protocol::Hy2 => "hy2-in",
            Protocol::Tuic => "tuic-in",
            Protocol::Reality => "vless-reality-in",
            Protocol::ArgoWs => "vless-argo-in",
            Protocol::HttpSub => "http-sub",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Hy2 => "HY2",
            Protocol::Tuic => "TUIC",
            Protocol::Reality => "REALITY",
            Protocol::HttpSub => "HTTP-SUB",
            Protocol::ArgoWs => "ARGO-WS",
        };
        f.write_str(name)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hy2" | "hysteria2" => Ok(Protocol::Hy2),
            "tuic" => Ok(Protocol::Tuic),
            "reality" => Ok(Protocol::Reality),
            "http" | "http-sub" | "sub" => Ok(Protocol::HttpSub),
            "argo" | "argo-ws" => Ok(Protocol::ArgoWs),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// inbound 生成に必要な共通設定
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub credentials: Credentials,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub tls_sni: String,
    pub reality_sni: String,
}

/// 起動するプロセスの実行内容
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub protocol: Protocol,
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// 単一プロトコル分の sing-box 設定を生成
pub fn inbound_config(protocol: Protocol, port: u16, ctx: &InboundContext) -> Result<Value> {
    let creds = &ctx.credentials;
    let tls = json!({
        "enabled": true,
        "alpn": ["h3"],
        "certificate_path": ctx.cert_path,
        "key_path": ctx.key_path,
    });

    let inbound = match protocol {
        Protocol::Hy2 => json!({
            "type": "hysteria2",
            "tag": protocol.tag(),
            "listen": "::",
            "listen_port": port,
            "users": [{ "password": creds.uuid }],
            "tls": tls,
        }),
        Protocol::Tuic => json!({
            "type": "tuic",
            "tag": protocol.tag(),
            "listen": "::",
            "listen_port": port,
            "users": [{ "uuid": creds.uuid, "password": creds.tuic_password }],
            "congestion_control": "bbr",
            "tls": tls,
        }),
        Protocol::Reality => {
            let keys = creds
                .reality
                .as_ref()
                .context("REALITY requires a generated key pair")?;
            json!({
                "type": "vless",
                "tag": protocol.tag(),
                "listen": "::",
                "listen_port": port,
                "users": [{ "uuid": creds.uuid, "flow": "xtls-rprx-vision" }],
                "tls": {
                    "enabled": true,
                    "server_name": ctx.reality_sni,
                    "reality": {
                        "enabled": true,
                        "handshake": { "server": ctx.reality_sni, "server_port": 443 },
                        "private_key": keys.private_key,
                        "short_id": [""],
                    },
                },
            })
        }
        Protocol::ArgoWs => json!({
            "type": "vless",
            "tag": protocol.tag(),
            "listen": "127.0.0.1",
            "listen_port": port,
            "users": [{ "uuid": creds.uuid }],
            "transport": { "type": "ws", "path": creds.ws_path() },
        }),
        Protocol::HttpSub => anyhow::bail!("{} is served in-process", protocol),
    };

    Ok(json!({
        "log": { "level": "warn" },
        "inbounds": [inbound],
        "outbounds": [{ "type": "direct", "tag": "direct" }],
    }))
}

/// 設定ファイルを書き出し、起動内容を返す
pub fn prepare_launch(
    protocol: Protocol,
    port: u16,
    ctx: &InboundContext,
    singbox_bin: &Path,
    work_dir: &Path,
) -> Result<LaunchSpec> {
    let config = inbound_config(protocol, port, ctx)?;
    let path = work_dir.join(format!("{}.json", protocol.tag()));
    let data = serde_json::to_string_pretty(&config)
        .with_context(|| format!("Failed to serialize config for {}", protocol))?;
    std::fs::write(&path, data)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(LaunchSpec {
        protocol,
        program: singbox_bin.to_path_buf(),
        args: vec![
            "run".to_string(),
            "-c".to_string(),
            path.to_string_lossy().into_owned(),
        ],
    })
}
