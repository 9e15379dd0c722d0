use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
use crate::planner::{both_udp, Mode, MuxPolicy};
use crate::protocol::Protocol;
use crate::supervisor::RestartPolicy;
use crate::tunnel::{TunnelIdentity, TunnelSettings};

/// トンネル経由ノードの接続先候補
const DEFAULT_CF_DOMAINS: [&str; 6] = [
    "cf.090227.xyz",
    "cf.877774.xyz",
    "cf.130519.xyz",
    "cf.008500.xyz",
    "store.ubi.com",
    "saas.sin.fan",
];

/// 公開IPの問い合わせ先（上から順に試す）
const DEFAULT_IP_URLS: [&str; 2] = ["https://ipv4.ip.sb", "https://api.ipify.org"];

const DEFAULT_META_URL: &str = "https://speed.cloudflare.com/meta";

/// 全体設定（既定値 ← 設定ファイル ← CLI/環境変数）
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// ポート指定（空白・カンマ区切り）
    pub ports: Option<String>,
    pub port_file: Option<PathBuf>,
    pub mode: Mode,
    pub tuic: bool,
    pub reality: bool,
    pub work_dir: PathBuf,
    pub singbox_bin: PathBuf,
    pub cloudflared_bin: PathBuf,
    /// 未指定なら作業ディレクトリの cert.pem
    pub cert_path: Option<PathBuf>,
    /// 未指定なら作業ディレクトリの private.key
    pub key_path: Option<PathBuf>,
    /// URI に載せるホスト（未指定なら公開IPを問い合わせる）
    pub public_host: Option<String>,
    /// 未指定なら `<組織>-<国>` を問い合わせる
    pub node_label: Option<String>,
    pub tls_sni: String,
    pub reality_sni: String,
    /// 未指定なら UUID を使う
    pub tuic_password: Option<String>,
    pub max_restarts: u32,
    /// 同一ポートの共有を許す組（未指定なら既定の表）
    pub mux_allow: Option<Vec<(Protocol, Protocol)>>,
    pub tunnel: TunnelConfig,
    pub lookup: LookupConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    pub enabled: bool,
    pub token: Option<String>,
    pub domain: Option<String>,
    /// トンネルの転送先となるローカルポート
    pub local_port: u16,
    pub cf_domains: Vec<String>,
}

/// 公開IPとノード名の問い合わせ先
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LookupConfig {
    pub ip_urls: Vec<String>,
    pub meta_url: String,
}

/// 各種待ち時間（秒）
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub grace: u64,
    pub settle: u64,
    pub hostname: u64,
    pub register: u64,
    pub reach: u64,
    pub lookup: u64,
    pub stop: u64,
    pub max_backoff: u64,
    /// この時間安定して動けば再起動回数を数え直す
    pub stable: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: None,
            port_file: None,
            mode: Mode::default(),
            tuic: true,
            reality: true,
            work_dir: PathBuf::from(".npm"),
            singbox_bin: PathBuf::from("sb"),
            cloudflared_bin: PathBuf::from("cloudflared"),
            cert_path: None,
            key_path: None,
            public_host: None,
            node_label: None,
            tls_sni: "www.bing.com".to_string(),
            reality_sni: "www.nazhumi.com".to_string(),
            tuic_password: None,
            max_restarts: 3,
            mux_allow: None,
            tunnel: TunnelConfig::default(),
            lookup: LookupConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token: None,
            domain: None,
            local_port: 8081,
            cf_domains: DEFAULT_CF_DOMAINS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            ip_urls: DEFAULT_IP_URLS.iter().map(|u| u.to_string()).collect(),
            meta_url: DEFAULT_META_URL.to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            grace: 2,
            settle: 60,
            hostname: 30,
            register: 20,
            reach: 5,
            lookup: 5,
            stop: 5,
            max_backoff: 30,
            stable: 60,
        }
    }
}

impl Config {
    /// TOML 文字列から読み込む（省略した項目は既定値）
    pub fn from_toml(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text).context("Failed to parse config")?;
        Ok(config)
    }

    /// 設定ファイルを読む。パスがなければ既定値
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
            }
            None => Ok(Config::default()),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.tunnel.enabled {
            if self.tunnel.local_port == 0 {
                return Err(Error::Config("tunnel.local_port must be in 1-65535".into()));
            }
            let token = self.tunnel.token.as_deref().map(str::trim).unwrap_or("");
            let domain = self.tunnel.domain.as_deref().map(str::trim).unwrap_or("");
            if !token.is_empty() && domain.is_empty() {
                return Err(Error::Config(
                    "a tunnel token requires a tunnel domain (ARGO_DOMAIN)".into(),
                ));
            }
        }
        if self.timeouts.settle == 0 {
            return Err(Error::Config("timeouts.settle must be positive".into()));
        }
        if self.timeouts.hostname == 0 || self.timeouts.register == 0 {
            return Err(Error::Config("tunnel timeouts must be positive".into()));
        }
        if self.node_label.as_deref().map_or(false, |l| l.trim().is_empty()) {
            return Err(Error::Config("node_label must not be empty".into()));
        }
        if let Some(pairs) = &self.mux_allow {
            if let Some((a, _)) = pairs.iter().find(|(a, b)| a == b) {
                return Err(Error::Config(format!("mux_allow pairs {} with itself", a)));
            }
            if let Some((a, b)) = pairs.iter().find(|(a, b)| both_udp(*a, *b)) {
                return Err(Error::Config(format!(
                    "mux_allow: {} and {} both listen on UDP and cannot share a port",
                    a, b
                )));
            }
        }
        Ok(())
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert_path
            .clone()
            .unwrap_or_else(|| self.work_dir.join("cert.pem"))
    }

    pub fn key_path(&self) -> PathBuf {
        self.key_path
            .clone()
            .unwrap_or_else(|| self.work_dir.join("private.key"))
    }

    pub fn mux_policy(&self) -> MuxPolicy {
        match &self.mux_allow {
            Some(pairs) => MuxPolicy::from_pairs(pairs.iter().copied()),
            None => MuxPolicy::default(),
        }
    }

    /// トンネルの身元（無効なら None）
    /// ドメインだけの指定は一時トンネル扱い
    pub fn tunnel_identity(&self) -> Option<TunnelIdentity> {
        if !self.tunnel.enabled {
            return None;
        }
        let token = non_empty(self.tunnel.token.as_deref());
        let domain = non_empty(self.tunnel.domain.as_deref());
        match (token, domain) {
            (Some(token), Some(domain)) => Some(TunnelIdentity::Fixed {
                token: token.to_string(),
                domain: domain.to_string(),
            }),
            _ => Some(TunnelIdentity::Ephemeral),
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            grace: Duration::from_secs(self.timeouts.grace),
            max_backoff: Duration::from_secs(self.timeouts.max_backoff),
            stop_timeout: Duration::from_secs(self.timeouts.stop),
            stable_after: Duration::from_secs(self.timeouts.stable),
            ..RestartPolicy::default()
        }
    }

    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            hostname_timeout: Duration::from_secs(self.timeouts.hostname),
            register_timeout: Duration::from_secs(self.timeouts.register),
            reach_timeout: Duration::from_secs(self.timeouts.reach),
            policy: self.restart_policy(),
            ..TunnelSettings::default()
        }
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.settle)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.lookup)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mode, Mode::Auto);
        assert_eq!(config.tunnel.local_port, 8081);
        assert_eq!(config.tunnel.cf_domains[0], "cf.090227.xyz");
        assert_eq!(config.cert_path(), PathBuf::from(".npm/cert.pem"));
        assert!(matches!(config.tunnel_identity(), Some(TunnelIdentity::Ephemeral)));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
ports = "443 8443"
mode = "multi"
tuic = false
mux_allow = [["hy2", "http"], ["tuic", "reality"]]

[tunnel]
token = "eyJh"
domain = "node.example.com"

[timeouts]
settle = 10
"#,
        )
        .unwrap();

        assert_eq!(config.ports.as_deref(), Some("443 8443"));
        assert_eq!(config.mode, Mode::Multi);
        assert!(!config.tuic);
        assert!(config.reality);
        assert_eq!(config.tunnel.local_port, 8081);
        assert_eq!(config.settle_timeout(), Duration::from_secs(10));
        assert_eq!(config.timeouts.hostname, 30);
        assert!(config.mux_policy().allows(Protocol::Reality, Protocol::Tuic));
        assert!(!config.mux_policy().allows(Protocol::Tuic, Protocol::HttpSub));
        match config.tunnel_identity() {
            Some(TunnelIdentity::Fixed { domain, .. }) => assert_eq!(domain, "node.example.com"),
            other => panic!("unexpected: {:?}", other),
        }
        config.validate().unwrap();
    }

    #[test]
    fn test_udp_pair_in_mux_allow_is_invalid() {
        let config = Config::from_toml("mux_allow = [[\"hy2\", \"tuic\"]]").unwrap();
        match config.validate() {
            Err(Error::Config(msg)) => assert!(msg.contains("UDP"), "{}", msg),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!config.mux_policy().allows(Protocol::Hy2, Protocol::Tuic));
    }

    #[test]
    fn test_lookup_defaults_and_overrides() {
        let config = Config::default();
        assert_eq!(config.lookup.ip_urls, vec!["https://ipv4.ip.sb", "https://api.ipify.org"]);
        assert_eq!(config.lookup.meta_url, "https://speed.cloudflare.com/meta");
        assert!(config.node_label.is_none());

        let config = Config::from_toml(
            "[lookup]\nip_urls = [\"http://127.0.0.1:1/ip\"]\n[timeouts]\nstable = 5\n",
        )
        .unwrap();
        assert_eq!(config.lookup.ip_urls.len(), 1);
        assert_eq!(config.lookup.meta_url, DEFAULT_META_URL);
        assert_eq!(config.restart_policy().stable_after, Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Config::from_toml("prots = \"443\"").is_err());
    }

    #[test]
    fn test_token_without_domain_is_invalid() {
        let mut config = Config::default();
        config.tunnel.token = Some("eyJh".into());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.tunnel.enabled = false;
        config.validate().unwrap();
        assert!(config.tunnel_identity().is_none());
    }

    #[test]
    fn test_domain_without_token_is_ephemeral() {
        let mut config = Config::default();
        config.tunnel.domain = Some("node.example.com".into());
        assert!(matches!(config.tunnel_identity(), Some(TunnelIdentity::Ephemeral)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subvisor.toml");
        std::fs::write(&path, "node_label = \"Tokyo\"\nmax_restarts = 5\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.node_label.as_deref(), Some("Tokyo"));
        assert_eq!(config.restart_policy().max_restarts, 5);

        assert!(Config::load(Some(&dir.path().join("missing.toml"))).is_err());
        assert_eq!(Config::load(None).unwrap(), Config::default());
    }
}
