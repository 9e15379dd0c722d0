use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::error;

use subvisor::planner::Mode;
use subvisor::Config;

#[derive(Parser)]
#[clap(name = "subvisor")]
#[clap(about = "Runs HY2/TUIC/REALITY endpoints, a tunnel and a subscription feed", long_about = None)]
struct Cli {
    /// 設定ファイル (TOML)
    #[clap(long, short = 'c')]
    config: Option<PathBuf>,

    /// ポート一覧 (例: "443 8443")
    #[clap(long, env = "SERVER_PORT")]
    ports: Option<String>,

    /// ポート一覧が空のときに読むファイル
    #[clap(long)]
    port_file: Option<PathBuf>,

    /// auto / single / multi
    #[clap(long)]
    mode: Option<Mode>,

    #[clap(long)]
    no_tuic: bool,

    #[clap(long)]
    no_reality: bool,

    #[clap(long)]
    no_tunnel: bool,

    /// 固定トンネルのトークン
    #[clap(long, env = "ARGO_TOKEN", hide_env_values = true)]
    argo_token: Option<String>,

    /// 固定トンネルのドメイン
    #[clap(long, env = "ARGO_DOMAIN")]
    argo_domain: Option<String>,

    /// トンネルの転送先ローカルポート
    #[clap(long, env = "ARGO_PORT")]
    argo_port: Option<u16>,

    #[clap(long)]
    cert: Option<PathBuf>,

    #[clap(long)]
    key: Option<PathBuf>,

    /// URI に載せるホスト名/アドレス
    #[clap(long)]
    public_host: Option<String>,

    #[clap(long)]
    work_dir: Option<PathBuf>,

    #[clap(long)]
    singbox_bin: Option<PathBuf>,

    #[clap(long)]
    cloudflared_bin: Option<PathBuf>,

    #[clap(long)]
    label: Option<String>,
}

impl Cli {
    /// 設定ファイルの値を CLI/環境変数で上書き
    fn apply(self, config: &mut Config) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }

        if self.ports.as_deref().map_or(false, |p| !p.trim().is_empty()) {
            config.ports = self.ports;
        }
        if self.port_file.is_some() {
            config.port_file = self.port_file;
        }
        set(&mut config.mode, self.mode);
        if self.no_tuic {
            config.tuic = false;
        }
        if self.no_reality {
            config.reality = false;
        }
        if self.no_tunnel {
            config.tunnel.enabled = false;
        }
        if self.argo_token.is_some() {
            config.tunnel.token = self.argo_token;
        }
        if self.argo_domain.is_some() {
            config.tunnel.domain = self.argo_domain;
        }
        set(&mut config.tunnel.local_port, self.argo_port);
        if self.cert.is_some() {
            config.cert_path = self.cert;
        }
        if self.key.is_some() {
            config.key_path = self.key;
        }
        if self.public_host.is_some() {
            config.public_host = self.public_host;
        }
        set(&mut config.work_dir, self.work_dir);
        set(&mut config.singbox_bin, self.singbox_bin);
        set(&mut config.cloudflared_bin, self.cloudflared_bin);
        if self.label.is_some() {
            config.node_label = self.label;
        }
    }
}

#[tokio::main]
async fn main() {
    #[cfg(feature = "console")]
    console_subscriber::init();

    // ロギング設定
    #[cfg(not(feature = "console"))]
    {
        let is_atty = atty::is(atty::Stream::Stdout);
        let level = "info";
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::from(level)),
            )
            .with_ansi(is_atty)
            .init();
    }

    if let Err(e) = run_main().await {
        error!("{:#}", e);
        std::process::exit(subvisor::exit_code_of(&e));
    }
}

async fn run_main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    // Ctrl+C / SIGTERM ハンドラー
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    subvisor::run(config, shutdown_rx).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!("Failed to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c signal: {}", e);
        std::future::pending::<()>().await;
    }
}
