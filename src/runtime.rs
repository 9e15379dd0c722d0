use anyhow::{anyhow, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::credentials::{load_or_create_uuid, load_or_generate_reality, Credentials};
use crate::discovery;
use crate::error::Error;
use crate::planner::{log_plan, plan, Plan, PlanOptions};
use crate::port_resolver::PortResolver;
use crate::protocol::{prepare_launch, InboundContext, Protocol};
use crate::server::run_server;
use crate::state::{ProcessStatus, SharedState, Snapshot};
use crate::subscription::{Assembler, NodeInfo, Publisher, SubscriptionDescriptor};
use crate::supervisor::Supervisor;
use crate::tunnel::{start_tunnel, Tunnel, TunnelCommand, TunnelIdentity};

/// 起動済みのサービス一式
struct Services {
    stop_tx: broadcast::Sender<()>,
    supervisor: Supervisor,
    tunnel: Option<Tunnel>,
    server: JoinHandle<Result<()>>,
    follower: Option<JoinHandle<Result<()>>>,
}

impl Services {
    /// 全サービスを停止する
    /// トンネルが最終的に失敗していればそのエラーを返す
    async fn stop(self) -> Option<Error> {
        let _ = self.stop_tx.send(());
        self.supervisor.shutdown().await;

        let tunnel_err = match self.tunnel {
            Some(tunnel) => tunnel.shutdown().await.err(),
            None => None,
        };

        match self.server.await {
            Ok(Err(e)) => warn!("Subscription endpoint stopped with error: {:#}", e),
            Err(e) => error!("Subscription endpoint task panicked: {}", e),
            Ok(Ok(())) => {}
        }
        if let Some(follower) = self.follower {
            match follower.await {
                Ok(Err(e)) => warn!("Subscription updates stopped with error: {:#}", e),
                Err(e) => error!("Subscription task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        tunnel_err
    }
}

/// 設定に従って全コンポーネントを起動し、停止要求まで動かす
pub async fn run(config: Config, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    config.validate()?;

    let work_dir = config.work_dir.clone();
    std::fs::create_dir_all(&work_dir).map_err(|source| Error::Io {
        context: "Failed to create work directory",
        path: work_dir.clone(),
        source,
    })?;

    let credentials = prepare_credentials(&config).await?;

    let resolver = PortResolver::new(config.ports.clone(), config.port_file.as_deref());
    let ports = resolver.resolve(config.mode.wanted_ports())?;

    let identity = config.tunnel_identity();
    let policy = config.mux_policy();
    let options = PlanOptions {
        mode: config.mode,
        tuic: config.tuic,
        reality: config.reality && credentials.reality.is_some(),
        argo_port: identity.as_ref().map(|_| config.tunnel.local_port),
    };
    let plan = plan(&ports, &options, &policy);
    plan.validate(&policy)?;
    log_plan(&plan);

    // トンネルの転送先が割り当てられなかった場合はトンネルを動かさない
    let identity = identity.filter(|_| plan.port_of(Protocol::ArgoWs).is_some());
    let state = SharedState::new(plan.protocols(), identity.as_ref().map(TunnelIdentity::mode));

    let ctx = InboundContext {
        credentials: credentials.clone(),
        cert_path: config.cert_path(),
        key_path: config.key_path(),
        tls_sni: config.tls_sni.clone(),
        reality_sni: config.reality_sni.clone(),
    };
    if !ctx.cert_path.exists() || !ctx.key_path.exists() {
        warn!(
            "TLS certificate {} or key {} not found; TLS inbounds will fail to start",
            ctx.cert_path.display(),
            ctx.key_path.display()
        );
    }

    let (stop_tx, _) = broadcast::channel(1);
    let publisher = Publisher::new(&work_dir);

    let mut supervisor = Supervisor::new(state.clone(), config.restart_policy());
    for assignment in &plan.assignments {
        let protocol = assignment.protocol;
        if !protocol.is_external() {
            continue;
        }
        match prepare_launch(protocol, assignment.port.port, &ctx, &config.singbox_bin, &work_dir) {
            Ok(spec) => supervisor.launch(spec),
            Err(e) => {
                error!("Cannot launch {}: {:#}", protocol, e);
                state.update_process(protocol, |p| {
                    p.status = ProcessStatus::Failed;
                    p.last_exit = Some(format!("{:#}", e));
                });
            }
        }
    }

    let http_port = plan
        .port_of(Protocol::HttpSub)
        .ok_or_else(|| anyhow!("No port assigned to the subscription endpoint"))?;
    let server = tokio::spawn(run_server(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, http_port)),
        credentials.uuid.clone(),
        publisher.clone(),
        state.clone(),
        stop_tx.subscribe(),
    ));

    let tunnel = match (&identity, plan.port_of(Protocol::ArgoWs)) {
        (Some(identity), Some(local_port)) => {
            let command = TunnelCommand::cloudflared(&config.cloudflared_bin, identity, local_port);
            Some(start_tunnel(
                command,
                identity.clone(),
                config.tunnel_settings(),
                state.clone(),
            ))
        }
        _ => None,
    };

    let mut services = Services {
        stop_tx,
        supervisor,
        tunnel,
        server,
        follower: None,
    };

    let public_host = match &config.public_host {
        Some(host) => host.clone(),
        None => discovery::public_host(&config.lookup.ip_urls, config.lookup_timeout()).await,
    };
    let label = match &config.node_label {
        Some(label) => label.clone(),
        None => discovery::node_label(&config.lookup.meta_url, config.lookup_timeout()).await,
    };
    let cf_domain = if identity.is_some() {
        discovery::select_cf_domain(&config.tunnel.cf_domains, config.tunnel_settings().reach_timeout)
            .await
    } else {
        String::new()
    };

    let node = NodeInfo {
        public_host: public_host.clone(),
        credentials,
        tls_sni: config.tls_sni.clone(),
        reality_sni: config.reality_sni.clone(),
        cf_domain,
        label,
    };
    let assembler = Assembler::new(
        state.clone(),
        plan.clone(),
        node,
        publisher,
        config.settle_timeout(),
    );

    let snapshot = tokio::select! {
        snapshot = assembler.settle() => snapshot,
        _ = shutdown_rx.recv() => {
            info!("Shutdown requested during startup");
            services.stop().await;
            return Ok(());
        }
    };

    let descriptor = match assembler.publish(&snapshot).await {
        Ok(descriptor) => descriptor,
        Err(e) => {
            services.stop().await;
            return Err(e);
        }
    };

    if usable_endpoints(&snapshot) == 0 {
        let tunnel_err = services.stop().await;
        let err = fatal_error(&plan, &snapshot, tunnel_err);
        error!("No endpoint could be brought up: {}", err);
        return Err(err.into());
    }

    print_summary(&plan, &descriptor, &public_host, &work_dir);

    services.follower = Some(tokio::spawn(assembler.follow(services.stop_tx.subscribe())));

    let _ = shutdown_rx.recv().await;
    info!("Shutting down...");
    if let Some(err) = services.stop().await {
        warn!("{}", err);
    }
    Ok(())
}

/// UUID と REALITY 鍵を用意する
async fn prepare_credentials(config: &Config) -> Result<Credentials> {
    let uuid = load_or_create_uuid(&config.work_dir)?;
    let reality = if config.reality {
        let keys = load_or_generate_reality(&config.work_dir, &config.singbox_bin).await;
        if keys.is_none() {
            warn!("REALITY key pair unavailable, REALITY disabled");
        }
        keys
    } else {
        None
    };
    let tuic_password = config.tuic_password.clone().unwrap_or_else(|| uuid.clone());
    Ok(Credentials {
        uuid,
        tuic_password,
        reality,
    })
}

/// クライアントが実際に使える接続先の数（購読エンドポイント自体は数えない）
fn usable_endpoints(snapshot: &Snapshot) -> usize {
    snapshot
        .live_protocols()
        .into_iter()
        .filter(|p| p.is_external())
        .filter(|p| *p != Protocol::ArgoWs || snapshot.tunnel_hostname().is_some())
        .count()
}

/// 何も起動できなかったときの原因（トンネル → ポート不足 → プロセス異常の順）
/// ポート不足は外部プロセスを1つも割り当てられなかったときだけ原因とみなす
fn fatal_error(plan: &Plan, snapshot: &Snapshot, tunnel_err: Option<Error>) -> Error {
    if let Some(err) = tunnel_err {
        return err;
    }
    if !plan.protocols().any(Protocol::is_external) {
        if let Some(err) = plan.insufficient() {
            return err;
        }
    }
    let crashed = snapshot
        .processes
        .values()
        .filter(|p| p.protocol.is_external())
        .find(|p| p.status == ProcessStatus::Failed);
    match crashed {
        Some(p) => Error::ProcessCrashLoop {
            protocol: p.protocol,
            attempts: p.restarts + 1,
            last_exit: p.last_exit.clone().unwrap_or_else(|| "unknown".to_string()),
        },
        None => Error::AssemblyTimeout {
            pending: snapshot.pending_protocols(),
        },
    }
}

fn print_summary(plan: &Plan, descriptor: &SubscriptionDescriptor, public_host: &str, work_dir: &Path) {
    println!("==================================================");
    println!("Mode: {}", plan.mode);
    for uri in &descriptor.uris {
        println!("{}", uri);
    }
    if let Some(host) = &descriptor.tunnel_host {
        println!("Tunnel: {}", host);
    }
    if let Some(port) = plan.port_of(Protocol::HttpSub) {
        println!("Subscription: http://{}:{}/sub", public_host, port);
    }
    println!("Files: {}", work_dir.join("sub.txt").display());
    println!("==================================================");
}
