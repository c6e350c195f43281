use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use socksdns::acl::{AclMatcher, RuleAcl};
use socksdns::config::{load_config, load_hosts};
use socksdns::hosts::HostsFile;
use socksdns::resolver::SystemResolver;
use socksdns::{LocalDnsServer, watcher};

#[derive(Parser, Debug)]
#[command(author, version, about = "Local DNS forwarder racing on-device resolution against a SOCKS5-tunneled resolver", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/socksdns.json")]
    config: PathBuf,
    /// 覆盖配置中的监听地址
    #[arg(long = "listen")]
    listen: Option<SocketAddr>,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let mut server_cfg = cfg.to_server_config()?;
    if let Some(listen) = args.listen {
        server_cfg.listen = listen;
    }

    let hosts_path = cfg.hosts_path(&args.config);
    let hosts = match hosts_path.as_deref() {
        Some(path) => load_hosts(path).context("load hosts file")?,
        None => HostsFile::default(),
    };
    let hosts = Arc::new(ArcSwap::from_pointee(hosts));
    let acl = Arc::new(ArcSwap::from_pointee(
        RuleAcl::from_config(&cfg.acl).context("compile acl")?,
    ));

    watcher::spawn(args.config.clone(), hosts_path, hosts.clone(), acl.clone());

    let matcher: Arc<dyn AclMatcher> = acl;
    let server = match LocalDnsServer::start(
        server_cfg,
        Arc::new(SystemResolver),
        Some(matcher),
        hosts,
    )
    .await
    {
        Ok(server) => server,
        Err(err) if err.is_expected() => {
            warn!(error = %err, "dns server could not start");
            return Ok(());
        }
        Err(err) => return Err(err).context("start dns server"),
    };

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    server.close().await;
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
