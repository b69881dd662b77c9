//! Wiring entrypoint: resolves config, builds the Router table, spawns one
//! task per service plus the admin server and the config reload loop, and
//! waits for a shutdown signal.
//!
//! Shutdown is a `JoinSet` + `tokio::select!` pattern with a bounded drain
//! timeout; reload polls `file_sig` (mtime + length) on an interval and
//! swaps a fresh Router snapshot in without touching listener topology.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinSet;

use crate::relayd::bypass::Bypass;
use crate::relayd::chain::{Chain, Hop, Node, Transport};
use crate::relayd::config::{self, ChainConfig, Config, HopConfig, NodeConfig, Protocol, ServiceConfig};
use crate::relayd::connector::{Auth, HttpConnectorOptions};
use crate::relayd::dialer::NetDialerOptions;
use crate::relayd::handler_tcp::{TcpHandler, TcpHandlerOptions};
use crate::relayd::handler_udp::{self, TproxyUdpListener, UdpHandlerOptions};
use crate::relayd::registry;
use crate::relayd::router::{Router, RouterOptions, RouterTable};
use crate::relayd::selector::SelectorOptions;
use crate::relayd::{admin, logging, net, runtime_paths, telemetry};

pub async fn run(config_path: Option<PathBuf>, workdir: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let _workdir = runtime_paths::resolve_workdir(workdir)?;

    let created = config::ensure_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    if cfg.services.is_empty() {
        anyhow::bail!("config: nothing to run (no [[services]] configured)");
    }

    tracing::info!(
        config = %resolved.path.display(),
        services = cfg.services.len(),
        chains = cfg.chains.len(),
        admin_enabled = cfg.admin.enabled,
        "relayd: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let conns = Arc::new(telemetry::ConnRegistry::new());

    let routers = build_routers(&cfg)?;
    let router_table = Arc::new(RouterTable::new(routers));

    let (reload_tx, reload_rx) = tokio::sync::watch::channel(telemetry::ReloadSignal::default());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    {
        let config_path = resolved.path.clone();
        let router_table = router_table.clone();
        let mut reload_rx = reload_rx.clone();
        let mut shutdown = shutdown_rx.clone();
        let mut enabled = cfg.reload.enabled;
        let mut poll = cfg.reload.poll_interval;

        tasks.spawn(async move {
            reload_loop(config_path, router_table, &mut reload_rx, &mut shutdown, &mut enabled, &mut poll).await;
            Ok(())
        });
    }

    if cfg.admin.enabled {
        let admin_addr = net::normalize_bind_addr(&cfg.admin.listen_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin listen_addr: {}", cfg.admin.listen_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            conns: conns.clone(),
            config_path: resolved.path.clone(),
            reload_tx: reload_tx.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, wait_for_true(shutdown)).await });
    }

    for svc in cfg.services.clone() {
        let router_table = router_table.clone();
        let conns = conns.clone();
        let shutdown = shutdown_rx.clone();

        match svc.protocol {
            Protocol::Tcp => {
                tasks.spawn(async move { serve_tcp_service(svc, router_table, conns, shutdown).await });
            }
            Protocol::Udp => {
                tasks.spawn(async move { serve_udp_service(svc, router_table, conns, shutdown).await });
            }
        }
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    let drain = async {
        while (tasks.join_next().await).is_some() {}
    };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

/// Waits for `rx` to observe `true`, then returns. Used to turn the
/// process-wide shutdown watch channel into the future `axum::serve`'s
/// `with_graceful_shutdown` expects.
async fn wait_for_true(mut rx: tokio::sync::watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn serve_tcp_service(
    svc: ServiceConfig,
    router_table: Arc<RouterTable>,
    conns: telemetry::SharedConns,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(&svc.listen_addr);
    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("service {:?}: invalid listen_addr {:?}", svc.name, svc.listen_addr))?;

    let std_listener = net::bind_tcp_listener(addr, svc.tproxy, svc.so_mark)
        .with_context(|| format!("service {:?}: bind {addr}", svc.name))?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;

    tracing::info!(service = %svc.name, listen_addr = %addr, tproxy = svc.tproxy, "tcp: listening");

    let opts = TcpHandlerOptions {
        tproxy: svc.tproxy,
        sniffing: svc.sniffing,
        sniffing_timeout: svc.sniffing_timeout,
        idle_timeout: svc.idle_timeout,
        rate_limit_per_sec: svc.rate_limit,
    };
    let handler = Arc::new(TcpHandler::new(router_table, svc.name.clone(), opts, conns));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (conn, peer) = accepted.context("tcp: accept failed")?;
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(err) = handler.handle(conn, peer).await {
                        tracing::debug!(%peer, error = %err, "tcp: connection ended with error");
                    }
                });
            }
        }
    }
}

async fn serve_udp_service(
    svc: ServiceConfig,
    router_table: Arc<RouterTable>,
    conns: telemetry::SharedConns,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TproxyUdpListener::bind(&svc.listen_addr)
        .await
        .with_context(|| format!("service {:?}: bind udp {}", svc.name, svc.listen_addr))?;

    tracing::info!(service = %svc.name, listen_addr = %svc.listen_addr, "udp: listening");

    let opts = UdpHandlerOptions { ttl: svc.ttl, read_buffer_size: svc.read_buffer_size };
    handler_udp::serve(listener, router_table, svc.name.clone(), opts, conns, shutdown).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn reload_loop(
    config_path: PathBuf,
    router_table: Arc<RouterTable>,
    reload_rx: &mut tokio::sync::watch::Receiver<telemetry::ReloadSignal>,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
    enabled: &mut bool,
    poll_interval: &mut Duration,
) {
    let mut last_sig = file_sig(&config_path).ok();

    loop {
        let sleep_dur = if *enabled { (*poll_interval).max(Duration::from_millis(200)) } else { Duration::from_secs(3600) };

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = reload_rx.changed() => {
                apply_reload(&config_path, &router_table, enabled, poll_interval).await;
                last_sig = file_sig(&config_path).ok();
            }
            _ = tokio::time::sleep(sleep_dur) => {
                if !*enabled {
                    continue;
                }
                let sig = match file_sig(&config_path) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                if last_sig.is_some_and(|prev| prev == sig) {
                    continue;
                }
                apply_reload(&config_path, &router_table, enabled, poll_interval).await;
                last_sig = Some(sig);
            }
        }
    }
}

/// Rebuilds the Router snapshot from the file on disk and swaps it in; new
/// connections pick up the fresh snapshot at accept time. Service/listener
/// topology changes are not applied: adding, removing, or re-binding a
/// listener still requires a restart.
async fn apply_reload(
    config_path: &Path,
    router_table: &Arc<RouterTable>,
    enabled: &mut bool,
    poll_interval: &mut Duration,
) {
    let cfg = match config::load_config(config_path) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "reload: config load failed");
            return;
        }
    };

    match build_routers(&cfg) {
        Ok(routers) => router_table.swap(routers),
        Err(err) => {
            tracing::warn!(error = %err, "reload: rebuild routers failed");
            return;
        }
    }

    *enabled = cfg.reload.enabled;
    *poll_interval = cfg.reload.poll_interval;
    tracing::info!("reload: applied");
}

fn file_sig(path: &Path) -> anyhow::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let len = meta.len();
    let m = meta.modified()?.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    Ok((m, len))
}

/// Builds one `Router` per configured service, wiring in its named Chain
/// (if any; Bypass is carried per-Hop rather than per-Chain), its resolver,
/// and its host mapper.
fn build_routers(cfg: &Config) -> anyhow::Result<HashMap<String, Arc<Router>>> {
    let chains_by_name: HashMap<&str, &ChainConfig> =
        cfg.chains.iter().map(|c| (c.name.as_str(), c)).collect();

    let host_mapper = if cfg.hosts.is_empty() {
        None
    } else {
        Some(registry::static_host_mapper(cfg.hosts.clone()))
    };

    let mut out = HashMap::with_capacity(cfg.services.len());
    for svc in &cfg.services {
        let mut router = Router::new(RouterOptions {
            retries: svc.retries,
            dialer: NetDialerOptions {
                interface: svc.interface.clone(),
                mark: svc.so_mark,
                timeout: svc.dial_timeout,
            },
        });

        if let Some(chain_name) = &svc.chain {
            let chain_cfg = chains_by_name
                .get(chain_name.as_str())
                .with_context(|| format!("service {:?}: unknown chain {:?}", svc.name, chain_name))?;
            let chain = build_chain(chain_cfg, cfg)
                .with_context(|| format!("service {:?}: build chain {:?}", svc.name, chain_name))?;
            router = router.with_chain(Arc::new(chain));
        }

        let resolver_name = svc.resolver.as_deref().unwrap_or("system");
        router = router.with_resolver(registry::resolver_by_name(resolver_name)?);

        if let Some(mapper) = &host_mapper {
            router = router.with_host_mapper(mapper.clone());
        }

        out.insert(svc.name.clone(), Arc::new(router));
    }

    Ok(out)
}

fn build_chain(chain_cfg: &ChainConfig, cfg: &Config) -> anyhow::Result<Chain> {
    let mut hops = Vec::with_capacity(chain_cfg.hops.len());
    for hop_cfg in &chain_cfg.hops {
        hops.push(build_hop(hop_cfg, cfg)?);
    }
    Ok(Chain::new(hops))
}

fn build_hop(hop_cfg: &HopConfig, cfg: &Config) -> anyhow::Result<Hop> {
    let selector_opts = SelectorOptions {
        strategy: registry::selector_strategy_by_name(&hop_cfg.selector.strategy),
        max_fails: hop_cfg.selector.max_fails,
        fail_timeout: hop_cfg.selector.fail_timeout,
    };

    let mut nodes = Vec::with_capacity(hop_cfg.nodes.len());
    for node_cfg in &hop_cfg.nodes {
        nodes.push(Arc::new(build_node(node_cfg)?));
    }

    let mut hop = Hop::new(nodes, selector_opts);
    if let Some(bypass_name) = &hop_cfg.bypass {
        let def = cfg
            .bypasses
            .get(bypass_name)
            .with_context(|| format!("hop {:?}: unknown bypass {:?}", hop_cfg.name, bypass_name))?;
        let bypass: Arc<dyn Bypass> = registry::bypass_by_name(&def.mode, def.patterns.clone());
        hop = hop.with_bypass(bypass);
    }
    Ok(hop)
}

fn build_node(node_cfg: &NodeConfig) -> anyhow::Result<Node> {
    let connector_opts = HttpConnectorOptions {
        connect_timeout: node_cfg.connect_timeout,
        headers: Vec::new(),
        plain_http_passthrough: false,
    };
    let connector = registry::connector_by_name(&node_cfg.connector, connector_opts)?;

    let dialer_opts = NetDialerOptions {
        interface: node_cfg.interface.clone(),
        mark: node_cfg.so_mark,
        timeout: node_cfg.connect_timeout,
    };

    let transport = Transport { dialer_opts, connector, route: None };
    let mut node = Node::new(node_cfg.name.clone(), node_cfg.addr.clone(), transport);
    node.is_backup = node_cfg.is_backup;
    node.host = node_cfg.host.clone().unwrap_or_default();
    node.auth = node_cfg
        .auth
        .as_ref()
        .map(|a| Auth { username: a.username.clone(), password: a.password.clone() });
    Ok(node)
}
