use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use tproxy_core::cgroup;
use tproxy_core::config;
use tproxy_core::daemon;
use tproxy_core::handler::HandlerManager;
use tproxy_core::runner::SystemProcessRunner;
use tproxy_core::scope::{Manager, ScopeId};

/// Transparent proxy daemon: routes cgroup-scoped traffic through upstream
/// HTTP/SOCKS proxies via Linux TPROXY, with fake-IP DNS hijacking.
#[derive(Parser, Debug)]
#[command(name = "tproxyd", version, about)]
struct Cli {
    /// Path to the AllProxies YAML or JSON configuration file.
    config: PathBuf,

    /// Base directory for the unified cgroup v2 hierarchy.
    #[arg(long, default_value = "/sys/fs/cgroup/unified")]
    cgroup_base: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => {
            log::info!("closing.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_text = fs::read_to_string(&cli.config)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", cli.config.display()))?;
    let parsed = config::from_str(&config_text)?;

    let cgroup_registry = cgroup::Registry::new(cli.cgroup_base.clone());
    let manager = Arc::new(Manager::new(cgroup_registry.clone()));
    let handlers = Arc::new(HandlerManager::new());
    let runner = SystemProcessRunner;

    for (scope, cfg) in &parsed.all_proxies {
        manager.register_scope(*scope, cfg.t_port, cfg.proxy_program.clone())?;
    }

    let mut scopes: Vec<ScopeId> = parsed.all_proxies.keys().copied().collect();
    scopes.sort();

    let mut active = Vec::new();
    let mut runtimes = Vec::new();
    for scope in &scopes {
        let cfg = &parsed.all_proxies[scope];
        let rt = daemon::start_scope(*scope, cfg, &manager, &cgroup_registry, &runner, &active, handlers.clone())
            .await
            .map_err(|e| anyhow::anyhow!("starting scope {scope}: {e}"))?;
        runtimes.push((*scope, rt));
        active.push(*scope);
        log::info!("scope {scope} running on tproxy port {}", cfg.t_port);
    }

    tokio::signal::ctrl_c().await.map_err(|e| anyhow::anyhow!("waiting for shutdown signal: {e}"))?;
    log::info!("shutdown requested, stopping scopes.");

    let mut stop_err = None;
    for (scope, rt) in runtimes.into_iter().rev() {
        if let Err(e) = daemon::stop_scope(scope, &manager, &cgroup_registry, &runner, rt).await {
            log::error!("stopping scope {scope}: {e}");
            stop_err.get_or_insert(e);
        }
    }
    handlers.close_all();

    if let Some(e) = stop_err {
        return Err(anyhow::anyhow!(e));
    }
    Ok(())
}
