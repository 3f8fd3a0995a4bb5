// src/lib.rs

pub mod action;
pub mod actionrun;
pub mod cli;
pub mod command_context;
pub mod config;
pub mod engine;
pub mod errors;
pub mod eventloop;
pub mod fs;
pub mod job;
pub mod logging;
pub mod machine;
pub mod node;
pub mod observer;
pub mod recovery;
pub mod schedule;
pub mod serialize;
pub mod service;
pub mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::action::ActionRunner;
use crate::cli::CliArgs;
use crate::command_context::CommandContext;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::engine::{CoreRuntime, EngineEnv, Runtime, RuntimeEvent};
use crate::errors::TronError;
use crate::eventloop::TokioEventLoop;
use crate::fs::RealFileSystem;
use crate::node::{Node, NodePool, NodePoolStore, NodeTransport, ProcessTransport};
use crate::serialize::{JsonFileStateStore, MemoryStateStore, StateStore, StateWatcher};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - nodes, the event loop and the engine environment
/// - state restore and the state watcher
/// - the core runtime and its async shell
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    // Runtime event channel. Transports and timers hold senders.
    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(1024);

    let transport: Arc<dyn NodeTransport> = Arc::new(ProcessTransport::new(rt_tx.clone()));
    let node_pools = build_node_pools(&cfg, transport)?;
    let env = build_env(&cfg, node_pools, Arc::new(TokioEventLoop::new(rt_tx.clone())))?;

    let state_path = args.state.clone().or_else(|| cfg.config.state_path.clone());
    let store: Box<dyn StateStore> = match &state_path {
        Some(path) => Box::new(JsonFileStateStore::open(path, Arc::new(RealFileSystem))?),
        None => {
            info!("no state path configured; state is kept in memory only");
            Box::new(MemoryStateStore::new())
        }
    };
    let mut watcher = StateWatcher::new(store);
    watcher.check_version()?;

    let mut core = CoreRuntime::from_config(&cfg, env)?;
    let restored = watcher.restore(&core.job_names(), &core.service_names())?;
    watcher.watch(&core.env().notifications);
    core.initialize(restored);

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
        });
    }
    drop(rt_tx);

    let runtime = Runtime::new(core, rt_rx).with_watcher(watcher);
    runtime.run().await?;
    Ok(())
}

/// Register every `[node.*]` and `[node_pool.*]` entry, all sharing one
/// transport.
pub fn build_node_pools(
    cfg: &ConfigFile,
    transport: Arc<dyn NodeTransport>,
) -> errors::Result<NodePoolStore> {
    let mut store = NodePoolStore::new();
    for (name, node) in &cfg.node {
        store.add_node(Node::new(
            name.clone(),
            node.hostname.clone(),
            node.username.clone(),
            node.port,
            Arc::clone(&transport),
        ));
    }
    for (name, pool) in &cfg.node_pool {
        let nodes = pool
            .nodes
            .iter()
            .map(|node| {
                store.get_node(node).ok_or_else(|| {
                    TronError::ConfigError(format!("node pool '{name}' uses unknown node '{node}'"))
                })
            })
            .collect::<errors::Result<Vec<_>>>()?;
        store.add_pool(NodePool::new(name.clone(), nodes));
    }
    Ok(store)
}

/// Engine environment for a validated config.
pub fn build_env(
    cfg: &ConfigFile,
    node_pools: NodePoolStore,
    event_loop: Arc<dyn eventloop::EventLoop>,
) -> errors::Result<EngineEnv> {
    let hours = cfg.config.time_zone_offset_hours;
    let time_zone = FixedOffset::east_opt(hours * 3600).ok_or_else(|| {
        TronError::ConfigError(format!("time_zone_offset_hours {hours} is out of range"))
    })?;
    Ok(EngineEnv::new(event_loop, node_pools)
        .with_action_runner(ActionRunner::from_config(&cfg.config.action_runner))
        .with_time_zone(time_zone)
        .with_context(CommandContext::new(cfg.command_context.clone())))
}

fn print_dry_run(cfg: &ConfigFile) {
    println!("trond dry-run");
    if let Some(path) = &cfg.config.state_path {
        println!("  config.state_path = {}", path.display());
    }
    println!(
        "  config.action_runner = {:?}",
        cfg.config.action_runner.runner_type
    );
    println!(
        "  config.time_zone_offset_hours = {}",
        cfg.config.time_zone_offset_hours
    );
    println!();

    println!("nodes ({}):", cfg.node.len());
    for (name, node) in &cfg.node {
        println!("  - {name}: {}:{}", node.hostname, node.port);
    }
    for (name, pool) in &cfg.node_pool {
        println!("  - {name}: pool of {:?}", pool.nodes);
    }
    println!();

    println!("jobs ({}):", cfg.job.len());
    for (name, job) in &cfg.job {
        println!("  - {name}");
        println!("      node: {}", job.node);
        println!("      schedule: {}", job.schedule);
        if !job.enabled {
            println!("      enabled: false");
        }
        for (action_name, action) in &job.action {
            println!("      action {action_name}: {}", action.command);
            if !action.requires.is_empty() {
                println!("        requires: {:?}", action.requires);
            }
            if action.executor.is_task_backend() {
                println!("        executor: {}", action.executor);
            }
        }
        if let Some(cleanup) = &job.cleanup_action {
            println!("      cleanup: {}", cleanup.command);
        }
    }
    println!();

    println!("services ({}):", cfg.service.len());
    for (name, service) in &cfg.service {
        println!("  - {name} x{}", service.count);
        println!("      node: {}", service.node);
        println!("      command: {}", service.command);
        println!("      pid_file: {}", service.pid_file);
    }

    debug!("dry-run complete (no execution)");
}
