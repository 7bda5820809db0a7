//! Topology Launch CLI
//!
//! Usage:
//!   topology_launch topology.yaml
//!   topology_launch topology.yaml -a DB_PASSWORD:=secret -s api
//!   topology_launch topology.yaml --dry-run --json

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use topology_launch::runtime::sanitize_project_name;
use topology_launch::{
    CliRuntime, ContainerRuntime, InterpolationContext, LaunchArgs, LaunchError, Launcher,
    LauncherConfig, ProcessRuntime, Topology,
};

#[tokio::main]
async fn main() {
    let args: LaunchArgs = argh::from_env();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    let env = env_logger::Env::default().default_filter_or(log_level);
    env_logger::init_from_env(env);

    log::info!("Loading topology: {}", args.topology_file);
    let ctx = InterpolationContext::new().with_vars(args.var_overrides());
    let topology = match Topology::from_file(&args.topology_file, &ctx) {
        Ok(t) => t,
        Err(e) => {
            log::error!("Failed to load topology: {}", e);
            std::process::exit(1);
        }
    };

    if args.validate {
        println!("Topology '{}' is valid", args.topology_file);
        println!("  Version: {}", topology.version);
        println!("  Services: {}", topology.services.len());
        println!("  Volumes: {}", topology.volumes.len());
        println!("  Shared variables: {}", topology.shared.environment.len());
        return;
    }

    let runtime: Arc<dyn ContainerRuntime> = match args.runtime.as_str() {
        "process" => Arc::new(ProcessRuntime::new()),
        engine => Arc::new(CliRuntime::new(engine)),
    };

    let mut config = LauncherConfig {
        network: args.network.clone(),
        services: args.service.clone(),
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        ..Default::default()
    };
    if let Some(name) = &args.project_name {
        config.project_name = sanitize_project_name(name);
    }

    let launcher = Launcher::new(runtime, config);

    if args.dry_run {
        let plan = match launcher.plan(&topology) {
            Ok(plan) => plan,
            Err(e) => {
                log::error!("Failed to generate launch plan: {}", e);
                std::process::exit(1);
            }
        };
        if args.json {
            match serde_json::to_string_pretty(&plan) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    log::error!("Failed to serialize launch plan: {}", e);
                    std::process::exit(1);
                }
            }
        } else {
            println!("{}", plan);
        }
        return;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    {
        let shutdown_tx = shutdown_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, initiating shutdown...");
            let _ = shutdown_tx.send(());
        }) {
            log::error!("Error setting Ctrl+C handler: {}", e);
            std::process::exit(1);
        }
    }

    let mut running = match launcher.start(&topology).await {
        Ok(running) => running,
        Err(LaunchError::Partial {
            failures,
            mut running,
        }) => {
            for failure in &failures {
                log::error!("{}", failure);
            }
            log::error!(
                "Launch failed; {} started services are left running until shutdown",
                running.started_count()
            );
            running.supervise(shutdown_rx).await;
            running.stop().await;
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("Launch failed: {}", e);
            std::process::exit(1);
        }
    };

    running.supervise(shutdown_rx).await;
    running.stop().await;

    for status in running.status() {
        log::info!(
            "  {}: {} (restarts: {})",
            status.name,
            status.state,
            status.restart_count
        );
    }

    log::info!("Topology launcher exiting");
}
