//! Harbor CLI: pair with remote Docker daemons and reach their containers
//!
//! Commands:
//!   harbor identity  <host>                    show the local identity used for a host
//!   harbor pair      <host> [alias]            pair with a remote connector
//!   harbor bootstrap                           run and pair a connector on local Docker
//!   harbor status    <host>                    connection state of a paired daemon
//!   harbor ping      <host>                    round-trip a paired daemon
//!   harbor ps        <host>                    list containers on a paired daemon
//!   harbor tunnel    <host> <container> <port> forward a local port into a container
//!   harbor forget    <host>                    drop the pinned certificate

use harbor_core::engine::{Engine, EngineError};
use harbor_core::identity::short_fingerprint;
use harbor_core::{EngineConfig, RemoteHostDescriptor};
use std::env;
use std::path::Path;
use std::process;
use std::time::Instant;

const CONFIG_FILE: &str = "harbor.json";

fn print_usage() {
    println!(
        r#"
Harbor: paired, pinned-TLS control of remote Docker daemons

Usage: harbor <command> [options]

Commands:
  identity   <host>                       Show the local identity used for a host
  pair       <host> [alias]               Pair with a remote connector
  bootstrap                               Run and pair a connector on local Docker
  status     <host>                       Connection state of a paired daemon
  ping       <host>                       Round-trip a paired daemon
  ps         <host>                       List containers on a paired daemon
  tunnel     <host> <container> <port>    Forward a local port into a container
  forget     <host>                       Drop the pinned certificate for a host

Configuration is read from {config} when present and overridden by
HARBOR_DATA_DIR, HARBOR_CONTEXT and HARBOR_RESET_ON_FIRST_CONTACT.

Examples:
  harbor pair build-01.internal build
  harbor ps build-01.internal
  harbor tunnel build-01.internal postgres 5432
  harbor bootstrap
"#,
        config = CONFIG_FILE
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let command = args[1].as_str();
    if matches!(command, "help" | "--help" | "-h") {
        print_usage();
        return;
    }

    let engine = match load_engine() {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("  Error: {}", e);
            process::exit(1);
        }
    };

    let result = match command {
        "identity" => cmd_identity(&engine, &args[2..]).await,
        "pair" => cmd_pair(&engine, &args[2..]).await,
        "bootstrap" => cmd_bootstrap(&engine).await,
        "status" => cmd_status(&engine, &args[2..]).await,
        "ping" => cmd_ping(&engine, &args[2..]).await,
        "ps" => cmd_ps(&engine, &args[2..]).await,
        "tunnel" => cmd_tunnel(&engine, &args[2..]).await,
        "forget" => cmd_forget(&engine, &args[2..]).await,
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };

    engine.shutdown().await;
    if let Err(e) = result {
        eprintln!("  Error: {}", e);
        process::exit(1);
    }
}

fn load_engine() -> Result<Engine, EngineError> {
    let config = EngineConfig::resolve(Some(Path::new(CONFIG_FILE)))?;
    Engine::init(config)
}

/// First positional argument as a host, alias defaulting to the hostname
fn host_arg(args: &[String], usage: &str) -> Option<RemoteHostDescriptor> {
    let Some(hostname) = args.first() else {
        eprintln!("Usage: harbor {}", usage);
        return None;
    };
    Some(RemoteHostDescriptor::new(hostname.clone(), hostname.clone()))
}

async fn cmd_identity(engine: &Engine, args: &[String]) -> Result<(), EngineError> {
    let Some(host) = host_arg(args, "identity <host>") else {
        return Ok(());
    };
    let context = &engine.config().context;
    let identity = engine
        .keystore()
        .load_or_create_identity(context, &host.hostname)?;
    println!("\n  Instance:    {}", identity.instance_id());
    println!("  Certificate: {}", short_fingerprint(identity.certificate()));
    match engine.keystore().load_pinned_certificate(context, &host.hostname) {
        Ok(pinned) => println!("  Pinned peer: {}", short_fingerprint(&pinned)),
        Err(_) => println!("  Pinned peer: none (not paired)"),
    }
    Ok(())
}

async fn cmd_pair(engine: &Engine, args: &[String]) -> Result<(), EngineError> {
    let Some(mut host) = host_arg(args, "pair <host> [alias]") else {
        return Ok(());
    };
    if let Some(alias) = args.get(1) {
        host.alias = alias.clone();
    }
    let hostname = host.hostname.clone();

    let status = engine.begin_pairing(host).await?;
    println!("\n  Pairing with {} ({:?})", status.hostname, status.state);
    if status.container_likely_exists {
        println!("  A connector seems to be running there. Run on that host:\n");
        println!("    {}\n", status.exec_command);
    } else {
        println!("  No connector answered. Run on that host:\n");
        println!("    {}\n", status.run_command);
        println!("  or, if one is already running:\n");
        println!("    {}\n", status.exec_command);
    }
    println!(
        "  Waiting up to {}s...",
        engine.config().pairing_timeout().as_secs()
    );

    let handle = engine.complete_pairing(&hostname).await?;
    handle.ping().await?;
    println!("\n  Paired with {} ({})", handle.hostname(), handle.host().alias);
    if let Some(daemon) = handle.daemon_uuid() {
        println!("  Daemon:      {}", daemon);
    }
    Ok(())
}

async fn cmd_bootstrap(engine: &Engine) -> Result<(), EngineError> {
    println!("\n  Bootstrapping local connector...");
    let handle = engine.bootstrap_local().await?;
    handle.ping().await?;
    println!("  Paired with local daemon at {}", handle.hostname());
    Ok(())
}

async fn cmd_status(engine: &Engine, args: &[String]) -> Result<(), EngineError> {
    let Some(host) = host_arg(args, "status <host>") else {
        return Ok(());
    };
    let handle = engine.connect_daemon(host).await?;
    let connectivity = engine.daemon_connectivity(handle.id()).await?;
    println!("\n  Host:        {}", connectivity.hostname);
    println!("  Status:      {:?}", connectivity.status);
    println!("  Reachable:   {}", connectivity.reachable);
    if let Some(daemon) = handle.daemon_uuid() {
        println!("  Daemon:      {}", daemon);
    }
    Ok(())
}

async fn cmd_ping(engine: &Engine, args: &[String]) -> Result<(), EngineError> {
    let Some(host) = host_arg(args, "ping <host>") else {
        return Ok(());
    };
    let handle = engine.connect_daemon(host).await?;
    let started = Instant::now();
    handle.ping().await?;
    println!(
        "  {} answered in {:.1} ms",
        handle.hostname(),
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

async fn cmd_ps(engine: &Engine, args: &[String]) -> Result<(), EngineError> {
    let Some(host) = host_arg(args, "ps <host>") else {
        return Ok(());
    };
    let handle = engine.connect_daemon(host).await?;
    let containers = handle.list_containers().await?;
    if containers.is_empty() {
        println!("\n  No containers on {}", handle.hostname());
        return Ok(());
    }
    println!("\n  Containers on {} ({}):", handle.hostname(), containers.len());
    println!("  {}", "-".repeat(72));
    for c in containers {
        println!("  {:<14} {:<24} {:<24} {:?}", c.id, c.name, c.image, c.state);
    }
    Ok(())
}

async fn cmd_tunnel(engine: &Engine, args: &[String]) -> Result<(), EngineError> {
    if args.len() < 3 {
        eprintln!("Usage: harbor tunnel <host> <container> <port>");
        return Ok(());
    }
    let Ok(port) = args[2].parse::<u16>() else {
        eprintln!("  Port must be a number between 1 and 65535");
        return Ok(());
    };
    let Some(host) = host_arg(args, "tunnel <host> <container> <port>") else {
        return Ok(());
    };

    let handle = engine.connect_daemon(host).await?;
    engine.discover_containers(handle.id()).await?;
    let local = engine.open_tunnel(&args[1], port).await?;
    println!("\n  {}:{} is reachable at {}", args[1], port, local);
    println!("  Press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("  Cannot wait for Ctrl+C: {}", e);
    }
    Ok(())
}

async fn cmd_forget(engine: &Engine, args: &[String]) -> Result<(), EngineError> {
    let Some(host) = host_arg(args, "forget <host>") else {
        return Ok(());
    };
    let removed = engine
        .keystore()
        .forget_host(&engine.config().context, &host.hostname)?;
    if removed {
        println!("  Forgot {}; pair again to reconnect", host.hostname);
    } else {
        println!("  {} was not paired", host.hostname);
    }
    Ok(())
}
