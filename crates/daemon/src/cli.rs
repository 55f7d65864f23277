//! CLI subcommand implementations.
//!
//! Every command here talks to a running daemon over its IPC socket
//! through [`PoolClient`], except `start`/`stop`/`restart`, which
//! manage the daemon process itself. Commands return an error (and a
//! non-zero exit) when the operation fails; an unreachable daemon
//! prints explicit diagnostics naming the probed PID file, socket path
//! and process state.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use sockpool_common::EndpointKey;
use sockpool_config::{ClientConfig, Config};
use sockpool_ipc::protocol::{HealthReply, HealthStatus, MetricsReply, StatsReply};
use sockpool_ipc::{PoolClient, SendOptions};

use crate::{logging, pidfile, PoolService};

/// Environment marker set on the re-spawned background child.
const DAEMON_CHILD_ENV: &str = "SOCKPOOL_DAEMON_CHILD";

// ============================================================================
// Process management
// ============================================================================

pub async fn start(mut config: Config, daemon: bool, pid_file: Option<PathBuf>) -> Result<()> {
    if let Some(path) = pid_file {
        config.daemon.pid_file = path;
    }

    if let Some(pid) = pidfile::read(&config.daemon.pid_file) {
        if pidfile::process_alive(pid) {
            bail!(
                "Daemon already running (pid {pid}, PID file {})",
                config.daemon.pid_file.display()
            );
        }
    }

    let is_child = std::env::var_os(DAEMON_CHILD_ENV).is_some();
    if daemon && !is_child {
        return respawn_detached();
    }
    if is_child {
        // Detach from the controlling terminal.
        unsafe {
            libc::setsid();
        }
    }

    logging::init(&config.logging).context("Failed to initialize logging")?;
    config.validate().context("Invalid configuration")?;
    PoolService::new(config)
        .run()
        .await
        .context("Daemon exited with an error")?;
    Ok(())
}

fn respawn_detached() -> Result<()> {
    let exe = std::env::current_exe().context("Cannot locate own executable")?;
    let args: Vec<std::ffi::OsString> = std::env::args_os()
        .skip(1)
        .filter(|arg| arg != "--daemon")
        .collect();
    let child = Command::new(exe)
        .args(args)
        .env(DAEMON_CHILD_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to spawn background daemon")?;
    println!("sockpool daemon started (pid {})", child.id());
    Ok(())
}

pub async fn stop(
    config: &Config,
    pid_file: Option<PathBuf>,
    force: bool,
    timeout_s: u64,
) -> Result<()> {
    let path = pid_file.unwrap_or_else(|| config.daemon.pid_file.clone());
    let Some(pid) = pidfile::read(&path) else {
        bail!(
            "No PID file at {} — is the daemon running?",
            path.display()
        );
    };
    if !pidfile::process_alive(pid) {
        pidfile::remove(&path);
        bail!("Stale PID file removed: process {pid} is not running");
    }

    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let deadline = Instant::now() + Duration::from_secs(timeout_s);
    while Instant::now() < deadline {
        if !pidfile::process_alive(pid) {
            pidfile::remove(&path);
            println!("Stopped sockpool daemon (pid {pid})");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if force {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        pidfile::remove(&path);
        println!("Killed sockpool daemon (pid {pid})");
        Ok(())
    } else {
        bail!("Daemon (pid {pid}) did not exit within {timeout_s}s; retry with --force")
    }
}

pub async fn restart(config: Config, pid_file: Option<PathBuf>, daemon: bool) -> Result<()> {
    if let Err(e) = stop(&config, pid_file.clone(), false, 10).await {
        // A daemon that was not running is fine for restart.
        eprintln!("note: {e}");
    }
    start(config, daemon, pid_file).await
}

// ============================================================================
// Introspection
// ============================================================================

/// Client tuned for CLI use: one attempt, short timeout, no breaker.
fn cli_client(config: &Config) -> PoolClient {
    let client_config = ClientConfig {
        socket_path: config.client.socket_path.clone(),
        timeout: Duration::from_secs(2),
        retry_attempts: 1,
        circuit_breaker_enabled: false,
        ..config.client.clone()
    };
    PoolClient::new(client_config)
}

/// Explain exactly what was probed when the daemon is unreachable.
fn unreachable_diagnostics(config: &Config, error: &str) -> anyhow::Error {
    let socket = &config.daemon.socket_path;
    let pid_file = &config.daemon.pid_file;
    let mut lines = vec![
        "Daemon unreachable.".to_string(),
        format!("  IPC socket {}: {}", socket.display(), if socket.exists() { "present" } else { "missing" }),
    ];
    match pidfile::read(pid_file) {
        Some(pid) => lines.push(format!(
            "  PID file {}: pid {pid} ({})",
            pid_file.display(),
            if pidfile::process_alive(pid) {
                "process running"
            } else {
                "process not running"
            }
        )),
        None => lines.push(format!("  PID file {}: missing", pid_file.display())),
    }
    lines.push(format!("  Last error: {error}"));
    anyhow::anyhow!(lines.join("\n"))
}

pub async fn status(config: &Config, detailed: bool) -> Result<()> {
    let client = cli_client(config);
    let response = match client.health_check().await {
        Ok(response) if response.success => response,
        Ok(response) => {
            return Err(unreachable_diagnostics(
                config,
                response.error.as_deref().unwrap_or("daemon reported failure"),
            ))
        }
        Err(error) => return Err(unreachable_diagnostics(config, &error.to_string())),
    };

    let health: HealthReply = response.decode()?;
    println!("sockpool daemon: {}", health.status);
    println!("  instance:           {}", health.instance_id);
    println!("  pooled connections: {}", health.checks.active_connections);

    if detailed {
        let stats: StatsReply = client.get_stats().await?.decode()?;
        let metrics: MetricsReply = client.get_metrics().await?.decode()?;
        println!("  pool:               {}/{}", stats.pool_size, stats.max_pool_size);
        println!("  uptime:             {}s", metrics.uptime_s);
        println!("  memory:             {} bytes (peak {})", metrics.memory_usage, metrics.peak_memory);
    }

    if health.status == HealthStatus::Unhealthy {
        bail!("Daemon reported unhealthy");
    }
    Ok(())
}

pub async fn stats(config: &Config, watch: Option<u64>, json: bool) -> Result<()> {
    let client = cli_client(config);
    loop {
        let response = client
            .get_stats()
            .await
            .map_err(|e| unreachable_diagnostics(config, &e.to_string()))?;
        let reply: StatsReply = response.decode()?;

        if json {
            println!("{}", serde_json::to_string_pretty(&reply)?);
        } else {
            print_stats_table(&reply);
        }

        match watch {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds.max(1))).await,
            None => return Ok(()),
        }
    }
}

fn print_stats_table(reply: &StatsReply) {
    println!(
        "Pool {}/{}  instance {}",
        reply.pool_size, reply.max_pool_size, reply.instance_id
    );
    println!("{:<28} {:>10} {:>10} {:>10}", "ENDPOINT", "SUCCESS", "FAILED", "TOTAL");
    for (endpoint, stats) in &reply.connection_stats {
        let active = if reply.active_connections.contains(endpoint) {
            "*"
        } else {
            " "
        };
        println!(
            "{active}{:<27} {:>10} {:>10} {:>10}",
            endpoint, stats.success, stats.failed, stats.total
        );
    }
    if reply.connection_stats.is_empty() {
        println!("(no traffic yet)");
    }
}

pub async fn health(config: &Config, detailed: bool) -> Result<()> {
    let client = cli_client(config);
    let response = client
        .health_check()
        .await
        .map_err(|e| unreachable_diagnostics(config, &e.to_string()))?;
    let reply: HealthReply = response.decode()?;

    println!("{}", reply.status);
    if detailed {
        println!("  instance:       {}", reply.instance_id);
        println!("  ipc_socket:     {}", reply.checks.ipc_socket);
        match reply.checks.external_cache {
            Some(ok) => println!("  external_cache: {ok}"),
            None => println!("  external_cache: disabled"),
        }
        println!("  connections:    {}", reply.checks.active_connections);
    }
    if reply.status == HealthStatus::Unhealthy {
        bail!("Daemon reported unhealthy");
    }
    Ok(())
}

// ============================================================================
// Pool management
// ============================================================================

pub async fn pool_list(config: &Config) -> Result<()> {
    let client = cli_client(config);
    let reply: StatsReply = client
        .get_stats()
        .await
        .map_err(|e| unreachable_diagnostics(config, &e.to_string()))?
        .decode()?;
    if reply.active_connections.is_empty() {
        println!("(pool is empty)");
    }
    for endpoint in &reply.active_connections {
        println!("{endpoint}");
    }
    Ok(())
}

pub async fn pool_close(config: &Config, target: Option<String>, all: bool) -> Result<()> {
    let client = cli_client(config);
    let targets: Vec<EndpointKey> = if all {
        let reply: StatsReply = client
            .get_stats()
            .await
            .map_err(|e| unreachable_diagnostics(config, &e.to_string()))?
            .decode()?;
        reply
            .active_connections
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    } else {
        let target = target.context("Specify an endpoint (host:port) or --all")?;
        vec![target
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid endpoint {target:?}: {e}"))?]
    };

    for key in targets {
        let response = client.close_connection(&key.host, key.port).await?;
        let closed = response.payload["closed"].as_bool().unwrap_or(false);
        println!(
            "{key}: {}",
            if closed { "closed" } else { "was not pooled" }
        );
    }
    Ok(())
}

pub async fn pool_warm_up(config: &Config, targets: Vec<String>) -> Result<()> {
    if targets.is_empty() {
        bail!("Specify one or more endpoints (host:port) to warm up");
    }
    let mut keys = Vec::with_capacity(targets.len());
    for target in &targets {
        keys.push(
            target
                .parse::<EndpointKey>()
                .map_err(|e| anyhow::anyhow!("Invalid endpoint {target:?}: {e}"))?,
        );
    }

    let client = cli_client(config);
    let mut failures = 0;
    for (key, ok) in client.warm_up(&keys).await {
        println!("{key}: {}", if ok { "warmed" } else { "failed" });
        if !ok {
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{failures} endpoint(s) failed to warm up");
    }
    Ok(())
}

// ============================================================================
// Testing and monitoring
// ============================================================================

pub async fn test(config: &Config, host: &str, port: u16, count: u32) -> Result<()> {
    let client = cli_client(config);
    let mut failures = 0;
    for i in 1..=count.max(1) {
        let started = Instant::now();
        match client
            .send_gps(host, port, "TEST", "cli-test", SendOptions::default())
            .await
        {
            Ok(response) if response.success => {
                println!(
                    "[{i}] ok in {:.1} ms",
                    started.elapsed().as_secs_f64() * 1000.0
                );
            }
            Ok(response) => {
                failures += 1;
                println!(
                    "[{i}] failed: {}",
                    response.error.as_deref().unwrap_or("unknown error")
                );
            }
            Err(error) => {
                failures += 1;
                println!("[{i}] failed: {error}");
            }
        }
    }
    if failures > 0 {
        bail!("{failures}/{count} test frames failed");
    }
    Ok(())
}

pub async fn monitor(config: &Config, interval_s: u64) -> Result<()> {
    let client = cli_client(config);
    println!("Monitoring (Ctrl-C to stop)");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_secs(interval_s.max(1))) => {
                match fetch_monitor_line(&client).await {
                    Ok(line) => println!("{line}"),
                    Err(error) => println!("daemon unreachable: {error}"),
                }
            }
        }
    }
}

async fn fetch_monitor_line(client: &PoolClient) -> Result<String> {
    let metrics: MetricsReply = client.get_metrics().await?.decode()?;
    let stats: StatsReply = client.get_stats().await?.decode()?;
    let (success, failed): (u64, u64) = stats
        .connection_stats
        .values()
        .fold((0, 0), |(s, f), e| (s + e.success, f + e.failed));
    Ok(format!(
        "pool {}/{}  ok {}  failed {}  uptime {}s  rss {} B",
        metrics.pool_size, metrics.max_pool_size, success, failed, metrics.uptime_s, metrics.memory_usage
    ))
}

// ============================================================================
// Configuration
// ============================================================================

pub async fn config_show(config: &Config) -> Result<()> {
    // Prefer the running daemon's view; fall back to the local
    // environment-derived configuration.
    let client = cli_client(config);
    match client.get_config().await {
        Ok(response) if response.success => {
            println!("{}", serde_json::to_string_pretty(&response.payload)?);
        }
        _ => {
            println!("(daemon unreachable; showing local configuration)");
            println!("{}", serde_json::to_string_pretty(&config.to_redacted_json())?);
        }
    }
    Ok(())
}

pub async fn config_get(config: &Config, key: &str) -> Result<()> {
    let dump = config.to_redacted_json();
    let mut cursor = &dump;
    for part in key.split('.') {
        cursor = cursor
            .get(part)
            .with_context(|| format!("Unknown configuration key: {key}"))?;
    }
    println!("{cursor}");
    Ok(())
}

pub fn config_set(key: &str, _value: &str) -> Result<()> {
    bail!(
        "Configuration is environment-driven; set the matching SOCKET_POOL_* \
         variable for {key:?} in the daemon's environment and restart"
    )
}

pub fn config_validate(config: &Config) -> Result<()> {
    config.validate().context("Configuration is invalid")?;
    println!("Configuration OK");
    Ok(())
}
