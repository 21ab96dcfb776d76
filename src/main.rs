//! # RPC Proxy Daemon - Main Entry Point
//!
//! The binary is a minimal embedding of the proxy library: it wires up
//! logging the way an operator expects, builds a self-contained two-node
//! deployment (two proxy engines joined by an in-memory link, each with a
//! loopback fabric), and runs both event loops on one cooperative
//! current-thread runtime.
//!
//! The built-in deployment exports a single `demo.echo` service from the
//! `beta` node to the `alpha` node and plays one round trip through it at
//! startup, which makes the binary useful as a smoke test and as a
//! reference for real embeddings: replace the static tables, the fabric,
//! and the transports with your own and the rest of `main` stays.
//!
//! ## Concurrency Model
//!
//! Everything runs on a current-thread Tokio runtime inside a `LocalSet`:
//! the proxy is single-threaded cooperative by design, and the only
//! suspension points are transport readiness, fabric readiness, and
//! timers.

use anyhow::Result;
use clap::Parser;
use rpc_proxy::cli::Args;
use rpc_proxy::config::{
    ExportedServer, LinkTransport, ProxyConfig, RequiredClient, ServiceBinding, SystemLink,
};
use rpc_proxy::fabric::loopback::LoopbackFabric;
use rpc_proxy::fabric::LocalMessage;
use rpc_proxy::transport::MemoryTransport;
use rpc_proxy::wire::cbor;
use rpc_proxy::{Proxy, ProxyRuntime};
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

fn main() -> Result<()> {
    let args = Args::parse();

    // Verbosity applies to both the log file and stdout:
    // default INFO, -v DEBUG, -vv and more TRACE.
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Detailed layer: a daily-rolled file, or stderr on request. The
    // guard must outlive the program for file logging to flush.
    let guard;
    let detailed_log_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("rpc-proxy.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "rpc-proxy.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Operator-facing stdout unless --quiet: compact, level-colored
    // lines without timestamps or targets. The per-peer context lives in
    // the event fields themselves (`system`, `service`, stream ids), so
    // the status line needs no further decoration.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .without_time()
                .with_target(false)
                .compact()
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    info!("rpc-proxy {} starting", rpc_proxy::VERSION);
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    if args.log_file.as_deref() != Some("stderr") {
        info!(
            "detailed log: {}.{today}",
            args.log_file.as_deref().unwrap_or("rpc-proxy.log")
        );
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(run_demo_deployment()))
}

/// Configuration for the `alpha` node: it *hosts* demo.echo for its local
/// clients, forwarding to `beta`.
fn alpha_config() -> ProxyConfig {
    ProxyConfig {
        local_system_name: "alpha".into(),
        links: vec![SystemLink {
            system_name: "beta".into(),
            transport: LinkTransport::InProcess,
        }],
        servers: vec![ExportedServer {
            service_name: "demo.echo".into(),
            protocol_id: "demo.v1".into(),
            max_msg_size: 4096,
        }],
        bindings: vec![ServiceBinding {
            service_name: "demo.echo".into(),
            system_name: "beta".into(),
            remote_service_name: "demo.echo".into(),
        }],
        ..Default::default()
    }
}

/// Configuration for the `beta` node: it *requires* demo.echo from its
/// local fabric, serving remote clients.
fn beta_config() -> ProxyConfig {
    ProxyConfig {
        local_system_name: "beta".into(),
        links: vec![SystemLink {
            system_name: "alpha".into(),
            transport: LinkTransport::InProcess,
        }],
        clients: vec![RequiredClient {
            service_name: "demo.echo".into(),
            protocol_id: "demo.v1".into(),
            max_msg_size: 4096,
        }],
        bindings: vec![ServiceBinding {
            service_name: "demo.echo".into(),
            system_name: "alpha".into(),
            remote_service_name: "demo.echo".into(),
        }],
        ..Default::default()
    }
}

async fn run_demo_deployment() -> Result<()> {
    // Two engines, two fabrics, one in-memory link between them.
    let (alpha_fabric, alpha_handle) = LoopbackFabric::new();
    let (beta_fabric, beta_handle) = LoopbackFabric::new();
    beta_handle.register_server("demo.echo", "demo.v1");

    let mut alpha_rt = ProxyRuntime::new(Proxy::new(alpha_config(), Box::new(alpha_fabric)));
    let mut beta_rt = ProxyRuntime::new(Proxy::new(beta_config(), Box::new(beta_fabric)));

    let (link_a, link_b) = MemoryTransport::pair("alpha->beta", "beta->alpha");
    alpha_rt.install_transport("beta", Box::new(link_a));
    beta_rt.install_transport("alpha", Box::new(link_b));

    alpha_handle.set_notifier(alpha_rt.fabric_kick_sender());
    beta_handle.set_notifier(beta_rt.fabric_kick_sender());
    let beta_kick = beta_rt.fabric_kick_sender();

    tokio::task::spawn_local(async move {
        if let Err(e) = alpha_rt.run().await {
            error!("alpha proxy stopped: {e}");
        }
    });
    tokio::task::spawn_local(async move {
        if let Err(e) = beta_rt.run().await {
            error!("beta proxy stopped: {e}");
        }
    });

    // The echo server process on beta's fabric.
    let echo_handle = beta_handle.clone();
    tokio::task::spawn_local(async move {
        loop {
            while let Some((token, message)) = echo_handle.next_delivered("demo.echo") {
                echo_handle.complete(token, LocalMessage::new(message.payload));
                let _ = beta_kick.send(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    });

    // Wait for alpha to advertise the service locally.
    for _ in 0..100 {
        if alpha_handle.is_advertised("demo.echo") {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    let Some((service, session)) = alpha_handle.connect_client("demo.echo") else {
        anyhow::bail!("demo.echo never became available on alpha");
    };
    info!("demo.echo is bound; playing one round trip");

    // One request: method id 1, a single text argument.
    let mut payload = 1u32.to_be_bytes().to_vec();
    cbor::emit_text(&mut payload, "ping across the link");
    payload.push(cbor::BREAK);
    alpha_handle.client_request(service, session, LocalMessage::new(payload), true);

    for _ in 0..100 {
        if let Some(response) = alpha_handle.next_completion(session) {
            info!(
                "echo round trip complete ({} payload bytes)",
                response.payload.len()
            );
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    info!("demo complete; proxies keep running (ctrl-c to exit)");
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}
