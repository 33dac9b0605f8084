use crawlsink::cli::{Cli, Commands};
use crawlsink::coordinator::Coordinator;
use crawlsink::resort::{self, ResortOptions};
use crawlsink::routing::ElectoralPolicy;
use crawlsink::{domain, logging, runs, server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    let code = match cli.command {
        Commands::Serve {
            port,
            root,
            watchdog_interval_ms,
            idle_finalize_ms,
        } => serve(port, root, watchdog_interval_ms, idle_finalize_ms).await,
        Commands::ResortDownloads {
            domain,
            crawl_root,
            apply,
            root,
            conflict,
            limit,
        } => resort_downloads(domain, crawl_root, apply, root, conflict, limit),
    };
    std::process::exit(code);
}

async fn serve(port: u16, root: String, watchdog_interval_ms: u64, idle_finalize_ms: u64) -> i32 {
    let root = PathBuf::from(root);
    let _log_guards = match logging::init_logging(&root.join("logs")) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return 1;
        }
    };

    let coordinator = match Coordinator::new(&root) {
        Ok(c) => Arc::new(c.with_watchdog(watchdog_interval_ms, idle_finalize_ms)),
        Err(e) => {
            tracing::error!("Project root {} is not usable: {}", root.display(), e);
            return 1;
        }
    };

    tracing::info!("Starting crawl sink");
    tracing::info!("  Root:       {}", root.display());
    tracing::info!("  Downloads:  {}", root.join("downloads").display());
    tracing::info!("  Port:       {}", port);
    tracing::info!(
        "  Watchdog:   every {}ms, finalize after {}ms idle",
        watchdog_interval_ms,
        idle_finalize_ms
    );

    let shutdown = CancellationToken::new();
    let watchdog = runs::spawn_watchdog(coordinator.clone(), shutdown.clone());

    let app = server::build_router(coordinator);
    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Cannot bind {}: {}", addr, e);
            shutdown.cancel();
            return 1;
        }
    };
    tracing::info!("Sink listening on http://{addr}");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutting down");
                shutdown.cancel();
            }
        })
        .await;

    shutdown.cancel();
    let _ = watchdog.await;

    match served {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("Server error: {}", e);
            1
        }
    }
}

fn resort_downloads(
    domain_arg: Option<String>,
    crawl_root: Option<String>,
    apply: bool,
    root: String,
    conflict: String,
    limit: Option<usize>,
) -> i32 {
    let conflict = match conflict.parse() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    let root = PathBuf::from(root);
    let store = crawlsink::StateStore::new(&root);
    let key = domain::resolve_key(domain_arg.as_deref(), [crawl_root.as_deref()]);
    let paths = store.paths(&key);

    println!(
        "Resorting downloads for '{}' under {} ({})",
        key,
        root.display(),
        if apply { "apply" } else { "dry run" }
    );

    let report = match resort::run_resort(
        &store,
        &paths,
        &ElectoralPolicy,
        ResortOptions {
            apply,
            conflict,
            limit,
        },
    ) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Resort failed: {e}");
            return 1;
        }
    };

    if report.actions.is_empty() {
        println!("Nothing to do; tree is consistent with the registry.");
    } else {
        println!("\nActions:");
        for (kind, count) in &report.counts {
            println!("  {kind:<14} {count}");
        }
        if !apply {
            println!("\nDry run only. Re-run with --apply to perform these actions.");
        }
    }
    0
}
