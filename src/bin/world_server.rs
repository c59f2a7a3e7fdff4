use std::sync::Arc;
use anyhow::{Context, Result};
use worldsrv::config::ServerConfig;
use worldsrv::core::{ServerContext, Stores};
use worldsrv::database::MySqlStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/server.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: world_server [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    return Err(anyhow::anyhow!("--conf requires a FILE argument"));
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config = ServerConfig::from_file(&conf_file)
        .with_context(|| format!("Cannot load config: {}", conf_file))?;

    let store = Arc::new(MySqlStore::connect(&config).await?);
    match store.reset_login_flags().await {
        Ok(n) => tracing::info!("[world] [login_flags_reset] accounts={}", n),
        Err(e) => tracing::warn!("[world] [login_flags_reset_failed] error={:#}", e),
    }

    let server = ServerContext::start(config, Stores::new(store.clone(), store))?;
    server.set_term_func(|| tracing::info!("[world] [offline] Worlds are offline."));
    tracing::info!("[world] [started] World Server Started.");

    let signalled = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signalled.request_shutdown(),
            Err(e) => tracing::error!("[world] [signal_failed] error={}", e),
        }
    });

    server.run_until_shutdown().await;

    Ok(())
}
