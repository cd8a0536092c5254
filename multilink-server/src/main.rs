use anyhow::Result;
use multilink_core::{PreSharedKey, ServerConfig};
use multilink_server::{cli, config, runtime};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = <cli::Cli as clap::Parser>::parse();
    let config_path = match cli.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };

    match cli.command.unwrap_or(cli::Command::Run) {
        cli::Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::InitConfig { force, psk } => {
            let psk_b64 = psk.unwrap_or_else(PreSharedKey::generate_base64);
            let cfg = ServerConfig {
                psk_b64: psk_b64.clone(),
                ..ServerConfig::default()
            };
            config::save(&config_path, &cfg, force)?;
            println!("Wrote default config to {}", config_path.display());
            println!("Pre-shared key (copy into the client config): {psk_b64}");
            Ok(())
        }
        cli::Command::Run => {
            let cfg = config::load(&config_path)?;
            let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = stop_tx.send(true);
                }
            });
            runtime::run_server(cfg, stop_rx, Box::new(|m| tracing::info!("{m}"))).await
        }
    }
}
