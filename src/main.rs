use anyhow::Result;
use tracing::{error, info};

use anisync::{Config, DataPlane};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    HealthCheck,
    Prune,
    Stats,
    Serve,
}

impl Command {
    fn from_args() -> Self {
        let args: Vec<String> = std::env::args().skip(1).collect();
        if args.iter().any(|a| a == "--health-check") {
            Command::HealthCheck
        } else if args.iter().any(|a| a == "--prune") {
            Command::Prune
        } else if args.iter().any(|a| a == "--stats") {
            Command::Stats
        } else {
            Command::Serve
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Cargar configuración
    let config = Config::load()?;

    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("anisync={}", config.log_level).parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("📚 Iniciando anisync v{}", env!("CARGO_PKG_VERSION"));
    info!("{}", config.summary());

    let plane = DataPlane::start(&config).await;
    let command = Command::from_args();

    let outcome = match command {
        Command::HealthCheck => health_check(&plane),
        Command::Prune => {
            let removed = plane.cache().prune_expired(None, None);
            plane.cache().save_to_disk().await;
            info!("🧹 {} entradas expiradas eliminadas", removed);
            Ok(())
        }
        Command::Stats => {
            println!("{}", plane.cache().stats());
            if let Some(snapshot) = plane.cache().snapshot_stats().await {
                println!("{}", snapshot);
            }
            println!("{}", plane.scheduler().metrics());
            Ok(())
        }
        Command::Serve => {
            info!("🚀 Data plane activo, Ctrl+C para salir");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("❌ Error al registrar Ctrl+C: {}", e);
            }
            info!("⚠️ Señal de shutdown recibida, cerrando...");
            Ok(())
        }
    };

    plane.shutdown().await;
    outcome
}

fn health_check(plane: &DataPlane) -> Result<()> {
    let health = plane.health();
    println!("{}", serde_json::to_string_pretty(&health)?);
    if health.healthy {
        Ok(())
    } else {
        anyhow::bail!("data plane unhealthy")
    }
}
