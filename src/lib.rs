pub mod channels;
pub mod command;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod options;
pub mod poller;
pub mod prelude;
pub mod solarmax;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::mqtt::Mqtt;
use crate::prelude::*;
use std::time::Duration;

fn init_logging(level: &str) -> std::result::Result<(), log::SetLoggerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init()
}

/// Loads the config, then runs the MQTT client and the poller until ctrl-c
/// or the optional runtime limit.
pub async fn app() -> Result<()> {
    let options = Options::new();

    // the log level lives in the config file, so the logger starts after it
    let config = ConfigWrapper::new(options.config_file.clone())
        .map_err(|err| anyhow!("failed to load config {}: {:?}", options.config_file, err))?;

    if let Err(e) = init_logging(&config.loglevel()) {
        eprintln!("failed to initialise logging: {}", e);
    }

    info!("solarmax-bridge {} starting", CARGO_PKG_VERSION);
    info!("Read configuration from {}", options.config_file);
    config.log();

    let channels = Channels::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    info!("  Creating MQTT client...");
    let mqtt = Mqtt::new(config.clone(), channels.clone());
    let mqtt_task = mqtt.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt_task.start().await {
            error!("MQTT task failed: {}", e);
        }
    });

    info!("  Creating Poller...");
    let mut poller = Poller::new(config.clone(), channels.clone());
    let poller_shutdown = shutdown_tx.subscribe();
    let poller_handle = tokio::spawn(async move {
        if let Err(e) = poller.start(poller_shutdown).await {
            error!("Poller task failed: {}", e);
        }
    });

    wait_for_shutdown(options.runtime).await;

    info!("Shutdown signal received, stopping components...");
    let _ = shutdown_tx.send(());
    if let Err(e) = poller_handle.await {
        error!("Error waiting for poller task: {}", e);
    }

    mqtt.stop();
    if let Err(e) = mqtt_handle.await {
        error!("Error waiting for MQTT task: {}", e);
    }

    info!("Application shutdown complete");
    Ok(())
}

async fn wait_for_shutdown(runtime: Option<u64>) {
    let limit = async {
        match runtime {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => futures::future::pending::<()>().await,
        }
    };

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                error!("Failed to listen for ctrl+c: {}", e);
            }
        }
        _ = limit => info!("runtime limit of {:?}s reached", runtime.unwrap_or_default()),
    }
}
