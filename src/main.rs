use anyhow::Context;
use galvani::config::Config;
use galvani::controller::{Controller, Exit};
use galvani::logging::init_logging;
use galvani::APP_VERSION;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    init_logging(&config.logging).context("failed to initialize logging")?;

    info!("Starting galvani {}", APP_VERSION);

    // Transient hardware faults (e.g. an ADC read failing across an
    // NTP-induced clock jump) restart the control loop with a backoff; the
    // controller has already opened all relays by the time it returns.
    let mut attempts = 0u32;
    loop {
        let mut controller =
            Controller::from_config(config.clone()).context("failed to construct controller")?;
        match controller.run().await {
            Ok(Exit::OsShutdown) => {
                info!("Controller requested OS shutdown; exiting");
                return Ok(());
            }
            Ok(Exit::Terminated) => {
                info!("Terminated by signal; exiting");
                return Ok(());
            }
            Err(e) if e.is_transient() && attempts < config.power.max_restart_attempts => {
                attempts += 1;
                warn!(
                    "Transient fault ({}); restarting control loop in {}s (attempt {}/{})",
                    e, config.power.restart_backoff_sec, attempts, config.power.max_restart_attempts
                );
                tokio::time::sleep(std::time::Duration::from_secs(
                    config.power.restart_backoff_sec,
                ))
                .await;
            }
            Err(e) => {
                error!("Fatal controller error: {}", e);
                return Err(e.into());
            }
        }
    }
}
