//! Writer service binary.

use tracing::{error, info};

use chat_writer::{bootstrap, shutdown, Config, Service};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bootstrap::init_tracing();
    info!("starting writer service");

    let config = Config::from_env();
    let shutdown = shutdown::install_signal_handler();

    let service = Service::connect(&config).await.map_err(|err| {
        error!(error = %err, "failed to connect dependencies");
        err
    })?;

    service.run(shutdown).await;
    info!("writer service stopped");
    Ok(())
}
