use ergolink::{
    BtleplugAdapter, ControllerConfig, DeviceRole, ErgController, ErgError, Result, Selector,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🛑 Ergolink Shutdown Example");
    info!("This example demonstrates a safe teardown while a session is running");

    let adapter = BtleplugAdapter::new().await?;
    let config = ControllerConfig {
        connect_timeout_ms: 10_000,
        ..ControllerConfig::default()
    };
    let (controller, _events) = ErgController::spawn(adapter, config).await?;

    if let Err(e) = controller.connect(Selector::Any, DeviceRole::Control).await {
        error!("❌ Failed to connect to trainer: {}", e);
        return Err(e);
    }

    info!("⚡ Starting an open-ended session at 120 W...");
    controller.start_session(120.0, None).await?;
    sleep(Duration::from_secs(10)).await;

    // Shutdown sends stop and reset, then drops every link. It never fails.
    info!("🛑 Shutting down mid-session...");
    controller.shutdown().await;
    info!("✅ Trainer released");

    // The handle is now closed
    match controller.status().await {
        Err(ErgError::ControllerClosed) => info!("✅ Controller reports closed"),
        Err(e) => warn!("⚠️ Unexpected error after shutdown: {}", e),
        Ok(_) => warn!("⚠️ Controller still answering after shutdown"),
    }

    info!("🎉 Shutdown example completed!");
    Ok(())
}
