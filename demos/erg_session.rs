use ergolink::{
    BtleplugAdapter, ControllerConfig, DeviceRole, ErgController, ErgEvent, Result, Selector,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Ergolink ERG Session Example");
    info!("Searching for smart trainers...");

    let adapter = BtleplugAdapter::new().await?;
    let (controller, mut events) =
        ErgController::spawn(adapter, ControllerConfig::default()).await?;

    // Print status messages as they arrive
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ErgEvent::Status(status) => {
                    if let Some(message) = status.message {
                        info!("📣 {} ({})", message, status.state);
                    }
                }
                ErgEvent::TargetWattsChanged(watts) => info!("🎯 Target now {} W", watts),
                _ => {}
            }
        }
    });

    // Connect to the first available trainer
    let label = match controller.connect(Selector::Any, DeviceRole::Control).await {
        Ok(label) => {
            info!("✅ Connected to: {}", label);
            label
        }
        Err(e) => {
            error!("❌ Failed to connect to trainer: {}", e);
            return Err(e);
        }
    };

    // Three minute session at 150 W
    info!("⚡ Starting a 3 minute session at 150 W on {}...", label);
    if let Err(e) = controller
        .start_session(150.0, Some(Duration::from_secs(180)))
        .await
    {
        error!("❌ Failed to start session: {}", e);
        controller.shutdown().await;
        return Err(e);
    }

    sleep(Duration::from_secs(30)).await;

    // Step the target up in small increments
    info!("📈 Increasing target...");
    for _ in 0..3 {
        match controller.nudge_watts(10).await {
            Ok(watts) => info!("✅ Target raised to {} W", watts),
            Err(e) => {
                error!("❌ Failed to raise target: {}", e);
                break;
            }
        }
        sleep(Duration::from_secs(10)).await;
    }

    // Short break
    info!("⏸️ Pausing for 10 seconds...");
    controller.pause_session().await?;
    sleep(Duration::from_secs(10)).await;
    controller.resume_session().await?;
    info!("▶️ Resumed");

    // Let the auto-stop end the session
    loop {
        let status = controller.status().await?;
        if !status.running && !status.paused {
            break;
        }
        if let Some(remaining) = status.remaining_ms {
            info!("⏳ {}s remaining at {} W", remaining / 1000, status.target_watts);
        }
        sleep(Duration::from_secs(15)).await;
    }

    info!("🔌 Shutting down...");
    controller.shutdown().await;

    info!("🎉 ERG session example completed!");
    Ok(())
}
