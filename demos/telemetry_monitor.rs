use ergolink::{
    BtleplugAdapter, ControllerConfig, DeviceRole, ErgController, ErgEvent, Result, Selector,
    TelemetrySample,
};
use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 Ergolink Telemetry Monitor Example");

    let adapter = BtleplugAdapter::new().await?;
    let (controller, mut events) =
        ErgController::spawn(adapter, ControllerConfig::default()).await?;

    // List what is nearby for a few seconds
    info!("🔍 Scanning for devices...");
    controller.start_discovery().await?;
    sleep_and_drain(&mut events, Duration::from_secs(5)).await;
    controller.stop_discovery().await?;

    for device in controller.devices().await? {
        info!(
            "  {:<24} {:<16} {:>5} dBm",
            device.label(),
            device.class.to_string(),
            device.rssi.unwrap_or_default()
        );
    }

    match controller.connect(Selector::Any, DeviceRole::Control).await {
        Ok(label) => info!("✅ Trainer: {}", label),
        Err(e) => {
            error!("❌ Failed to connect to trainer: {}", e);
            return Err(e);
        }
    }

    // Heart rate is optional
    match controller.connect(Selector::Any, DeviceRole::HeartRate).await {
        Ok(label) => info!("❤️ Heart rate strap: {}", label),
        Err(e) => warn!("⚠️ No heart rate strap: {}", e),
    }

    info!("Press Ctrl+C to stop monitoring");

    let mut report = interval(Duration::from_secs(2));
    let start_time = Instant::now();
    let mut latest = Latest::default();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ErgEvent::Telemetry(sample)) => latest.update(&sample),
                Some(ErgEvent::Status(status)) => {
                    if let Some(message) = status.message {
                        warn!("📣 {}", message);
                    }
                }
                Some(_) => {}
                None => break,
            },
            _ = report.tick() => {
                let elapsed = start_time.elapsed().as_secs();
                println!(
                    "({:02}:{:02}) power {:>4} W | cadence {:>5.1} rpm | speed {:>5.2} km/h | hr {:>3} bpm",
                    elapsed / 60,
                    elapsed % 60,
                    latest.power.unwrap_or_default(),
                    latest.cadence.unwrap_or_default(),
                    latest.speed.unwrap_or_default(),
                    latest.heart_rate.unwrap_or_default(),
                );
            }
        }
    }

    info!("🔌 Shutting down...");
    controller.shutdown().await;
    Ok(())
}

#[derive(Default)]
struct Latest {
    power: Option<i16>,
    cadence: Option<f64>,
    speed: Option<f64>,
    heart_rate: Option<u16>,
}

impl Latest {
    fn update(&mut self, sample: &TelemetrySample) {
        self.power = sample.power_watts.or(self.power);
        self.cadence = sample.cadence_rpm.or(self.cadence);
        self.speed = sample.speed_kph.or(self.speed);
        self.heart_rate = sample.heart_rate_bpm.or(self.heart_rate);
    }
}

async fn sleep_and_drain(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ErgEvent>,
    duration: Duration,
) {
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = events.recv() => {
                if let Some(ErgEvent::DeviceList(devices)) = event {
                    info!("📡 {} devices in range", devices.len());
                }
            }
        }
    }
}
