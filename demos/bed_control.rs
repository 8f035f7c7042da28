use ergobed::{Attribute, BedDevice, ObserverKind, Result, ScenePreset, TargetValue};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let Some(address) = std::env::args().nth(1) else {
        error!("Usage: bed_control <bluetooth-address> [attribute value]");
        return Ok(());
    };

    info!("🛏️ Ergobed Control Example");
    info!("Searching for bed {}...", address);

    let bed = match BedDevice::connect(&address).await {
        Ok(device) => {
            info!("✅ Found bed: {}", device.address());
            device
        }
        Err(e) => {
            error!("❌ Failed to find bed: {}", e);
            return Err(e);
        }
    };

    bed.register_observer(ObserverKind::Connectivity, |view| {
        info!("🔗 Connected: {}", view.connected);
    });
    bed.register_observer(ObserverKind::State, |view| {
        let state = &view.snapshot;
        info!(
            "📊 head {} foot {} moving {} massage {}%/{}% led {}",
            state.head_position,
            state.foot_position,
            state.is_moving(),
            state.head_massage_pct,
            state.foot_massage_pct,
            if state.led_on { "ON" } else { "OFF" }
        );
    });

    // A single write given on the command line, e.g. `scene zerog`
    if let (Some(name), Some(text)) = (std::env::args().nth(2), std::env::args().nth(3)) {
        let attribute: Attribute = name.parse()?;
        let value = TargetValue::parse(attribute, &text)?;
        info!("✏️ Writing {} = {:?}", attribute, value);
        bed.set_target(attribute, value)?;
        sleep(Duration::from_secs(30)).await;
        return Ok(());
    }

    // Wait for the first status frame
    let mut view = bed.watch();
    if tokio::time::timeout(Duration::from_secs(15), view.changed())
        .await
        .is_err()
    {
        warn!("⚠️ No status received yet");
    }

    for (attribute, state) in bed.attributes() {
        info!("  {}: {:?}", attribute, state);
    }

    info!("⬆️ Raising head section...");
    bed.write_attribute("head_position", TargetValue::Position(400))?;
    sleep(Duration::from_secs(10)).await;

    info!("🌌 Recalling zero gravity...");
    bed.write_attribute("scene", TargetValue::Scene(ScenePreset::ZeroG))?;
    sleep(Duration::from_secs(10)).await;

    info!("🛑 Stopping...");
    bed.stop();
    sleep(Duration::from_secs(1)).await;

    info!("🛏️ Back to flat...");
    bed.write_attribute("scene", TargetValue::Scene(ScenePreset::Flat))?;
    sleep(Duration::from_secs(20)).await;

    bed.close();
    info!("👋 Done");
    Ok(())
}
