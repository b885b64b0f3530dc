//! Free flight: localize at the current tracking pose without a server.
//!
//! Usage: cargo run --example free_flight
//! Walks the simulated tracking along a circle and prints each localization.

use nalgebra::Vector3;
use std::sync::Arc;
use std::time::Duration;
use vps_client::sim::StaticTracking;
use vps_client::{LocalizationAlgorithm, LocalizationEvent, Settings, SimulatedAlgorithm};

fn main() {
    env_logger::init();

    let mut settings = Settings::new(vec!["free-flight".into()]);
    settings.localization_interval = Duration::from_millis(200);

    let tracking = Arc::new(StaticTracking::new());
    let mut algorithm = SimulatedAlgorithm::new(settings, tracking.clone());
    let events = algorithm.events();

    if let Err(e) = algorithm.run() {
        eprintln!("Failed to start: {}", e);
        std::process::exit(1);
    }

    for step in 0..20 {
        let angle = f64::from(step) * 18.0;
        let (sin, cos) = angle.to_radians().sin_cos();
        tracking.set_pose(Vector3::new(2.0 * cos, 0.0, 2.0 * sin), Vector3::new(0.0, angle, 0.0));

        match events.recv_timeout(Duration::from_secs(1)) {
            Ok(LocalizationEvent::Localized(loc)) => println!(
                "step {:>2}  pos=[{:+.3}, {:+.3}, {:+.3}]  yaw={:.1}",
                step, loc.vps_position.x, loc.vps_position.y, loc.vps_position.z, loc.vps_rotation.y
            ),
            Ok(other) => println!("step {:>2}  {:?}", step, other),
            Err(_) => eprintln!("step {:>2}  no event", step),
        }
    }

    algorithm.stop();
}
