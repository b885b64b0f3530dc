//! Run server localization with simulated sensors and print every event.
//!
//! Usage: VPS_LOCATION_IDS=my-location VPS_URL=http://127.0.0.1:8000/ \
//!        cargo run --example localize
//! Settings come from `VPS_*` environment variables. Stops after 30 seconds.

use std::sync::Arc;
use std::time::{Duration, Instant};
use vps_client::sim::{FakeGeo, StaticCamera, StaticTracking};
use vps_client::{
    CorrectionOptions, GpsFix, LocalizationEvent, MemoryUserIdStore, PoseCorrector, Providers,
    Settings, VpsService,
};

fn main() {
    env_logger::init();

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Invalid settings: {}", e);
            std::process::exit(1);
        }
    };

    println!("Endpoint:  {}", settings.request_url());
    println!("Locations: {:?}", settings.location_ids);
    println!("Mode:      {:?}", settings.mode);
    println!();

    let gps = GpsFix {
        latitude: 55.7539,
        longitude: 37.6208,
        altitude: 150.0,
        accuracy: 8.0,
        timestamp: 0.0,
    };
    let providers = Providers {
        tracking: Some(Arc::new(StaticTracking::new())),
        camera: Some(Arc::new(StaticCamera::new())),
        geo: Some(Arc::new(FakeGeo::new(Some(gps), None))),
        extractor: None,
        ar_supported: true,
    };
    println!("Capabilities: {:?}", providers.capabilities());

    let corrector = Arc::new(PoseCorrector::new(CorrectionOptions::from_env()));
    let mut service = VpsService::new(providers, Box::new(MemoryUserIdStore::new()))
        .with_corrector(corrector);
    let events = service.events();
    if let Err(e) = service.start(settings) {
        eprintln!("Failed to start: {}", e);
        std::process::exit(1);
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        match events.recv_timeout(Duration::from_secs(1)) {
            Ok(LocalizationEvent::Localized(loc)) => {
                let anchor = service.corrector().anchor();
                println!(
                    "localized in {}  vps=[{:+.3}, {:+.3}, {:+.3}]  anchor=[{:+.3}, {:+.3}, {:+.3}]",
                    loc.location_id,
                    loc.vps_position.x, loc.vps_position.y, loc.vps_position.z,
                    anchor.position.x, anchor.position.y, anchor.position.z,
                );
            }
            Ok(LocalizationEvent::Error(e)) => {
                println!("error: {}", e);
                if e.kind.is_fatal() {
                    break;
                }
            }
            Ok(LocalizationEvent::AngleChanged(ok)) => println!("angle ok: {}", ok),
            Err(_) => {}
        }
        // Renderer stand-in: advance the anchor animation.
        service.corrector().tick(Duration::from_millis(16));
    }

    if let Some(session) = service.session_info() {
        println!(
            "\nSession {}: {} responses, {} ok, {} failed",
            session.id, session.responses_count, session.success_count, session.fail_count
        );
    }
    service.stop();
}
