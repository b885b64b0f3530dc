//! HttpTransport and the full loop against a local tiny_http server.

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use vps_client::protocol::{decode_request, decode_response};
use vps_client::sim::{FakeGeo, StaticCamera, StaticTracking};
use vps_client::{
    ErrorKind, GpsFix, HttpTransport, LocalizationEvent, LocalizationResult, MemoryUserIdStore,
    Providers, Settings, Transport, TransportRequest, VpsError, VpsService,
};

const DONE: &str = r#"{"data":{"status":"done","status_description":"ok","attributes":{"location_id":"hall","tracking_pose":{"x":0,"y":0,"z":0,"rx":0,"ry":0,"rz":0},"vps_pose":{"x":1.5,"y":0,"z":-2,"rx":0,"ry":30,"rz":0}}}}"#;

#[derive(Debug, Clone)]
struct Received {
    url: String,
    content_type: String,
    body: String,
}

/// Answers every request with `(status, body)` until dropped.
struct MockServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Received>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(status: u16, body: &'static str) -> MockServer {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let received = received.clone();
            let running = running.clone();
            std::thread::spawn(move || {
                while running.load(Ordering::Relaxed) {
                    let Ok(Some(mut request)) = server.recv_timeout(Duration::from_millis(20)) else {
                        continue;
                    };
                    let content_type = request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv("Content-Type"))
                        .map(|h| h.value.as_str().to_string())
                        .unwrap_or_default();
                    let mut raw = Vec::new();
                    request.as_reader().read_to_end(&mut raw).unwrap();
                    received.lock().unwrap().push(Received {
                        url: request.url().to_string(),
                        content_type,
                        body: String::from_utf8_lossy(&raw).into_owned(),
                    });

                    let header =
                        tiny_http::Header::from_bytes(&b"x-request-id"[..], &b"req-1"[..]).unwrap();
                    let response = tiny_http::Response::from_string(body)
                        .with_status_code(status)
                        .with_header(header);
                    let _ = request.respond(response);
                }
            })
        };

        MockServer {
            addr,
            received,
            running,
            thread: Some(thread),
        }
    }

    fn endpoint(&self) -> String {
        format!("http://{}/", self.addr)
    }

    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn transport_for(endpoint: &str, timeout: Duration) -> HttpTransport {
    let mut settings = Settings::new(vec!["hall".into()]);
    settings.endpoint = endpoint.to_string();
    let mut transport = HttpTransport::new(timeout);
    transport.set_endpoint(&settings.request_url());
    transport
}

fn request() -> TransportRequest {
    TransportRequest {
        image: Some(vec![0xFF, 0xD8, 0xFF, 0xD9]),
        image_name: "1700000000000.jpg".into(),
        embedding: None,
        meta: r#"{"data":{"attributes":{}}}"#.into(),
    }
}

#[test]
fn test_posts_multipart_to_api_path() {
    let server = MockServer::start(200, DONE);
    let transport = transport_for(&server.endpoint(), Duration::from_secs(5));

    let response = transport.send(&request()).unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.request_id.as_deref(), Some("req-1"));

    let LocalizationResult::Localized(loc) = decode_response(response.status, &response.body) else {
        panic!("expected a localization");
    };
    assert_eq!(loc.location_id, "hall");
    assert_eq!(loc.vps_rotation.y, 30.0);

    let received = server.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].url, "/vps/api/v3");
    assert!(received[0].content_type.starts_with("multipart/form-data; boundary="));
    assert!(received[0]
        .body
        .contains("name=\"image\"; filename=\"1700000000000.jpg\""));
    assert!(received[0].body.contains(r#"{"data":{"attributes":{}}}"#));
    assert!(!received[0].body.contains("name=\"embedding\""));
}

#[test]
fn test_error_statuses_are_decoded() {
    let server = MockServer::start(
        422,
        r#"{"detail":[{"loc":["body","image"],"msg":"field required","type":"value_error.missing"}]}"#,
    );
    let transport = transport_for(&server.endpoint(), Duration::from_secs(5));
    let response = transport.send(&request()).unwrap();
    let result = decode_response(response.status, &response.body);
    let error = result.error().unwrap();
    assert_eq!(error.kind, ErrorKind::ValidationError);
    assert_eq!(error.field.as_deref(), Some("body/image"));

    let server = MockServer::start(500, r#"{"detail":"boom"}"#);
    let transport = transport_for(&server.endpoint(), Duration::from_secs(5));
    let response = transport.send(&request()).unwrap();
    let result = decode_response(response.status, &response.body);
    assert_eq!(result.error().unwrap().kind, ErrorKind::ServerInternalError);
    assert_eq!(result.error().unwrap().message, "boom");
}

#[test]
fn test_refused_connection_is_a_network_error() {
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let transport = transport_for(&format!("http://{}/", addr), Duration::from_secs(1));
    assert!(matches!(transport.send(&request()), Err(VpsError::Network(_))));
}

#[test]
fn test_silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let holder = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_millis(500));
        drop(stream);
    });

    let transport = transport_for(&format!("http://{}/", addr), Duration::from_millis(100));
    assert!(matches!(transport.send(&request()), Err(VpsError::Network(_))));
    holder.join().unwrap();
}

#[test]
fn test_https_endpoint_is_rejected() {
    let transport = transport_for("https://vps.example.com/", Duration::from_secs(1));
    assert!(matches!(transport.send(&request()), Err(VpsError::InvalidUrl(_))));
}

fn providers(tracking: Arc<StaticTracking>) -> Providers {
    let gps = GpsFix {
        latitude: 59.93,
        longitude: 30.31,
        altitude: 10.0,
        accuracy: 12.0,
        timestamp: 1.0,
    };
    Providers {
        tracking: Some(tracking),
        camera: Some(Arc::new(StaticCamera::new())),
        geo: Some(Arc::new(FakeGeo::new(Some(gps), None))),
        extractor: None,
        ar_supported: true,
    }
}

fn fast_settings(endpoint: String, send_gps: bool) -> Settings {
    let mut settings = Settings::new(vec!["hall".into()]);
    settings.endpoint = endpoint;
    settings.send_gps = send_gps;
    settings.localization_interval = Duration::from_millis(10);
    settings.calibration_interval = Duration::from_millis(10);
    settings.poll_period = Duration::from_millis(2);
    settings.request_timeout = Duration::from_secs(5);
    settings
}

#[test]
fn test_service_localizes_against_server() {
    let server = MockServer::start(200, DONE);
    let tracking = Arc::new(StaticTracking::new());
    let mut service = VpsService::new(
        providers(tracking.clone()),
        Box::new(MemoryUserIdStore::with_id("it-user")),
    );
    let events = service.events();
    service.start(fast_settings(server.endpoint(), true)).unwrap();

    let event = events.recv_timeout(Duration::from_secs(10)).unwrap();
    service.stop();

    let LocalizationEvent::Localized(loc) = event else {
        panic!("expected a localization, got {:?}", event);
    };
    assert_eq!(loc.location_id, "hall");
    assert_eq!(tracking.location_id(), "hall");
    let anchor = service.corrector().anchor();
    assert!((anchor.position.x - 1.5).abs() < 1e-9);
    assert!((anchor.position.z + 2.0).abs() < 1e-9);

    let received = server.received();
    let body = &received[0].body;
    let start = body.find("{\"data\"").unwrap();
    let end = body[start..].find("\r\n").unwrap() + start;
    let meta = decode_request(&body[start..end]).unwrap();
    assert_eq!(meta.user_id, "it-user");
    assert_eq!(meta.location_ids, vec!["hall"]);
    assert_eq!(meta.gps.map(|g| g.accuracy), Some(12.0));
}

#[test]
fn test_service_reports_no_internet() {
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let mut service = VpsService::new(
        providers(Arc::new(StaticTracking::new())),
        Box::new(MemoryUserIdStore::new()),
    );
    let events = service.events();
    service
        .start(fast_settings(format!("http://{}/", addr), false))
        .unwrap();

    let event = events.recv_timeout(Duration::from_secs(10)).unwrap();
    service.stop();

    let LocalizationEvent::Error(error) = event else {
        panic!("expected an error, got {:?}", event);
    };
    assert_eq!(error.kind, ErrorKind::NoInternet);
    assert_eq!(error.message, "Network is not available");
}
