//! Integration tests for graceful shutdown behavior.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use vkdaq_server::acquisition::{
    AcquisitionState, AcquisitionWorker, Configuration, WorkerPhase, WorkerSettings,
};
use vkdaq_server::control::{ControlSurface, Limits};
use vkdaq_server::driver::{FaultInjection, MockDaq, MockDaqConfig};
use vkdaq_server::server;

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("No free port")
}

#[test]
fn test_shutdown_stops_and_clears_task() {
    let (driver, mock) = MockDaq::new(MockDaqConfig::default());
    let state = Arc::new(AcquisitionState::new(Configuration::new(1000, 50)));
    let worker = AcquisitionWorker::new(driver, Arc::clone(&state), WorkerSettings::default())
        .spawn()
        .expect("Failed to spawn worker");
    assert!(wait_for(Duration::from_secs(3), || state.phase()
        == WorkerPhase::Armed));

    worker.shutdown();

    let ops: Vec<_> = mock.calls().iter().map(|c| c.operation).collect();
    assert_eq!(&ops[ops.len() - 2..], &["stop_task", "clear_task"]);
    assert_eq!(mock.live_tasks(), 0);
    assert_eq!(state.phase(), WorkerPhase::Idle);
}

#[test]
fn test_shutdown_completes_within_read_timeout() {
    let (driver, _mock) = MockDaq::new(MockDaqConfig::scripted());
    let state = Arc::new(AcquisitionState::new(Configuration::new(1000, 50)));
    let worker = AcquisitionWorker::new(driver, Arc::clone(&state), WorkerSettings::default())
        .spawn()
        .expect("Failed to spawn worker");
    assert!(wait_for(Duration::from_secs(3), || state.phase()
        == WorkerPhase::Armed));

    let start = Instant::now();
    worker.shutdown();
    let elapsed = start.elapsed();

    // At most one blocked read (1 s) plus teardown.
    assert!(elapsed < Duration::from_secs(2), "Shutdown took too long: {:?}", elapsed);
}

#[test]
fn test_shutdown_interrupts_backoff() {
    let (driver, mock) = MockDaq::new(MockDaqConfig::scripted());
    mock.inject(FaultInjection::FailAlways {
        operation: "start_task",
    });
    let settings = WorkerSettings {
        retry_backoff: Duration::from_secs(30),
        ..WorkerSettings::default()
    };
    let state = Arc::new(AcquisitionState::new(Configuration::new(1000, 50)));
    let worker = AcquisitionWorker::new(driver, Arc::clone(&state), settings)
        .spawn()
        .expect("Failed to spawn worker");
    assert!(wait_for(Duration::from_secs(3), || state.phase()
        == WorkerPhase::Faulted));

    let start = Instant::now();
    worker.shutdown();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(mock.live_tasks(), 0);
}

#[test]
fn test_shutdown_before_first_initialization() {
    let (driver, mock) = MockDaq::new(MockDaqConfig::scripted());
    let state = Arc::new(AcquisitionState::new(Configuration::new(1000, 50)));
    let worker = AcquisitionWorker::new(driver, Arc::clone(&state), WorkerSettings::default())
        .spawn()
        .expect("Failed to spawn worker");

    worker.request_stop();
    worker.shutdown();
    assert_eq!(mock.live_tasks(), 0);
}

#[tokio::test]
async fn test_http_server_serves_and_stops() {
    let state = Arc::new(AcquisitionState::new(Configuration::new(3990, 390)));
    let surface = ControlSurface::new(
        state,
        Limits::default(),
        vec!["dev1/AIN1".into(), "dev1/AIN2".into()],
        "DAQ Server",
    );
    let addr: SocketAddr = ([127, 0, 0, 1], free_port()).into();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(server::serve(addr, surface, async {
        let _ = shutdown_rx.await;
    }));

    let mut stream = None;
    for _ in 0..50 {
        match TcpStream::connect(addr).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let mut stream = stream.expect("Server did not start");
    stream
        .write_all(b"GET /ch1.dat HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("Failed to send request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("Failed to read response");

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("text/plain"));
    assert!(response.ends_with("\n0.000000"));

    shutdown_tx.send(()).expect("Server already gone");
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("Server did not stop")
        .expect("Server task panicked");
    assert!(result.is_ok());
}
