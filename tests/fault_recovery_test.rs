//! Integration tests for driver fault recovery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use vkdaq_server::acquisition::{
    AcquisitionState, AcquisitionWorker, Configuration, WorkerPhase, WorkerSettings,
};
use vkdaq_server::driver::{FaultInjection, MockDaq, MockDaqConfig};

fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        read_timeout: Duration::from_millis(20),
        capture_pause: Duration::from_millis(1),
        retry_backoff: Duration::from_millis(10),
        ..WorkerSettings::default()
    }
}

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

#[test]
fn test_start_failures_recover_automatically() {
    let (driver, mock) = MockDaq::new(MockDaqConfig::scripted());
    mock.inject(FaultInjection::FailFirst {
        operation: "start_task",
        count: 5,
    });
    let state = Arc::new(AcquisitionState::new(Configuration::new(3990, 390)));
    let worker = AcquisitionWorker::new(driver, Arc::clone(&state), fast_settings())
        .spawn()
        .expect("Failed to spawn worker");

    assert!(wait_for(Duration::from_secs(5), || state.phase()
        == WorkerPhase::Armed));
    assert_eq!(mock.count("start_task"), 6);
    assert_eq!(state.stats().faults, 5);
    assert!(state
        .stats()
        .last_fault
        .is_some_and(|msg| msg.contains("start_task")));
    assert_eq!(mock.max_live_tasks(), 1);
    assert!(mock.is_started());

    worker.shutdown();
}

#[test]
fn test_every_init_step_failure_is_retried() {
    for operation in [
        "create_task",
        "add_voltage_channel",
        "configure_clock",
        "configure_digital_trigger",
        "start_task",
    ] {
        let (driver, mock) = MockDaq::new(MockDaqConfig::scripted());
        mock.inject(FaultInjection::FailFirst {
            operation,
            count: 2,
        });
        let state = Arc::new(AcquisitionState::new(Configuration::new(1000, 10)));
        let worker = AcquisitionWorker::new(driver, Arc::clone(&state), fast_settings())
            .spawn()
            .expect("Failed to spawn worker");

        assert!(
            wait_for(Duration::from_secs(5), || state.phase() == WorkerPhase::Armed),
            "worker did not recover from {operation} failures"
        );
        assert_eq!(state.stats().faults, 2, "{operation}");
        assert_eq!(mock.max_live_tasks(), 1, "{operation}");

        worker.shutdown();
        assert_eq!(mock.live_tasks(), 0, "{operation}");
    }
}

#[test]
fn test_read_failure_rebuilds_task_and_resumes_publishing() {
    let (driver, mock) = MockDaq::new(MockDaqConfig::scripted());
    let state = Arc::new(AcquisitionState::new(Configuration::new(1000, 3)));
    let worker = AcquisitionWorker::new(driver, Arc::clone(&state), fast_settings())
        .spawn()
        .expect("Failed to spawn worker");
    assert!(wait_for(Duration::from_secs(3), || state.phase()
        == WorkerPhase::Armed));

    mock.queue_capture(vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    assert!(wait_for(Duration::from_secs(3), || state.stats().captures == 1));

    mock.inject(FaultInjection::FailFirst {
        operation: "read_data",
        count: 2,
    });
    assert!(wait_for(Duration::from_secs(3), || state.stats().faults == 2));
    assert!(wait_for(Duration::from_secs(3), || state.phase()
        == WorkerPhase::Armed));

    // The previous capture stays readable throughout recovery.
    let before = state.read_snapshot().expect("Snapshot lost during fault");
    assert_eq!(
        before.channel(2).expect("Channel 2 missing").samples,
        vec![2.0, 2.0, 2.0]
    );

    mock.queue_capture(vec![3.0, 3.0, 3.0, 4.0, 4.0, 4.0]);
    assert!(wait_for(Duration::from_secs(3), || state.stats().captures == 2));
    let after = state.read_snapshot().expect("Snapshot missing");
    assert_eq!(
        after.channel(1).expect("Channel 1 missing").samples,
        vec![3.0, 3.0, 3.0]
    );
    assert!(after.captured_at() >= before.captured_at());

    worker.shutdown();
    assert_eq!(mock.max_live_tasks(), 1);
    assert_eq!(mock.successes("create_task"), 3);
}

#[test]
fn test_long_fault_run_keeps_retrying() {
    let (driver, mock) = MockDaq::new(MockDaqConfig::scripted());
    mock.inject(FaultInjection::FailFirst {
        operation: "create_task",
        count: 8,
    });
    let state = Arc::new(AcquisitionState::new(Configuration::new(1000, 10)));
    let worker = AcquisitionWorker::new(driver, Arc::clone(&state), fast_settings())
        .spawn()
        .expect("Failed to spawn worker");

    assert!(wait_for(Duration::from_secs(5), || state.phase()
        == WorkerPhase::Armed));
    assert_eq!(state.stats().faults, 8);
    assert_eq!(mock.count("create_task"), 9);
    assert_eq!(state.stats().initializations, 1);

    worker.shutdown();
    assert_eq!(mock.live_tasks(), 0);
}

#[test]
fn test_reconfigure_during_fault_applies_latest_request() {
    let (driver, mock) = MockDaq::new(MockDaqConfig::scripted());
    mock.inject(FaultInjection::FailFirst {
        operation: "configure_clock",
        count: 3,
    });
    let state = Arc::new(AcquisitionState::new(Configuration::new(1000, 10)));
    let worker = AcquisitionWorker::new(driver, Arc::clone(&state), fast_settings())
        .spawn()
        .expect("Failed to spawn worker");
    assert!(wait_for(Duration::from_secs(3), || state.stats().faults >= 1));

    state.set_desired_configuration(Configuration::new(2500, 25));

    assert!(wait_for(Duration::from_secs(3), || state
        .applied_configuration()
        == Some(Configuration::new(2500, 25))));
    assert_eq!(mock.configured_points(), 25);

    worker.shutdown();
}
