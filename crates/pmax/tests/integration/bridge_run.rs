use std::io;
use std::sync::{Arc, Mutex};

use pmax::{ExecutionStatus, InvocationParameters, ResourceLimits};

use super::{fixture_bridge, leftover_entries, sample_input};

#[tokio::test]
async fn test_halving_module() {
    let (bridge, scratch) = fixture_bridge("halve");
    let input = sample_input(4096, 7);
    let params = InvocationParameters::new(80.0, 1600)
        .with_delete_exif(true)
        .with_denoise(false);

    let output = bridge.run(&input, &params).await.expect("run failed");

    assert_eq!(output.len(), input.len() / 2);
    assert_eq!(output, input[..input.len() / 2]);
    assert_eq!(leftover_entries(&scratch), 0);
}

#[tokio::test]
async fn test_halving_odd_length() {
    let (bridge, _scratch) = fixture_bridge("halve");
    let input = sample_input(101, 1);

    let output = bridge
        .run(&input, &InvocationParameters::default())
        .await
        .expect("run failed");

    assert_eq!(output.len(), 50);
}

#[tokio::test]
async fn test_argument_vector() {
    let (bridge, _scratch) = fixture_bridge("argv");
    let params = InvocationParameters::new(80.0, 1600)
        .with_delete_exif(true)
        .with_denoise(false);

    let output = bridge.run(b"ignored", &params).await.expect("run failed");

    assert_eq!(output, b"pmax\080\01600\0true\0false\0");
}

#[tokio::test]
async fn test_argument_vector_fractional_quality() {
    let (bridge, _scratch) = fixture_bridge("argv");
    let params = InvocationParameters::new(82.5, 640)
        .with_delete_exif(false)
        .with_denoise(true);

    let output = bridge.run(b"ignored", &params).await.expect("run failed");

    assert_eq!(output, b"pmax\082.5\0640\0false\0true\0");
}

#[tokio::test]
async fn test_run_with_defaults() {
    let (bridge, _scratch) = fixture_bridge("argv");

    let output = bridge.run_with_defaults(b"x").await.expect("run failed");

    assert_eq!(output, b"pmax\080\01600\0true\0false\0");
}

#[tokio::test]
async fn test_report_carries_diagnostics() {
    let (bridge, _scratch) = fixture_bridge("halve");
    let input = sample_input(64, 3);

    let report = bridge
        .run_with_report(&input, &InvocationParameters::default(), None)
        .await
        .expect("run failed");

    assert_eq!(report.output.len(), 32);
    assert_eq!(report.execution.status, ExecutionStatus::Ok);
    assert_eq!(report.execution.exit_code, Some(0));
    assert_eq!(report.execution.diagnostics(), "halved input\n");
    assert!(report.execution.fuel_consumed.is_none());
}

#[tokio::test]
async fn test_report_fuel_consumed() {
    let (bridge, _scratch) = fixture_bridge("halve");
    let limits = ResourceLimits::empty().with_fuel(10_000_000);

    let report = bridge
        .run_with_report(&sample_input(64, 3), &InvocationParameters::default(), Some(&limits))
        .await
        .expect("run failed");

    let consumed = report.execution.fuel_consumed.expect("fuel was metered");
    assert!(consumed > 0);
    assert!(consumed < 10_000_000);
}

#[tokio::test]
async fn test_bridge_is_reusable() {
    let (bridge, scratch) = fixture_bridge("halve");

    for len in [2, 10, 1000] {
        let output = bridge
            .run(&sample_input(len, 0), &InvocationParameters::default())
            .await
            .expect("run failed");
        assert_eq!(output.len(), len / 2);
    }

    assert_eq!(bridge.cache().compilations(), 1);
    assert_eq!(leftover_entries(&scratch), 0);
}

#[tokio::test]
async fn test_chatty_stderr_is_truncated() {
    let (bridge, scratch) = fixture_bridge("chatty");
    let limits = ResourceLimits::empty().with_max_diagnostics(4096);

    let report = bridge
        .run_with_report(b"data", &InvocationParameters::default(), Some(&limits))
        .await
        .expect("stderr past the limit must not fail the call");

    assert_eq!(report.output, b"ok");
    assert_eq!(report.execution.exit_code, Some(0));
    assert_eq!(report.execution.stderr, vec![b'.'; 4096]);
    assert!(report.execution.stderr_truncated);
    assert_eq!(leftover_entries(&scratch), 0);
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_diagnostics_are_logged_with_exit_status() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let (bridge, _scratch) = fixture_bridge("halve");
    bridge
        .run(&sample_input(8, 0), &InvocationParameters::default())
        .await
        .expect("run failed");

    let logs = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    let line = logs
        .lines()
        .find(|line| line.contains("module finished"))
        .unwrap_or_else(|| panic!("no completion line in:\n{logs}"));
    assert!(line.contains("exit_code=0"), "{line}");
    assert!(line.contains(r#"diagnostics="halved input""#), "{line}");
}
