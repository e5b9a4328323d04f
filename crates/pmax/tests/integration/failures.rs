use std::sync::Arc;

use pmax::{
    Bridge, BytesSource, InvocationParameters, ModuleError, ParameterError, ResourceLimits,
    RunError, SandboxError,
};
use tempfile::TempDir;

use super::{fixture_bridge, leftover_entries, sample_input, test_config};

#[tokio::test]
async fn test_nonzero_exit_is_failure() {
    let (bridge, scratch) = fixture_bridge("fail");

    let err = bridge
        .run(b"not a jpeg", &InvocationParameters::default())
        .await
        .expect_err("module exits with status 1");

    match &err {
        RunError::ExecutionFailed {
            exit_code,
            diagnostics,
        } => {
            assert_eq!(*exit_code, 1);
            assert_eq!(diagnostics, "decode failed: not a JPEG\n");
        }
        other => panic!("expected ExecutionFailed, got {other:?}"),
    }
    assert_eq!(err.exit_code(), Some(1));
    assert!(!err.is_retryable());

    // The partial output written before exiting is discarded with the instance
    assert_eq!(leftover_entries(&scratch), 0);
}

#[tokio::test]
async fn test_high_exit_status() {
    let (bridge, scratch) = fixture_bridge("exit_status");

    let err = bridge
        .run(b"cmyk", &InvocationParameters::default())
        .await
        .expect_err("module exits with status 200");

    match &err {
        RunError::ExecutionFailed {
            exit_code,
            diagnostics,
        } => {
            assert_eq!(*exit_code, 200);
            assert_eq!(diagnostics, "unsupported colorspace\n");
        }
        other => panic!("expected ExecutionFailed, got {other:?}"),
    }
    assert_eq!(leftover_entries(&scratch), 0);
}

#[tokio::test]
async fn test_unremovable_input_keeps_module_failure() {
    let (bridge, scratch) = fixture_bridge("swap_input");

    let err = bridge
        .run(b"data", &InvocationParameters::default())
        .await
        .expect_err("module exits with status 1");

    match &err {
        RunError::ExecutionFailed {
            exit_code,
            diagnostics,
        } => {
            assert_eq!(*exit_code, 1);
            assert_eq!(diagnostics, "input replaced\n");
        }
        other => panic!("expected ExecutionFailed, got {other:?}"),
    }
    assert_eq!(leftover_entries(&scratch), 0);
}

#[tokio::test]
async fn test_trap_is_failure() {
    let (bridge, scratch) = fixture_bridge("trap");

    let err = bridge
        .run(&sample_input(16, 0), &InvocationParameters::default())
        .await
        .expect_err("module traps");

    match err {
        RunError::Trapped {
            fuel_exhausted,
            diagnostics,
            ..
        } => {
            assert!(!fuel_exhausted);
            assert!(diagnostics.is_empty());
        }
        other => panic!("expected Trapped, got {other:?}"),
    }
    assert_eq!(leftover_entries(&scratch), 0);
}

#[tokio::test]
async fn test_missing_output() {
    let (bridge, scratch) = fixture_bridge("no_output");

    let err = bridge
        .run(b"data", &InvocationParameters::default())
        .await
        .expect_err("module writes no output");

    match &err {
        RunError::OutputMissing { diagnostics } => {
            assert_eq!(diagnostics, "nothing to write\n");
        }
        other => panic!("expected OutputMissing, got {other:?}"),
    }
    assert_eq!(err.exit_code(), Some(0));
    assert_eq!(leftover_entries(&scratch), 0);
}

#[tokio::test]
async fn test_fuel_exhaustion() {
    let (bridge, scratch) = fixture_bridge("spin");
    let limits = ResourceLimits::empty().with_fuel(100_000);

    let err = bridge
        .run_with_report(b"data", &InvocationParameters::default(), Some(&limits))
        .await
        .expect_err("module never finishes");

    assert!(matches!(
        err,
        RunError::Trapped {
            fuel_exhausted: true,
            ..
        }
    ));
    assert_eq!(leftover_entries(&scratch), 0);
}

#[tokio::test]
async fn test_memory_limit() {
    let (bridge, _scratch) = fixture_bridge("grow");

    let limits = ResourceLimits::empty().with_max_memory(ResourceLimits::MB);
    let err = bridge
        .run_with_report(b"data", &InvocationParameters::default(), Some(&limits))
        .await
        .expect_err("growth is refused");
    assert_eq!(err.exit_code(), Some(4));

    // Under the default limit the same module succeeds with an empty output
    let output = bridge
        .run(b"data", &InvocationParameters::default())
        .await
        .expect("growth is allowed");
    assert!(output.is_empty());
}

#[tokio::test]
async fn test_output_limit() {
    let (bridge, scratch) = fixture_bridge("halve");
    let limits = ResourceLimits::empty().with_max_output(8);

    let err = bridge
        .run_with_report(&sample_input(100, 0), &InvocationParameters::default(), Some(&limits))
        .await
        .expect_err("output is over the limit");

    match err {
        RunError::Sandbox(SandboxError::FileTooLarge { size, limit, .. }) => {
            assert_eq!(size, 50);
            assert_eq!(limit, 8);
        }
        other => panic!("expected FileTooLarge, got {other:?}"),
    }
    assert_eq!(leftover_entries(&scratch), 0);
}

#[tokio::test]
async fn test_invalid_parameters() {
    let (bridge, scratch) = fixture_bridge("halve");

    let err = bridge
        .run(b"data", &InvocationParameters::new(120.0, 1600))
        .await
        .expect_err("quality is out of range");
    assert!(matches!(
        err,
        RunError::InvalidParameters(ParameterError::QualityOutOfRange(_))
    ));

    let err = bridge
        .run(b"data", &InvocationParameters::new(80.0, 0))
        .await
        .expect_err("size is zero");
    assert!(matches!(
        err,
        RunError::InvalidParameters(ParameterError::ZeroSize)
    ));

    // Rejected before the module is touched
    assert_eq!(bridge.cache().compilations(), 0);
    assert_eq!(leftover_entries(&scratch), 0);
}

#[tokio::test]
async fn test_module_unavailable() {
    let scratch = TempDir::new().unwrap();
    let source = Arc::new(BytesSource::new("garbage", b"\0asm garbage".as_slice()));
    let bridge = Bridge::new(test_config(scratch.path()), source).unwrap();

    let err = bridge
        .run(b"data", &InvocationParameters::default())
        .await
        .expect_err("module does not compile");

    assert!(matches!(
        err,
        RunError::ModuleUnavailable(ModuleError::Compile { .. })
    ));
    assert!(err.is_retryable());
    assert_eq!(leftover_entries(&scratch), 0);
}
