use std::time::Duration;

use pmax::{InvocationParameters, ResourceLimits};
use tokio::task::JoinSet;

use super::{fixture_bridge, leftover_entries, sample_input};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_are_isolated() {
    let (bridge, scratch) = fixture_bridge("halve");

    let mut tasks = JoinSet::new();
    for seed in 0..12u8 {
        let bridge = bridge.clone();
        tasks.spawn(async move {
            let input = sample_input(256 + seed as usize * 32, seed);
            let output = bridge
                .run(&input, &InvocationParameters::default())
                .await
                .expect("run failed");
            (input, output)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (input, output) = joined.unwrap();
        assert_eq!(output, input[..input.len() / 2]);
    }

    assert_eq!(bridge.cache().compilations(), 1);
    assert_eq!(leftover_entries(&scratch), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failures_do_not_affect_other_calls() {
    let (good, good_scratch) = fixture_bridge("halve");
    let (bad, bad_scratch) = fixture_bridge("fail");

    let mut tasks = JoinSet::new();
    for seed in 0..6u8 {
        let good = good.clone();
        let bad = bad.clone();
        tasks.spawn(async move {
            let input = sample_input(128, seed);
            let ok = good.run(&input, &InvocationParameters::default()).await;
            let failed = bad.run(&input, &InvocationParameters::default()).await;
            (input, ok, failed)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (input, ok, failed) = joined.unwrap();
        assert_eq!(ok.expect("halve succeeds"), input[..64]);
        assert_eq!(failed.expect_err("fail fails").exit_code(), Some(1));
    }

    assert_eq!(leftover_entries(&good_scratch), 0);
    assert_eq!(leftover_entries(&bad_scratch), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_call_still_releases_instance() {
    let (bridge, scratch) = fixture_bridge("spin");
    bridge.warm_up().await.unwrap();

    let limits = ResourceLimits::empty().with_fuel(200_000_000);
    let params = InvocationParameters::default();
    let call = bridge.run_with_report(b"data", &params, Some(&limits));

    // Give up long before the guest runs out of fuel
    let timed_out = tokio::time::timeout(Duration::from_millis(5), call).await;
    assert!(timed_out.is_err());

    // The guest keeps running on its blocking thread and cleans up when done
    for _ in 0..200 {
        if leftover_entries(&scratch) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("instance filesystem was not released");
}
