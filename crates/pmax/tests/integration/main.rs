//! Integration tests for pmax
//!
//! Each test drives a real WASI command module. The fixtures under
//! `tests/fixtures` are WAT text, which wasmtime compiles directly.

use std::path::Path;
use std::sync::Arc;

use pmax::{Bridge, BytesSource, Config};
use tempfile::TempDir;

mod bridge_run;
mod failures;
mod isolation;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get a fixture module's text
pub(crate) fn fixture_module(name: &str) -> Vec<u8> {
    let path = format!("{FIXTURES_PATH}/{name}.wat");
    std::fs::read(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Config whose per-call filesystems live under `scratch`
pub(crate) fn test_config(scratch: &Path) -> Config {
    let mut config = Config::default().with_scratch_dir(scratch);
    config.optimize = false;
    config
}

/// Bridge running the named fixture, plus the scratch root it uses
pub(crate) fn fixture_bridge(name: &str) -> (Arc<Bridge>, TempDir) {
    let scratch = TempDir::new().expect("Failed to create scratch dir");
    let source = Arc::new(BytesSource::new(name, fixture_module(name)));
    let bridge = Bridge::new(test_config(scratch.path()), source).expect("Failed to build bridge");
    (Arc::new(bridge), scratch)
}

/// Number of entries left under a scratch root
pub(crate) fn leftover_entries(scratch: &TempDir) -> usize {
    std::fs::read_dir(scratch.path())
        .expect("Failed to read scratch dir")
        .count()
}

/// Deterministic pseudo-image of `len` bytes
pub(crate) fn sample_input(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
