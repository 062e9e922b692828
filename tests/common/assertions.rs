//! Custom test assertions for integration tests

use post_dl::Event;
use std::path::Path;
use tokio::sync::broadcast;

/// Assert that `path` exists and holds exactly `len` bytes
pub fn assert_file_len(path: &Path, len: u64) {
    let meta = std::fs::metadata(path)
        .unwrap_or_else(|e| panic!("expected {} to exist: {e}", path.display()));
    assert_eq!(meta.len(), len, "unexpected size for {}", path.display());
}

/// Assert that no `.part` file is left under `dir`
pub fn assert_no_partials(dir: &Path) {
    for entry in walkdir::WalkDir::new(dir).into_iter().flatten() {
        assert!(
            !entry.file_name().to_string_lossy().ends_with(".part"),
            "leftover partial {}",
            entry.path().display()
        );
    }
}

/// Drain every event currently buffered in `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
