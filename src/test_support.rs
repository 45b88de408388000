//! Helpers shared by async tests.

use crate::control::{ControlNotifier, Notice};
use crate::ids::ControllerId;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Notifier that records every notice it is given.
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<(ControllerId, Notice)>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<(ControllerId, Notice)> {
        self.seen.lock().unwrap().clone()
    }

    /// Waits for the first notice matching `matches`.
    pub async fn wait_for(&self, matches: impl Fn(&Notice) -> bool) -> (ControllerId, Notice) {
        let mut found = None;
        eventually("notice", || {
            found = self.notices().into_iter().find(|(_, notice)| matches(notice));
            found.is_some()
        })
        .await;
        found.unwrap()
    }
}

#[async_trait]
impl ControlNotifier for RecordingNotifier {
    async fn notify(&self, controller: &ControllerId, notice: Notice) {
        self.seen.lock().unwrap().push((controller.clone(), notice));
    }
}
