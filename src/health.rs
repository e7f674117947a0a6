// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Error;
use std::sync::Mutex;

/// Sink for unrecoverable or noteworthy runtime errors
///
/// Cancellation (`Shutdown`) is never reported here.
pub trait Health: Send + Sync {
    /// Reports an error.
    fn error(&self, err: &Error);
}

/// Health sink that logs and otherwise ignores reports
#[derive(Default)]
pub struct NoopHealth;

impl Health for NoopHealth {
    fn error(&self, err: &Error) {
        log::error!("health: {err}");
    }
}

/// Health sink that collects reports, for tests
#[derive(Default)]
pub struct MemHealth {
    errors: Mutex<Vec<String>>,
}

impl MemHealth {
    /// Returns the collected reports.
    #[must_use]
    pub fn reported(&self) -> Vec<String> {
        self.errors.lock().expect("lock is poisoned").clone()
    }
}

impl Health for MemHealth {
    fn error(&self, err: &Error) {
        self.errors
            .lock()
            .expect("lock is poisoned")
            .push(err.to_string());
    }
}

/// Routes an error to the health channel unless it is the cancellation kind.
pub(crate) fn report(health: &dyn Health, err: &Error) {
    if !err.is_shutdown() {
        health.error(err);
    }
}
