//! Mock implementation of the LiquidityDataSource trait for testing.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{LiquidityDataError, LiquidityDataSource, LiquiditySnapshot};

/// Serves a fixed snapshot and counts fetches.
pub(crate) struct MockLiquiditySource {
    snapshot: Mutex<LiquiditySnapshot>,
    fetch_count: AtomicUsize,
    fail: AtomicBool,
}

impl MockLiquiditySource {
    pub(crate) fn new(snapshot: LiquiditySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            fetch_count: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Creates a mock whose every fetch is rejected by the provider.
    pub(crate) fn failing() -> Self {
        let mock = Self::new(LiquiditySnapshot::default());
        mock.fail.store(true, Ordering::SeqCst);
        mock
    }

    pub(crate) fn set_snapshot(&self, snapshot: LiquiditySnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiquidityDataSource for MockLiquiditySource {
    async fn fetch(&self) -> Result<LiquiditySnapshot, LiquidityDataError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(LiquidityDataError::Rejected {
                code: -1,
                message: "mock failure".to_string(),
            });
        }

        Ok(self.snapshot.lock().unwrap().clone())
    }
}
