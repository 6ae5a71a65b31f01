//! Mock implementation of the Notifier trait for testing.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Notifier, NotifierError};

/// One captured `notify` or `alert` call. `recipients` is `None` for
/// `notify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Delivery {
    pub(crate) channel: String,
    pub(crate) message: String,
    pub(crate) recipients: Option<Vec<String>>,
}

/// Records every delivery attempt, optionally failing all of them.
pub(crate) struct MockNotifier {
    deliveries: Mutex<Vec<Delivery>>,
    fail: AtomicBool,
}

impl MockNotifier {
    pub(crate) fn new() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Creates a mock whose deliveries are recorded and then rejected.
    pub(crate) fn failing() -> Self {
        let mock = Self::new();
        mock.fail.store(true, Ordering::SeqCst);
        mock
    }

    pub(crate) fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    fn record(
        &self,
        channel: &str,
        message: &str,
        recipients: Option<Vec<String>>,
    ) -> Result<(), NotifierError> {
        self.deliveries.lock().unwrap().push(Delivery {
            channel: channel.to_string(),
            message: message.to_string(),
            recipients,
        });

        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifierError::Api {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "mock failure".to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, channel: &str, message: &str) -> Result<(), NotifierError> {
        self.record(channel, message, None)
    }

    async fn alert(
        &self,
        channel: &str,
        message: &str,
        recipients: &[String],
    ) -> Result<(), NotifierError> {
        self.record(channel, message, Some(recipients.to_vec()))
    }
}
