//! Asynchronous status callbacks to the orchestrator
//!
//! A callback is fired whenever a request's Provisioned or Configured
//! condition changes status or reason. Delivery never blocks a reconcile:
//! each notification becomes a tracked task that retries with a doubling
//! backoff, limited to a fixed number of concurrent deliveries. Shutdown
//! drains the tasks for a bounded time and then cancels whatever is left.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use hwplugin_common::crd::{AllocationRequest, Condition, ConditionReason, ConditionStatus};
use hwplugin_common::retry::{retry_with_backoff_if, RetryConfig};
use hwplugin_common::Error;

/// Concurrent deliveries allowed at once
pub const MAX_CONCURRENT_CALLBACKS: usize = 20;

/// Deadline for a single delivery attempt
pub const CALLBACK_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivery attempts per notification
pub const CALLBACK_MAX_ATTEMPTS: u32 = 3;

/// Receives condition changes worth reporting
#[cfg_attr(test, automock)]
pub trait StatusNotifier: Send + Sync {
    /// Report a changed condition; must not block
    fn notify(&self, request: &AllocationRequest, condition: &Condition);
}

/// Body POSTed to the callback URL
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    /// Name of the AllocationRequest
    pub node_allocation_request_id: String,
    /// Mapped status value
    pub status: &'static str,
    /// When the payload was built
    pub timestamp: DateTime<Utc>,
    /// Condition message for failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Map a condition to the status vocabulary the orchestrator understands
pub fn callback_status(condition: &Condition) -> &'static str {
    let reason = ConditionReason::parse(&condition.reason);
    match (condition.type_.as_str(), reason) {
        ("Provisioned", Some(ConditionReason::InProgress)) => "InProgress",
        ("Provisioned", Some(ConditionReason::Completed)) => "Completed",
        ("Provisioned", Some(ConditionReason::Failed)) => "Failed",
        ("Provisioned", Some(ConditionReason::TimedOut)) => "TimedOut",
        ("Provisioned", Some(ConditionReason::InvalidInput)) => "InvalidInput",
        ("Configured", Some(ConditionReason::InProgress)) => "InProgress",
        ("Configured", Some(ConditionReason::Completed | ConditionReason::ConfigApplied)) => {
            "ConfigurationApplied"
        }
        ("Configured", Some(ConditionReason::ConfigUpdate)) => "ConfigurationUpdateRequested",
        ("Configured", Some(ConditionReason::Failed)) => "Failed",
        ("Configured", Some(ConditionReason::TimedOut)) => "TimedOut",
        ("Configured", Some(ConditionReason::InvalidInput)) => "InvalidInput",
        _ => "Pending",
    }
}

/// Build the payload for a condition change
pub fn payload_for(request: &AllocationRequest, condition: &Condition) -> CallbackPayload {
    let failed = condition.status == ConditionStatus::False
        && ConditionReason::parse(&condition.reason).is_some_and(|r| r.is_terminal_failure());
    CallbackPayload {
        node_allocation_request_id: request.name_any(),
        status: callback_status(condition),
        timestamp: Utc::now(),
        error: failed.then(|| condition.message.clone()),
    }
}

/// HTTP notifier with bounded concurrency and tracked background delivery
pub struct CallbackNotifier {
    http: reqwest::Client,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    retry: RetryConfig,
}

impl CallbackNotifier {
    /// Create a notifier with the default retry schedule (1s, 2s)
    pub fn new() -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(CALLBACK_ATTEMPT_TIMEOUT)
            .build()
            .map_err(|e| {
                Error::internal_with_context("callback", format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            http,
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_CALLBACKS)),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            retry: RetryConfig::doubling(CALLBACK_MAX_ATTEMPTS, Duration::from_secs(1)),
        })
    }

    /// Override the retry schedule
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Deliveries still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting callbacks and wait for in-flight ones.
    ///
    /// Returns false when the timeout elapsed and remaining deliveries were
    /// cancelled.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            info!("all status callbacks delivered");
            return true;
        }
        warn!(
            remaining = self.tracker.len(),
            "status callbacks still in flight at shutdown, cancelling"
        );
        self.cancel.cancel();
        self.tracker.wait().await;
        false
    }
}

impl StatusNotifier for CallbackNotifier {
    fn notify(&self, request: &AllocationRequest, condition: &Condition) {
        let Some(url) = request.callback_url() else {
            debug!("no callback configured, skipping notification");
            return;
        };
        if self.tracker.is_closed() {
            warn!(request = %request.name_any(), "shutting down, dropping status callback");
            return;
        }

        let delivery = Delivery {
            http: self.http.clone(),
            url: url.to_string(),
            payload: payload_for(request, condition),
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
        };
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
                _ = cancel.cancelled() => {
                    warn!(url = %delivery.url, "cancelled while waiting for a callback slot");
                    return;
                }
            };
            if let Err(e) = delivery.run().await {
                warn!(error = %e, "status callback abandoned");
            }
        });
    }
}

struct Delivery {
    http: reqwest::Client,
    url: String,
    payload: CallbackPayload,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl Delivery {
    async fn run(&self) -> Result<(), Error> {
        let attempts = retry_with_backoff_if(
            &self.retry,
            "status_callback",
            || self.send(),
            Error::is_retryable,
        );
        tokio::select! {
            result = attempts => {
                result?;
                info!(
                    request = %self.payload.node_allocation_request_id,
                    status = self.payload.status,
                    "status callback delivered"
                );
                Ok(())
            }
            _ = self.cancel.cancelled() => Err(Error::cancelled("status callback retry")),
        }
    }

    async fn send(&self) -> Result<(), Error> {
        let response = self
            .http
            .post(&self.url)
            .json(&self.payload)
            .send()
            .await
            .map_err(|e| Error::callback(&self.url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::callback(
                &self.url,
                format!("received non-success status code {}", status.as_u16()),
            ));
        }
        Ok(())
    }
}
