//! Fan-out over HTTP.
//!
//! Instead of running K workers in one process, the invoker calls the single-worker
//! entry point K times so each worker gets its own execution instance. Every call runs
//! as a detached task: when the per-call timeout hits, the invoker stops waiting and
//! records a failure, but nothing is cancelled on the remote side.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::{
    config::{MAX_CALLS, MAX_DURATION_SECONDS},
    domain::{
        error::PersistorError,
        models::{CallFailure, FunctionResponse, InvocationRequest, InvocationSummary, InvokerSummary},
        ports::FunctionClient,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokerSettings {
    pub call_timeout: Duration,
    pub inter_call_delay: Duration,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(75),
            inter_call_delay: Duration::from_millis(250),
        }
    }
}

enum CallResult {
    Succeeded { messages_persisted: usize },
    Failed(CallFailure),
}

pub struct Invoker {
    client: Arc<dyn FunctionClient>,
    settings: InvokerSettings,
}

impl Invoker {
    pub fn new(client: Arc<dyn FunctionClient>, settings: InvokerSettings) -> Self {
        Self { client, settings }
    }

    /// Issues `calls` staggered calls (at most `MAX_CALLS`) and waits for each at most
    /// the per-call timeout.
    pub async fn invoke(&self, calls: usize, request: InvocationRequest) -> InvokerSummary {
        if calls > MAX_CALLS {
            warn!("{} calls requested, issuing {}", calls, MAX_CALLS);
        }
        let calls = calls.min(MAX_CALLS);
        let call_timeout = self
            .settings
            .call_timeout
            .min(Duration::from_secs_f64(MAX_DURATION_SECONDS));
        info!(
            "Invoking {} functions ({} workers each, timeout {:?}, delay {:?})",
            calls, request.workers_per_call, call_timeout, self.settings.inter_call_delay
        );

        let mut pending = Vec::with_capacity(calls);
        for call in 0..calls {
            if call > 0 {
                tokio::time::sleep(self.settings.inter_call_delay).await;
            }
            let client = self.client.clone();
            let request = request.clone();
            debug!("Starting call {}", call);
            let handle = tokio::spawn(async move { client.invoke(&request).await });
            pending.push((call, Instant::now() + call_timeout, handle));
        }

        let results = join_all(pending.into_iter().map(|(call, deadline, handle)| async move {
            // Dropping the handle on timeout detaches the task instead of aborting it.
            match timeout_at(deadline, handle).await {
                Err(_) => failure(call, PersistorError::InvokerCallFailed {
                    call,
                    reason: format!("no response within {:?}", call_timeout),
                }),
                Ok(Err(join_error)) => failure(call, PersistorError::InvokerCallFailed {
                    call,
                    reason: join_error.to_string(),
                }),
                Ok(Ok(Err(e))) => failure(call, PersistorError::InvokerCallFailed {
                    call,
                    reason: e.to_string(),
                }),
                Ok(Ok(Ok(response))) => evaluate(call, response),
            }
        }))
        .await;

        let mut summary = InvokerSummary {
            requested: calls,
            ..InvokerSummary::default()
        };
        for result in results {
            match result {
                CallResult::Succeeded { messages_persisted } => {
                    summary.succeeded += 1;
                    summary.messages_persisted += messages_persisted;
                }
                CallResult::Failed(failure) => {
                    summary.failed += 1;
                    summary.failures.push(failure);
                }
            }
        }

        info!(
            "Invocation finished: {} succeeded, {} failed, {} messages persisted",
            summary.succeeded, summary.failed, summary.messages_persisted
        );
        summary
    }
}

fn failure(call: usize, error: PersistorError) -> CallResult {
    warn!("Call {} failed: {}", call, error);
    CallResult::Failed(CallFailure {
        call,
        reason: error.to_string(),
    })
}

fn evaluate(call: usize, response: FunctionResponse) -> CallResult {
    if !response.is_success() {
        return failure(call, PersistorError::InvokerCallFailed {
            call,
            reason: format!("status {}: {}", response.status, response.body),
        });
    }

    // Functions that do not answer with a summary still count as successful.
    let messages_persisted = serde_json::from_str::<InvocationSummary>(&response.body)
        .map(|s| s.messages_persisted)
        .unwrap_or(0);
    debug!("Call {} succeeded ({} messages persisted)", call, messages_persisted);
    CallResult::Succeeded { messages_persisted }
}
