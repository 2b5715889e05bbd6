//! Per-event dispatch task: run the pipeline and classify the result.

use crate::retry::RetryPolicy;
use event_puller_core::{
    CancellationToken, DispatchError, DispatchPipeline, EventBundle, Outcome, OutcomeKind,
};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

/// Map a dispatch result to the settlement it calls for.
///
/// Success acknowledges, a permanent failure rejects, anything else releases
/// with the delay `policy` computes for `delivery_count`.
#[must_use]
pub fn classify(
    result: &Result<(), DispatchError>,
    delivery_count: u32,
    policy: &RetryPolicy,
) -> OutcomeKind {
    match result {
        Ok(()) => OutcomeKind::Acknowledge,
        Err(error) if error.is_permanent() => OutcomeKind::Reject,
        Err(_) => OutcomeKind::Release {
            delay: policy.release_delay(delivery_count),
        },
    }
}

/// A classified dispatch, as delivered to the completion loop.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Settlement for the bundle's lock token.
    pub outcome: Outcome,
    /// Time spent in the pipeline.
    pub elapsed: Duration,
}

/// Dispatch one bundle and produce exactly one outcome for it.
///
/// A panic anywhere in the pipeline is caught and treated as a transient
/// failure.
pub async fn dispatch_bundle(
    pipeline: DispatchPipeline,
    bundle: EventBundle,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> Completion {
    let started = Instant::now();
    let EventBundle {
        envelope,
        lock_token,
        delivery_count,
    } = bundle;

    let result = match AssertUnwindSafe(pipeline.dispatch(&envelope, &cancel))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(DispatchError::HandlerPanicked(envelope.event_name().to_string())),
    };

    let kind = classify(&result, delivery_count, &policy);
    match &result {
        Ok(()) => tracing::trace!(
            event_name = envelope.event_name(),
            lock_token = %lock_token,
            "Event dispatched"
        ),
        Err(error) => tracing::debug!(
            event_name = envelope.event_name(),
            lock_token = %lock_token,
            delivery_count,
            outcome = %kind,
            error = %error,
            "Event dispatch failed"
        ),
    }

    Completion {
        outcome: Outcome {
            lock_token,
            kind,
        },
        elapsed: started.elapsed(),
    }
}
