//! Retry policies for `FLOOD_WAIT` and transient network errors.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::errors::InvocationError;

/// Controls how the client reacts when an RPC call fails.
///
/// `Continue(delay)` sleeps for `delay` and sends the request again;
/// `Break(())` hands the error to the caller.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
#[derive(Debug)]
pub struct RetryContext {
    pub fail_count: NonZeroU32,
    pub slept_so_far: Duration,
    pub error: InvocationError,
}

/// Never retry.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetries;

impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Sleep through short flood waits and retry transient failures.
///
/// Flood waits up to `threshold` are slept through; longer ones are
/// surfaced as [`InvocationError::FloodWait`]. Transient failures are
/// retried after `retry_delay`. Nothing is retried more than `max_retries`
/// times.
#[derive(Clone, Debug)]
pub struct AutoSleep {
    pub threshold: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for AutoSleep {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(10),
            max_retries: 10,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy for AutoSleep {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        if ctx.fail_count.get() > self.max_retries {
            return ControlFlow::Break(());
        }
        if let Some(wait) = ctx.error.flood_wait() {
            if wait <= self.threshold {
                tracing::warn!("[ferrogram] flood wait of {}s, sleeping before retry", wait.as_secs());
                return ControlFlow::Continue(wait);
            }
            return ControlFlow::Break(());
        }
        if ctx.error.is_transient() {
            tracing::info!("[ferrogram] {}: retrying in {:?}", ctx.error, self.retry_delay);
            return ControlFlow::Continue(self.retry_delay);
        }
        ControlFlow::Break(())
    }
}

/// The error a caller sees once the policy gives up. Rate limits are
/// reported with their duration attached.
pub(crate) fn surface(error: InvocationError) -> InvocationError {
    match error.flood_wait() {
        Some(wait) => InvocationError::FloodWait(wait),
        None => error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RpcError;

    fn ctx(n: u32, error: InvocationError) -> RetryContext {
        RetryContext { fail_count: NonZeroU32::new(n).unwrap(), slept_so_far: Duration::ZERO, error }
    }

    fn flood(secs: u32) -> InvocationError {
        InvocationError::Rpc(RpcError::from_telegram(420, &format!("FLOOD_WAIT_{secs}")))
    }

    #[test]
    fn short_flood_is_slept_through() {
        let policy = AutoSleep::default();
        assert_eq!(policy.should_retry(&ctx(1, flood(5))), ControlFlow::Continue(Duration::from_secs(5)));
    }

    #[test]
    fn long_flood_is_surfaced_with_its_duration() {
        let policy = AutoSleep::default();
        let c = ctx(1, flood(30));
        assert_eq!(policy.should_retry(&c), ControlFlow::Break(()));
        assert!(matches!(surface(c.error), InvocationError::FloodWait(d) if d == Duration::from_secs(30)));
    }

    #[test]
    fn retries_are_bounded() {
        let policy = AutoSleep { max_retries: 2, ..AutoSleep::default() };
        assert!(policy.should_retry(&ctx(2, InvocationError::Timeout)).is_continue());
        assert!(policy.should_retry(&ctx(3, InvocationError::Timeout)).is_break());
    }

    #[test]
    fn rpc_errors_are_not_retried() {
        let e = InvocationError::Rpc(RpcError::from_telegram(400, "PEER_ID_INVALID"));
        assert!(AutoSleep::default().should_retry(&ctx(1, e)).is_break());
        assert!(NoRetries.should_retry(&ctx(1, flood(1))).is_break());
    }
}
