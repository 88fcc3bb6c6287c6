//! Logging Middleware
//!
//! Brackets every transaction with structured log lines: an entry line at
//! start and an exit line with duration and outcome.

use async_trait::async_trait;
use std::time::Instant;
use tracing::{info, warn};

use super::{Middleware, MiddlewareContext, Next};
use crate::error::Result;
use crate::state::SagaState;

/// Middleware that logs transaction entry, exit, and duration
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl<S: SagaState> Middleware<S> for LoggingMiddleware {
    async fn handle(&self, ctx: MiddlewareContext<S>, next: Next<S>) -> Result<()> {
        let started = Instant::now();
        info!(
            transaction = ctx.transaction_name(),
            id = ctx.transaction_id(),
            "transaction started"
        );

        let result = next.run(ctx.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => info!(
                transaction = ctx.transaction_name(),
                id = ctx.transaction_id(),
                elapsed_ms,
                "transaction completed"
            ),
            Err(e) => warn!(
                transaction = ctx.transaction_name(),
                id = ctx.transaction_id(),
                elapsed_ms,
                error = %e,
                "transaction failed"
            ),
        }

        result
    }
}
