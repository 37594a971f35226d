//! Completes a job's execution once the command it queued has run.
//!
//! Grounded on the reference `JobFinishingMiddleware`: it reads the job id
//! the context carries, runs the rest of the chain, and then — whether or
//! not that chain succeeded — calls back into the controller to mark the
//! execution complete. A request with no job id (i.e. not dispatched from
//! the background controller) passes straight through.
//!
//! The reference wires this in "above recovery", meaning it's one of the
//! first things to run and the last to finish. The equivalent placement
//! here is registering it with [`cqrs_router::RouterBuilder::use_middleware`]
//! at the root scope, so it wraps every route in the router.

use crate::controller::Controller;
use cqrs_router::{Middleware, MiddlewareResult, Next, Payload};
use cqrs_core::DispatchContext;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::warn;

/// Marks a job's execution complete after its queued command has run.
pub struct JobFinishingMiddleware {
    controller: Arc<Controller>,
}

impl JobFinishingMiddleware {
    #[must_use]
    pub const fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }
}

impl Middleware for JobFinishingMiddleware {
    fn name(&self) -> &'static str {
        "job_finishing"
    }

    fn call(&self, ctx: DispatchContext, payload: Payload, next: Next) -> BoxFuture<'static, MiddlewareResult> {
        let Some(job_id) = ctx.job_id() else {
            return next(ctx, payload);
        };

        let controller = Arc::clone(&self.controller);
        Box::pin(async move {
            let result = next(ctx, payload).await;

            if let Err(error) = controller.finish_task_for_job(job_id).await {
                warn!(%job_id, %error, "failed to finish task for job");
            }

            result
        })
    }
}
