//! Concurrent "wait for all, first answer wins" invocation

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tracing::{debug, warn};

use super::Outcome;
use crate::ocpp::RequestId;

pub type Invocation<R> = BoxFuture<'static, anyhow::Result<Option<R>>>;

/// Invocation that calls `handler` only when polled, so a handler panicking
/// before it hands back its future fails inside its own task.
pub fn deferred<C, A, R, F, Fut>(handler: &Arc<F>, ctx: C, arg: A) -> Invocation<R>
where
    C: Send + 'static,
    A: Send + 'static,
    R: Send + 'static,
    F: Fn(C, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<R>>> + Send + 'static,
{
    let handler = Arc::clone(handler);
    Box::pin(async move { handler(ctx, arg).await })
}

/// Run every invocation on its own task and wait for all of them.
///
/// The answer is the first non-`None` result in registration order. An error
/// or panic counts as an answer (`ExceptionOccurred`) at its position; the
/// remaining results are still awaited but discarded. Returns `None` when
/// nobody answered.
pub async fn first_answer<R: Send + 'static>(
    action: &str,
    request_id: &RequestId,
    invocations: Vec<Invocation<R>>,
) -> Option<Outcome<R>> {
    let count = invocations.len();
    let tasks: Vec<_> = invocations.into_iter().map(tokio::spawn).collect();
    let results = join_all(tasks).await;

    let mut chosen = None;
    for (position, result) in results.into_iter().enumerate() {
        let answer = match result {
            Ok(Ok(Some(answer))) => Some(Outcome::Response(answer)),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!(%request_id, action, position, error = %e, "handler failed");
                Some(Outcome::exception(format!("{e:#}")))
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "handler task was cancelled".to_string()
                };
                warn!(%request_id, action, position, error = %message, "handler panicked");
                Some(Outcome::exception(message))
            }
        };

        if chosen.is_none() {
            if let Some(answer) = answer {
                debug!(%request_id, action, position, handlers = count, outcome = answer.kind(), "answer chosen");
                chosen = Some(answer);
            }
        }
    }
    chosen
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
