use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use omniq_domain::{
    ExecutionError, NackOutcome, Task, TaskContext, TaskOutcome, TaskPriority, TaskQueue,
    TaskRegistry, WorkerEvent,
};

use crate::events::EventSink;

/// Everything one execution unit needs to run. Units are bound to a tenant
/// and a priority class; the lanes they drain follow from the class.
pub(crate) struct UnitContext {
    pub id: String,
    pub tenant_id: String,
    pub priority_class: TaskPriority,
    pub queue: Arc<dyn TaskQueue>,
    pub registry: Arc<TaskRegistry>,
    pub sink: EventSink,
    pub dequeue_timeout: Duration,
    pub idle_backoff: Duration,
    pub shutdown: CancellationToken,
    pub retire: watch::Receiver<bool>,
}

/// Grace period between cancelling an attempt's token at the deadline and
/// abandoning its future outright.
const CANCEL_WIND_DOWN: Duration = Duration::from_millis(250);

enum AttemptEnd {
    Finished(Result<Result<serde_json::Value, ExecutionError>, tokio::task::JoinError>),
    TimedOut,
}

/// Unit main loop. Exits on pool shutdown or when the pool retires this
/// unit; a task already in flight always runs to its outcome first.
///
/// Every dequeue is polled to completion. A broker dequeue that has popped
/// an id is mid-claim until the task document round-trip finishes; dropping
/// it there would lose the task, so retire and shutdown are only checked
/// between dequeues, bounded by the dequeue timeout.
pub(crate) async fn run_unit(ctx: UnitContext) {
    debug!(unit = %ctx.id, "execution unit started");
    loop {
        if ctx.shutdown.is_cancelled() || *ctx.retire.borrow() {
            break;
        }
        let dequeued = ctx
            .queue
            .dequeue(
                Some(&ctx.tenant_id),
                ctx.priority_class.dequeue_lanes(),
                ctx.dequeue_timeout,
            )
            .await;
        match dequeued {
            Ok(Some(task)) => process(&ctx, task).await,
            Ok(None) => {}
            Err(e) => {
                warn!(unit = %ctx.id, error = %e, "dequeue failed, backing off");
                sleep(ctx.idle_backoff).await;
            }
        }
    }
    debug!(unit = %ctx.id, "execution unit stopped");
}

async fn process(ctx: &UnitContext, task: Task) {
    let handler = match ctx.registry.handler(&task.kind) {
        Ok(handler) => handler,
        Err(e) => {
            // kind disappeared between enqueue and execution
            finish_failed(
                ctx,
                &task,
                ExecutionError::permanent(e.to_string()),
                false,
                0,
                0,
            )
            .await;
            return;
        }
    };

    let attempt_ctx = TaskContext {
        task_id: task.id.clone(),
        tenant_id: task.tenant_id.clone(),
        attempt: task.attempt_count,
        cancellation: ctx.shutdown.child_token(),
    };
    let wait_ms = (Utc::now() - task.ready_at).num_milliseconds().max(0) as u64;
    let started = Instant::now();
    let deadline = Duration::from_secs(task.timeout_seconds);

    // the attempt runs in its own task: a panicking handler fails the
    // attempt instead of killing the unit
    let mut attempt = {
        let task = task.clone();
        let attempt_ctx = attempt_ctx.clone();
        tokio::spawn(async move { handler.execute(&task, &attempt_ctx).await })
    };

    let end = tokio::select! {
        joined = &mut attempt => AttemptEnd::Finished(joined),
        _ = sleep(deadline) => {
            // cancel first so a cooperative handler can wind down, then
            // abandon whatever is left
            attempt_ctx.cancellation.cancel();
            if timeout(CANCEL_WIND_DOWN, &mut attempt).await.is_err() {
                attempt.abort();
            }
            AttemptEnd::TimedOut
        }
    };
    let run_ms = started.elapsed().as_millis() as u64;

    match end {
        AttemptEnd::Finished(Ok(Ok(value))) => {
            if let Err(e) = ctx.queue.ack(&task, value.clone()).await {
                warn!(unit = %ctx.id, task_id = %task.id, error = %e, "ack failed");
                return;
            }
            metrics::counter!("omniq_task_attempts_total", "outcome" => "completed").increment(1);
            metrics::histogram!("omniq_task_run_ms").record(run_ms as f64);
            ctx.sink.emit(WorkerEvent {
                task_id: task.id.clone(),
                tenant_id: task.tenant_id.clone(),
                kind: task.kind.clone(),
                priority: task.priority,
                outcome: TaskOutcome::Completed,
                wait_ms,
                run_ms,
                timed_out: false,
                finished_at: Utc::now(),
                result: Some(value),
            });
        }
        AttemptEnd::Finished(Ok(Err(error))) => {
            finish_failed(ctx, &task, error, false, wait_ms, run_ms).await
        }
        AttemptEnd::Finished(Err(join_error)) => {
            let error = if join_error.is_panic() {
                ExecutionError::transient(format!("handler panicked: {join_error}"))
            } else {
                ExecutionError::transient("handler task was cancelled")
            };
            warn!(unit = %ctx.id, task_id = %task.id, error = %error, "attempt crashed");
            finish_failed(ctx, &task, error, false, wait_ms, run_ms).await;
        }
        AttemptEnd::TimedOut => {
            let error = ExecutionError::transient(format!(
                "attempt timed out after {}s",
                task.timeout_seconds
            ));
            finish_failed(ctx, &task, error, true, wait_ms, run_ms).await;
        }
    }
}

async fn finish_failed(
    ctx: &UnitContext,
    task: &Task,
    error: ExecutionError,
    timed_out: bool,
    wait_ms: u64,
    run_ms: u64,
) {
    let outcome = match ctx.queue.nack(task, error).await {
        Ok(NackOutcome::Retried { .. }) => TaskOutcome::Retried,
        Ok(NackOutcome::DeadLettered) => TaskOutcome::DeadLettered,
        Err(e) => {
            warn!(unit = %ctx.id, task_id = %task.id, error = %e, "nack failed");
            return;
        }
    };
    let label = match outcome {
        TaskOutcome::Retried => "retried",
        _ => "dead_lettered",
    };
    metrics::counter!("omniq_task_attempts_total", "outcome" => label).increment(1);
    if timed_out {
        metrics::counter!("omniq_task_timeouts_total").increment(1);
    }
    ctx.sink.emit(WorkerEvent {
        task_id: task.id.clone(),
        tenant_id: task.tenant_id.clone(),
        kind: task.kind.clone(),
        priority: task.priority,
        outcome,
        wait_ms,
        run_ms,
        timed_out,
        finished_at: Utc::now(),
        result: None,
    });
}
