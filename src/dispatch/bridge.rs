//! Per-request isolated execution.
//!
//! Every dispatch creates a fresh [`ExecutionUnit`], moves the request
//! descriptor into its own task and waits for exactly one reply on a
//! oneshot channel. The task is torn down as soon as that reply (or a
//! fault, or the deadline) arrives. Units are never reused and share no
//! mutable state.

use std::{
    any::Any,
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::task::{AbortOnDropHandle, TaskTracker};
use tracing::Instrument;

use crate::{error::GatewayError, observability::metrics};

/// A single-use unit of work serving one request.
#[async_trait]
pub trait ExecutionUnit: Send + 'static {
    /// Closed set of operations this unit understands.
    type Method: Copy + Send + fmt::Display + FromStr + 'static;
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Run one operation, consuming the unit.
    async fn invoke(
        self,
        method: Self::Method,
        input: Self::Input,
    ) -> Result<Self::Output, GatewayError>;
}

/// Creates a fresh unit for every dispatch.
pub trait UnitFactory: Send + Sync + 'static {
    type Unit: ExecutionUnit;

    fn create(&self) -> Self::Unit;
}

pub type MethodOf<F> = <<F as UnitFactory>::Unit as ExecutionUnit>::Method;
pub type InputOf<F> = <<F as UnitFactory>::Unit as ExecutionUnit>::Input;
pub type OutputOf<F> = <<F as UnitFactory>::Unit as ExecutionUnit>::Output;

pub struct Dispatcher<F: UnitFactory> {
    factory: F,
    tracker: TaskTracker,
    deadline: Duration,
    spawned: AtomicU64,
}

impl<F: UnitFactory> fmt::Debug for Dispatcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("deadline", &self.deadline)
            .field("units_spawned", &self.units_spawned())
            .field("units_running", &self.tracker.len())
            .finish()
    }
}

impl<F: UnitFactory> Dispatcher<F> {
    /// `tracker` is shared with the server so shutdown can wait for units
    /// that are still running.
    pub fn new(factory: F, tracker: TaskTracker, deadline: Duration) -> Self {
        Self {
            factory,
            tracker,
            deadline,
            spawned: AtomicU64::new(0),
        }
    }

    /// Map an endpoint name to a method of the unit.
    pub fn resolve(name: &str) -> Result<MethodOf<F>, GatewayError> {
        name.parse()
            .map_err(|_| GatewayError::UnknownEndpoint(name.to_string()))
    }

    /// Dispatch by name. Unknown names fail before any unit is created.
    pub async fn dispatch(&self, name: &str, input: InputOf<F>) -> Result<OutputOf<F>, GatewayError> {
        let method = Self::resolve(name)?;
        self.dispatch_method(method, input).await
    }

    /// Run `method` in a fresh unit and wait for its single reply.
    pub async fn dispatch_method(
        &self,
        method: MethodOf<F>,
        input: InputOf<F>,
    ) -> Result<OutputOf<F>, GatewayError> {
        let start = Instant::now();
        let unit = self.factory.create();
        self.spawned.fetch_add(1, Ordering::Relaxed);

        let (reply_tx, reply_rx) = oneshot::channel();
        let span = tracing::info_span!("execution_unit", endpoint = %method);
        let mut handle = AbortOnDropHandle::new(self.tracker.spawn(
            async move {
                let reply = unit.invoke(method, input).await;
                // The receiver only goes away when the caller gave up.
                let _ = reply_tx.send(reply);
            }
            .instrument(span),
        ));

        let result = match tokio::time::timeout(self.deadline, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => match (&mut handle).await {
                Err(e) if e.is_panic() => Err(GatewayError::UnitFault(panic_message(
                    e.into_panic(),
                ))),
                _ => Err(GatewayError::UnitFault(
                    "execution unit terminated without reply".into(),
                )),
            },
            Err(_) => {
                handle.abort();
                tracing::warn!(
                    endpoint = %method,
                    deadline_ms = self.deadline.as_millis() as u64,
                    "Execution unit exceeded its deadline and was aborted"
                );
                Err(GatewayError::Timeout(
                    self.deadline.as_millis(),
                    format!("endpoint '{method}'"),
                ))
            }
        };
        // Dropping the handle aborts the task if it is somehow still alive.
        drop(handle);

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        metrics::record_dispatch(&method.to_string(), outcome, start.elapsed().as_secs_f64());

        result
    }

    /// Total number of units created since startup.
    pub fn units_spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("execution unit panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("execution unit panicked: {message}")
    } else {
        "execution unit panicked".to_string()
    }
}
