use crate::error::{self, Error, Result};
use crate::finalizer::CleanupAgent;
use crate::metrics::ShimControllerMetrics;
use crate::reconciler::{Reconciled, Requeue, ShimReconciler};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::Api;
use models::node::NodeInventory;
use models::shim::{Shim, ShimClient, ShimKey};
use snafu::ResultExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{event, instrument, Level};

// Failed passes are retried after 1s, 2s, 4s, ... up to five minutes.
const BACKOFF_BASE_MILLIS: u64 = 2;
const BACKOFF_FACTOR: u64 = 500;
const BACKOFF_MAX_DELAY: Duration = Duration::from_secs(300);
const BACKOFF_MAX_STEPS: u32 = 16;

/// Delay before retrying a `Shim` whose last `failures` passes failed.
pub fn backoff_delay(failures: u32) -> Duration {
    ExponentialBackoff::from_millis(BACKOFF_BASE_MILLIS)
        .factor(BACKOFF_FACTOR)
        .max_delay(BACKOFF_MAX_DELAY)
        .nth(failures.clamp(1, BACKOFF_MAX_STEPS) as usize - 1)
        .unwrap_or(BACKOFF_MAX_DELAY)
}

/// State shared by every reconciliation pass.
pub struct Context<C: ShimClient, I: NodeInventory, A: CleanupAgent> {
    reconciler: ShimReconciler<C, I, A>,
    metrics: ShimControllerMetrics,
    pass_timeout: Duration,
    failures: Mutex<HashMap<ShimKey, u32>>,
}

impl<C, I, A> Context<C, I, A>
where
    C: ShimClient,
    I: NodeInventory,
    A: CleanupAgent,
{
    pub fn new(
        reconciler: ShimReconciler<C, I, A>,
        metrics: ShimControllerMetrics,
        pass_timeout: Duration,
    ) -> Self {
        Context {
            reconciler,
            metrics,
            pass_timeout,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one bounded reconciliation pass and turns its outcome into a requeue action.
    #[instrument(skip(self, key), fields(shim = %key), err)]
    pub async fn run_pass(&self, key: &ShimKey) -> Result<Action> {
        let reconciled = tokio::time::timeout(self.pass_timeout, self.reconciler.reconcile(key))
            .await
            .context(error::PassTimedOutSnafu {
                key: key.clone(),
                timeout: self.pass_timeout,
            })??;

        match &reconciled {
            Reconciled {
                status: Some(status),
                ..
            } => self.metrics.emit_metrics(key, status),
            Reconciled {
                status: None,
                requeue: Requeue::Never,
            } => self.metrics.forget(key),
            _ => {}
        }

        Ok(match reconciled.requeue {
            Requeue::Immediately => {
                self.reset_failures(key);
                Action::requeue(Duration::ZERO)
            }
            Requeue::After(delay) => {
                self.reset_failures(key);
                Action::requeue(delay)
            }
            Requeue::Never => {
                self.reset_failures(key);
                Action::await_change()
            }
            Requeue::Backoff => Action::requeue(self.record_failure(key)),
        })
    }

    /// Counts a failed pass for `key` and returns how long to wait before the next one.
    pub fn record_failure(&self, key: &ShimKey) -> Duration {
        let failures = match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key.clone()).or_insert(0);
                *count = count.saturating_add(1);
                *count
            }
            Err(_) => BACKOFF_MAX_STEPS,
        };
        backoff_delay(failures)
    }

    fn reset_failures(&self, key: &ShimKey) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }
}

async fn reconcile<C, I, A>(shim: Arc<Shim>, ctx: Arc<Context<C, I, A>>) -> Result<Action>
where
    C: ShimClient + 'static,
    I: NodeInventory + 'static,
    A: CleanupAgent + 'static,
{
    ctx.run_pass(&shim.key()).await
}

fn error_policy<C, I, A>(shim: Arc<Shim>, error: &Error, ctx: Arc<Context<C, I, A>>) -> Action
where
    C: ShimClient,
    I: NodeInventory,
    A: CleanupAgent,
{
    let key = shim.key();
    let delay = ctx.record_failure(&key);
    event!(
        Level::WARN,
        shim = %key,
        %error,
        retry_in = ?delay,
        "Reconciliation pass failed, backing off."
    );
    Action::requeue(delay)
}

/// The ShimController rolls shim installations across the nodes each `Shim` selects.
///
/// Passes for a single `Shim` never overlap, while distinct `Shim`s are reconciled concurrently.
/// Any `Node` event triggers a pass for every `Shim`, since label or install report changes can
/// move a node into or out of a rollout.
pub struct ShimController<C: ShimClient, I: NodeInventory, A: CleanupAgent> {
    shims: Api<Shim>,
    nodes: Api<Node>,
    context: Arc<Context<C, I, A>>,
}

impl<C, I, A> ShimController<C, I, A>
where
    C: ShimClient + 'static,
    I: NodeInventory + 'static,
    A: CleanupAgent + 'static,
{
    pub fn new(
        k8s_client: kube::Client,
        watch_namespace: Option<&str>,
        context: Context<C, I, A>,
    ) -> Self {
        let shims = match watch_namespace {
            Some(namespace) => Api::namespaced(k8s_client.clone(), namespace),
            None => Api::all(k8s_client.clone()),
        };
        ShimController {
            shims,
            nodes: Api::all(k8s_client),
            context: Arc::new(context),
        }
    }

    /// Runs the controller until it is asked to shut down.
    pub async fn run(self) {
        let controller = Controller::new(self.shims, watcher::Config::default());
        let shim_store = controller.store();

        controller
            .watches(self.nodes, watcher::Config::default(), move |_node: Node| {
                shim_store
                    .state()
                    .iter()
                    .map(|shim| ObjectRef::from_obj(&**shim))
                    .collect::<Vec<_>>()
            })
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.context)
            .for_each(|result| {
                match result {
                    Ok((shim, action)) => {
                        event!(Level::DEBUG, %shim, ?action, "Reconciled Shim.");
                    }
                    Err(err) => {
                        event!(Level::WARN, %err, "Failed to reconcile Shim.");
                    }
                }
                futures::future::ready(())
            })
            .await;
    }
}
