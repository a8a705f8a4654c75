//! Gated, bounded-concurrency execution of a workflow in either direction.
//!
//! Reconcile starts at the roots and releases a node once every predecessor
//! succeeded. Cleanup starts at the leaves and releases a node once every
//! dependent is settled. Ready nodes run concurrently, bounded by a semaphore.
//!
//! A reconcile pass whose node fails its reconcile precondition finishes with
//! a cleanup pass over that node and everything below it.

use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use steward_core::{Error, ManagedObject};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::condition::ConditionKind;
use crate::context::Context;
use crate::dependent::Operations;
use crate::graph::{Workflow, WorkflowNode};
use crate::result::{NodeOutcome, WorkflowMode, WorkflowResult};

type NodeFuture<'a> = BoxFuture<'a, (usize, NodeOutcome)>;

pub(crate) async fn run(
    workflow: &Workflow,
    mode: WorkflowMode,
    primary: &ManagedObject,
    ctx: &Context,
) -> WorkflowResult {
    let nodes = workflow.nodes();
    let declared = workflow
        .topological_order()
        .into_iter()
        .map(String::from)
        .collect();
    let mut result = WorkflowResult::new(mode, declared);
    let mut outcomes: Vec<Option<NodeOutcome>> = vec![None; nodes.len()];

    debug!(workflow = workflow.name(), %mode, primary = %primary.id, "Running workflow");

    let everything = vec![true; nodes.len()];
    for (idx, outcome) in drive(workflow, mode, &everything, primary, ctx).await {
        let Some(node) = nodes.get(idx) else {
            continue;
        };
        // `Deleted` is a placeholder here; the delete pass records the real outcome.
        if !outcome.is_deleted() {
            result.record(&node.name, outcome.clone());
        }
        if let Some(slot) = outcomes.get_mut(idx) {
            *slot = Some(outcome);
        }
    }

    if mode == WorkflowMode::Reconcile {
        let doomed = marked_for_delete(nodes, workflow.topological_indices(), &outcomes);
        skip_below_inactive(
            nodes,
            workflow.topological_indices(),
            &doomed,
            &mut outcomes,
            &mut result,
        );
        if doomed.iter().any(|marked| *marked) {
            let removed = drive(workflow, WorkflowMode::Cleanup, &doomed, primary, ctx).await;
            for (idx, outcome) in removed {
                if let Some(node) = nodes.get(idx) {
                    let outcome = match outcome {
                        NodeOutcome::Succeeded(operations) => NodeOutcome::Deleted(operations),
                        other => other,
                    };
                    result.record(&node.name, outcome);
                }
            }
        }
    }

    debug!(
        workflow = workflow.name(),
        %mode,
        all_ready = result.all_ready(),
        errored = result.has_errors(),
        "Workflow finished"
    );
    result
}

/// Run every node in `scope` in `mode` order and return outcomes in
/// completion order. Nodes outside `scope` are neither run nor waited on.
async fn drive(
    workflow: &Workflow,
    mode: WorkflowMode,
    scope: &[bool],
    primary: &ManagedObject,
    ctx: &Context,
) -> Vec<(usize, NodeOutcome)> {
    let nodes = workflow.nodes();
    let in_scope = |idx: usize| scope.get(idx).copied().unwrap_or(false);
    let mut outcomes: Vec<Option<NodeOutcome>> = vec![None; nodes.len()];
    let mut started = vec![false; nodes.len()];
    let mut completed = Vec::new();
    let permits = Semaphore::new(workflow.max_concurrency());
    let mut in_flight: FuturesUnordered<NodeFuture<'_>> = FuturesUnordered::new();

    let mut order: Vec<usize> = workflow.topological_indices().to_vec();
    if mode == WorkflowMode::Cleanup {
        order.reverse();
    }

    for &idx in &order {
        if in_scope(idx) && is_eligible(nodes, &outcomes, scope, idx, mode) {
            if let Some(node) = nodes.get(idx) {
                if let Some(flag) = started.get_mut(idx) {
                    *flag = true;
                }
                in_flight.push(run_node(workflow.name(), node, idx, mode, primary, ctx, &permits));
            }
        }
    }

    while let Some((idx, outcome)) = in_flight.next().await {
        let Some(node) = nodes.get(idx) else {
            continue;
        };
        if let Some(slot) = outcomes.get_mut(idx) {
            *slot = Some(outcome.clone());
        }
        completed.push((idx, outcome));

        let downstream = match mode {
            WorkflowMode::Reconcile => &node.successors,
            WorkflowMode::Cleanup => &node.predecessors,
        };
        for &next in downstream {
            let already = started.get(next).copied().unwrap_or(true);
            if already || !in_scope(next) || !is_eligible(nodes, &outcomes, scope, next, mode) {
                continue;
            }
            if let Some(next_node) = nodes.get(next) {
                if let Some(flag) = started.get_mut(next) {
                    *flag = true;
                }
                in_flight.push(run_node(
                    workflow.name(),
                    next_node,
                    next,
                    mode,
                    primary,
                    ctx,
                    &permits,
                ));
            }
        }
    }
    completed
}

/// Reconcile: every predecessor succeeded. Cleanup: every dependent in
/// `scope` settled.
fn is_eligible(
    nodes: &[WorkflowNode],
    outcomes: &[Option<NodeOutcome>],
    scope: &[bool],
    idx: usize,
    mode: WorkflowMode,
) -> bool {
    let Some(node) = nodes.get(idx) else {
        return false;
    };
    let outcome_of = |i: &usize| outcomes.get(*i).and_then(Option::as_ref);
    match mode {
        WorkflowMode::Reconcile => node
            .predecessors
            .iter()
            .all(|p| outcome_of(p).is_some_and(NodeOutcome::is_succeeded)),
        WorkflowMode::Cleanup => node.successors.iter().all(|s| {
            !scope.get(*s).copied().unwrap_or(false)
                || outcome_of(s).is_some_and(NodeOutcome::is_settled)
        }),
    }
}

/// Nodes whose reconcile precondition failed, plus every node below them.
fn marked_for_delete(
    nodes: &[WorkflowNode],
    order: &[usize],
    outcomes: &[Option<NodeOutcome>],
) -> Vec<bool> {
    let mut marked: Vec<bool> = outcomes
        .iter()
        .map(|outcome| outcome.as_ref().is_some_and(NodeOutcome::is_deleted))
        .collect();
    for &idx in order {
        let Some(node) = nodes.get(idx) else {
            continue;
        };
        let below_marked = node
            .predecessors
            .iter()
            .any(|p| marked.get(*p).copied().unwrap_or(false));
        if below_marked {
            debug!(dependent = %node.name, "Marking dependent for delete");
            if let Some(flag) = marked.get_mut(idx) {
                *flag = true;
            }
        }
    }
    marked
}

/// Everything below an inactive node is inactive too, unless it is about to
/// be deleted.
fn skip_below_inactive(
    nodes: &[WorkflowNode],
    order: &[usize],
    doomed: &[bool],
    outcomes: &mut [Option<NodeOutcome>],
    result: &mut WorkflowResult,
) {
    for &idx in order {
        let Some(node) = nodes.get(idx) else {
            continue;
        };
        if outcomes.get(idx).is_some_and(Option::is_some)
            || doomed.get(idx).copied().unwrap_or(false)
        {
            continue;
        }
        let below_inactive = node.predecessors.iter().any(|p| {
            outcomes
                .get(*p)
                .and_then(Option::as_ref)
                .is_some_and(NodeOutcome::is_skipped)
        });
        if below_inactive {
            debug!(dependent = %node.name, "Skipping dependent below inactive node");
            result.record(&node.name, NodeOutcome::SkippedInactive);
            if let Some(slot) = outcomes.get_mut(idx) {
                *slot = Some(NodeOutcome::SkippedInactive);
            }
        }
    }
}

fn run_node<'a>(
    workflow: &'a str,
    node: &'a WorkflowNode,
    idx: usize,
    mode: WorkflowMode,
    primary: &'a ManagedObject,
    ctx: &'a Context,
    permits: &'a Semaphore,
) -> NodeFuture<'a> {
    async move {
        let Ok(_permit) = permits.acquire().await else {
            return (idx, NodeOutcome::Errored(Error::ShuttingDown));
        };
        let started = Instant::now();
        let outcome = match mode {
            WorkflowMode::Reconcile => reconcile_node(node, primary, ctx).await,
            WorkflowMode::Cleanup => cleanup_node(node, primary, ctx).await,
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            NodeOutcome::Errored(error) => {
                warn!(workflow, dependent = %node.name, %mode, elapsed_ms, error = %error, "Dependent failed");
            }
            other => {
                debug!(workflow, dependent = %node.name, %mode, elapsed_ms, outcome = ?other, "Dependent finished");
            }
        }
        (idx, outcome)
    }
    .boxed()
}

/// Outcome of a gating check: proceed, or stop with the given outcome.
enum Gate {
    Open,
    Closed(NodeOutcome),
}

async fn activation_gate(node: &WorkflowNode, primary: &ManagedObject, ctx: &Context) -> Gate {
    match node
        .runtime
        .evaluate(ConditionKind::Activation, primary, ctx)
        .await
    {
        None | Some(Ok(true)) => Gate::Open,
        Some(Ok(false)) => Gate::Closed(NodeOutcome::SkippedInactive),
        Some(Err(error)) => Gate::Closed(NodeOutcome::NotReady {
            operations: Default::default(),
            reason: error.to_string(),
        }),
    }
}

async fn reconcile_node(node: &WorkflowNode, primary: &ManagedObject, ctx: &Context) -> NodeOutcome {
    if let Gate::Closed(outcome) = activation_gate(node, primary, ctx).await {
        return outcome;
    }

    match node
        .runtime
        .evaluate(ConditionKind::ReconcilePrecondition, primary, ctx)
        .await
    {
        None | Some(Ok(true)) => {}
        Some(Ok(false)) => return NodeOutcome::Deleted(Operations::default()),
        Some(Err(error)) => {
            return NodeOutcome::NotReady {
                operations: Operations::default(),
                reason: error.to_string(),
            };
        }
    }

    let operations = match node.runtime.reconcile(primary, ctx).await {
        Ok(operations) => operations,
        Err(error) => return NodeOutcome::Errored(error),
    };

    match node.runtime.evaluate(ConditionKind::Ready, primary, ctx).await {
        None | Some(Ok(true)) => NodeOutcome::Succeeded(operations),
        Some(Ok(false)) => NodeOutcome::NotReady {
            operations,
            reason: "readiness condition not met".to_string(),
        },
        Some(Err(error)) => NodeOutcome::NotReady {
            operations,
            reason: error.to_string(),
        },
    }
}

async fn cleanup_node(node: &WorkflowNode, primary: &ManagedObject, ctx: &Context) -> NodeOutcome {
    if let Gate::Closed(outcome) = activation_gate(node, primary, ctx).await {
        return outcome;
    }

    match node
        .runtime
        .evaluate(ConditionKind::CleanupReady, primary, ctx)
        .await
    {
        None | Some(Ok(true)) => {}
        Some(Ok(false)) => {
            return NodeOutcome::NotReady {
                operations: Default::default(),
                reason: "cleanup condition not met".to_string(),
            };
        }
        Some(Err(error)) => {
            return NodeOutcome::NotReady {
                operations: Default::default(),
                reason: error.to_string(),
            };
        }
    }

    match node.runtime.delete(primary, ctx).await {
        Ok(operations) => NodeOutcome::Succeeded(operations),
        Err(error) => NodeOutcome::Errored(error),
    }
}
