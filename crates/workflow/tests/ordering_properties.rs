//! Property-based tests for workflow ordering.
//!
//! Random DAGs are generated with edges only from lower to higher indices,
//! so every generated graph is acyclic.

#![allow(clippy::unwrap_used)]

mod common;

use common::{Journal, Tracked, context, primary};
use proptest::prelude::*;
use steward_workflow::{Dependent, WorkflowBuilder};

fn dag_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2usize..8).prop_flat_map(|size| {
        let edges = proptest::collection::vec((0..size, 0..size), 0..size * 2).prop_map(
            |pairs| {
                pairs
                    .into_iter()
                    .filter(|(from, to)| from < to)
                    .collect::<Vec<_>>()
            },
        );
        (Just(size), edges)
    })
}

fn build(size: usize, edges: &[(usize, usize)], journal: &Journal) -> steward_workflow::Workflow {
    let mut builder = WorkflowBuilder::new("random").with_max_concurrency(3);
    for node in 0..size {
        let name = format!("n{node}");
        let mut dependent = Dependent::mutating(name.clone(), Tracked::new(&name, journal));
        for (from, _) in edges.iter().filter(|(_, to)| *to == node) {
            dependent = dependent.depends_on(format!("n{from}"));
        }
        builder = builder.add(dependent);
    }
    builder.build().unwrap()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn prop_reconcile_creates_dependencies_first((size, edges) in dag_strategy()) {
        let journal = Journal::default();
        let workflow = build(size, &edges, &journal);

        let result = runtime().block_on(workflow.reconcile(&primary(), &context()));

        let log = journal.entries();
        prop_assert_eq!(log.len(), size);
        prop_assert!(result.all_ready());
        for (from, to) in &edges {
            let first = log.iter().position(|e| *e == format!("create:n{from}")).unwrap();
            let second = log.iter().position(|e| *e == format!("create:n{to}")).unwrap();
            prop_assert!(first < second, "n{} must precede n{}", from, to);
        }
    }

    #[test]
    fn prop_cleanup_deletes_dependents_first((size, edges) in dag_strategy()) {
        let journal = Journal::default();
        let workflow = build(size, &edges, &journal);
        let rt = runtime();
        let ctx = context();
        rt.block_on(workflow.reconcile(&primary(), &ctx));

        let result = rt.block_on(workflow.cleanup(&primary(), &ctx));

        let log = journal.with_prefix("delete:");
        prop_assert_eq!(log.len(), size);
        prop_assert!(result.all_ready());
        for (from, to) in &edges {
            let upstream = log.iter().position(|e| *e == format!("delete:n{from}")).unwrap();
            let downstream = log.iter().position(|e| *e == format!("delete:n{to}")).unwrap();
            prop_assert!(downstream < upstream, "n{} must be deleted before n{}", to, from);
        }
    }
}
