//! Member-level diffing for bulk dependents.

use std::collections::BTreeMap;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use steward_core::{DependentFailure, Error, ManagedObject, Result};
use tracing::debug;

use crate::context::Context;
use crate::dependent::{BulkMutating, Operations};

/// Member operations needed to move from observed to desired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPlan<R> {
    pub create: Vec<(String, R)>,
    /// `(key, actual, desired)`
    pub update: Vec<(String, R, R)>,
    pub delete: Vec<(String, R)>,
    pub unchanged: Vec<String>,
}

impl<R> BulkPlan<R> {
    pub fn is_noop(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Diff two keyed sets.
///
/// Keys only in `desired` are created, keys only in `actual` are deleted,
/// keys in both are updated unless `matches(actual, desired)` holds.
pub fn plan<R, F>(
    actual: BTreeMap<String, R>,
    mut desired: BTreeMap<String, R>,
    matches: F,
) -> BulkPlan<R>
where
    F: Fn(&R, &R) -> bool,
{
    let mut plan = BulkPlan {
        create: Vec::new(),
        update: Vec::new(),
        delete: Vec::new(),
        unchanged: Vec::new(),
    };

    for (key, current) in actual {
        match desired.remove(&key) {
            None => plan.delete.push((key, current)),
            Some(wanted) if matches(&current, &wanted) => plan.unchanged.push(key),
            Some(wanted) => plan.update.push((key, current, wanted)),
        }
    }
    plan.create.extend(desired);
    plan
}

type MemberFuture<'a> = BoxFuture<'a, (String, Result<()>)>;

/// Apply a plan through `dependent`. Every member operation runs; the node
/// succeeds only if all of them did.
pub(crate) async fn apply<D: BulkMutating>(
    name: &str,
    dependent: &D,
    plan: BulkPlan<D::Resource>,
    primary: &ManagedObject,
    ctx: &Context,
) -> Result<Operations> {
    let operations = Operations {
        created: plan.create.len(),
        updated: plan.update.len(),
        deleted: plan.delete.len(),
        unchanged: plan.unchanged.len(),
    };
    debug!(
        dependent = name,
        create = operations.created,
        update = operations.updated,
        delete = operations.deleted,
        unchanged = operations.unchanged,
        "Applying bulk plan"
    );

    let mut members: Vec<MemberFuture<'_>> = Vec::new();
    for (key, actual) in plan.delete {
        members.push(
            async move {
                let outcome = dependent.delete(&key, actual, primary, ctx).await;
                (key, outcome)
            }
            .boxed(),
        );
    }
    for (key, wanted) in plan.create {
        members.push(
            async move {
                let outcome = dependent.create(&key, wanted, primary, ctx).await.map(drop);
                (key, outcome)
            }
            .boxed(),
        );
    }
    for (key, actual, wanted) in plan.update {
        members.push(
            async move {
                let outcome = dependent
                    .update(&key, actual, wanted, primary, ctx)
                    .await
                    .map(drop);
                (key, outcome)
            }
            .boxed(),
        );
    }

    let failures: Vec<DependentFailure> = join_all(members)
        .await
        .into_iter()
        .filter_map(|(key, outcome)| {
            outcome.err().map(|error| DependentFailure {
                dependent: format!("{name}[{key}]"),
                error: Box::new(error),
            })
        })
        .collect();

    match failures.len() {
        0 => Ok(operations),
        1 => Err(failures
            .into_iter()
            .next()
            .map_or_else(|| Error::adapter(name, "member failed"), |f| *f.error)),
        _ => Err(Error::dependents(failures)),
    }
}

/// Delete every observed member.
pub(crate) async fn delete_all<D: BulkMutating>(
    name: &str,
    dependent: &D,
    primary: &ManagedObject,
    ctx: &Context,
) -> Result<Operations> {
    let observed = dependent.secondaries(primary, ctx).await?;
    let plan = BulkPlan {
        create: Vec::new(),
        update: Vec::new(),
        delete: observed.into_iter().collect(),
        unchanged: Vec::new(),
    };
    apply(name, dependent, plan, primary, ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[(&str, u32)]) -> BTreeMap<String, u32> {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_string(), *value))
            .collect()
    }

    #[test]
    fn test_plan_classifies_every_key() {
        let actual = set(&[("a", 1), ("b", 1), ("c", 1)]);
        let desired = set(&[("b", 1), ("c", 2), ("d", 1)]);

        let plan = plan(actual, desired, |a, d| a == d);

        assert_eq!(plan.delete, vec![("a".to_string(), 1)]);
        assert_eq!(plan.create, vec![("d".to_string(), 1)]);
        assert_eq!(plan.update, vec![("c".to_string(), 1, 2)]);
        assert_eq!(plan.unchanged, vec!["b".to_string()]);
        assert!(!plan.is_noop());
    }

    #[test]
    fn test_custom_matcher_suppresses_updates() {
        let actual = set(&[("a", 1)]);
        let desired = set(&[("a", 5)]);

        let plan = plan(actual, desired, |_, _| true);

        assert!(plan.is_noop());
        assert_eq!(plan.unchanged, vec!["a".to_string()]);
    }

    #[test]
    fn test_empty_sets_are_noop() {
        let plan = plan(BTreeMap::<String, u32>::new(), BTreeMap::new(), |a, d| a == d);
        assert!(plan.is_noop());
    }
}
