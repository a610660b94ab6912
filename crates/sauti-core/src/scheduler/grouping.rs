//! Operation grouping and the group selection tie-break.

use crate::job::{JobItem, Operation};

/// Items of one operation, in the order they were popped.
#[derive(Debug, Clone)]
pub struct OperationGroup {
    pub operation: Operation,
    pub items: Vec<JobItem>,
}

impl OperationGroup {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Partition items by operation. Groups appear in first-seen order.
pub fn partition_by_operation(items: Vec<JobItem>) -> Vec<OperationGroup> {
    let mut groups: Vec<OperationGroup> = Vec::new();
    for item in items {
        let operation = item.operation();
        match groups.iter_mut().find(|group| group.operation == operation) {
            Some(group) => group.items.push(item),
            None => groups.push(OperationGroup {
                operation,
                items: vec![item],
            }),
        }
    }
    groups
}

/// Index of the group to dispatch this cycle.
///
/// Prefers the largest group served by the currently active engine, falling
/// back to the largest group overall. Ties go to the first-seen group.
pub fn select_group(groups: &[OperationGroup], active_engine: Option<&str>) -> Option<usize> {
    if let Some(active) = active_engine {
        let preferred = largest(groups, |group| {
            let family = group.operation.engine_family();
            !family.is_persistent() && family.as_str() == active
        });
        if preferred.is_some() {
            return preferred;
        }
    }
    largest(groups, |_| true)
}

fn largest(groups: &[OperationGroup], eligible: impl Fn(&OperationGroup) -> bool) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, group) in groups.iter().enumerate() {
        if group.is_empty() || !eligible(group) {
            continue;
        }
        match best {
            Some(current) if groups[current].len() >= group.len() => {}
            _ => best = Some(index),
        }
    }
    best
}
