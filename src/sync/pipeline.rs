//! Stage planning over the entity dependency graph.

use std::collections::HashSet;

use crate::types::EntityType;

/// Stages for a run of `target`, dependencies first, each entity type once.
///
/// Walks `EntityType::predecessors` depth-first; an entity type reachable through
/// several dependents is planned the first time it is reached.
pub fn plan(target: EntityType) -> Vec<EntityType> {
    let mut visited = HashSet::new();
    let mut stages = Vec::new();
    visit(target, &mut visited, &mut stages);
    stages
}

fn visit(entity: EntityType, visited: &mut HashSet<EntityType>, stages: &mut Vec<EntityType>) {
    if !visited.insert(entity) {
        return;
    }
    for predecessor in entity.predecessors() {
        visit(*predecessor, visited, stages);
    }
    stages.push(entity);
}
