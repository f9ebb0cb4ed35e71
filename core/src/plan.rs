//! The submitted-plan JSON boundary (spec §6). Accepts the alias pairs
//! `type`/`operation` and `dependsOn`/`dependencies`; `output` is parsed
//! and discarded (informational only, per spec).

use serde::Deserialize;
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{OperationKind, Plan, PlanJob};

#[derive(Deserialize)]
struct RawPlan {
    jobs: Vec<RawJob>,
    #[serde(default, rename = "baseExecutionId")]
    base_execution_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct RawJob {
    id: String,
    #[serde(rename = "type")]
    type_alias: Option<OperationKind>,
    operation: Option<OperationKind>,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(rename = "dependsOn")]
    depends_on_alias: Option<Vec<String>>,
    dependencies: Option<Vec<String>>,
    /// Informational only (`"$<id>"`); never consulted by the core.
    #[allow(dead_code)]
    output: Option<String>,
}

/// Parse and structurally validate a submitted plan. Does not touch the
/// store; admission (persisting it) is the orchestrator's job.
pub fn parse_plan(raw_json: &serde_json::Value) -> Result<Plan, CoreError> {
    let raw: RawPlan = serde_json::from_value(raw_json.clone())
        .map_err(|e| CoreError::PlanValidation(format!("malformed plan: {e}")))?;

    if raw.jobs.is_empty() {
        return Err(CoreError::PlanValidation("plan has no jobs".to_string()));
    }

    let mut jobs = Vec::with_capacity(raw.jobs.len());
    let mut seen_ids = std::collections::HashSet::new();

    for job in raw.jobs {
        let operation = job
            .operation
            .or(job.type_alias)
            .ok_or_else(|| CoreError::PlanValidation(format!("job '{}' has no operation/type", job.id)))?;
        let dependencies = job.dependencies.or(job.depends_on_alias).unwrap_or_default();

        if !seen_ids.insert(job.id.clone()) {
            return Err(CoreError::PlanValidation(format!(
                "duplicate job id '{}'",
                job.id
            )));
        }

        jobs.push(PlanJob {
            id: job.id,
            operation,
            params: job.params,
            dependencies,
        });
    }

    let plan = Plan {
        jobs,
        base_execution_id: raw.base_execution_id,
    };
    validate_dag(&plan)?;
    Ok(plan)
}

/// Dependency-graph structural checks shared by admission: every
/// dependency id resolves to a job in this plan (dangling ids are only
/// acceptable when `baseExecutionId` is set — that cross-execution check
/// happens in the orchestrator, which has store access), and the graph
/// has no cycles.
fn validate_dag(plan: &Plan) -> Result<(), CoreError> {
    use petgraph::algo::is_cyclic_directed;
    use petgraph::graph::DiGraph;
    use std::collections::HashMap;

    let ids: std::collections::HashSet<&str> = plan.jobs.iter().map(|j| j.id.as_str()).collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let mut index = HashMap::new();
    for job in &plan.jobs {
        index.insert(job.id.as_str(), graph.add_node(job.id.as_str()));
    }
    for job in &plan.jobs {
        for dep in &job.dependencies {
            if !ids.contains(dep.as_str()) && plan.base_execution_id.is_none() {
                return Err(CoreError::PlanValidation(format!(
                    "job '{}' depends on unknown id '{}'",
                    job.id, dep
                )));
            }
            if let Some(&dep_idx) = index.get(dep.as_str()) {
                graph.add_edge(index[job.id.as_str()], dep_idx, ());
            }
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(CoreError::PlanValidation(
            "dependency graph contains a cycle".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_type_and_dependson_aliases() {
        let raw = json!({
            "jobs": [
                {"id": "a", "type": "generateImage", "params": {}, "output": "$a"},
                {"id": "b", "operation": "generate", "params": {}, "dependsOn": ["a"], "output": "$b"}
            ]
        });
        let plan = parse_plan(&raw).unwrap();
        assert_eq!(plan.jobs.len(), 2);
        assert_eq!(plan.jobs[1].dependencies, vec!["a".to_string()]);
    }

    #[test]
    fn rejects_cycle() {
        let raw = json!({
            "jobs": [
                {"id": "a", "operation": "generate", "dependencies": ["b"]},
                {"id": "b", "operation": "generate", "dependencies": ["a"]}
            ]
        });
        assert!(parse_plan(&raw).is_err());
    }

    #[test]
    fn rejects_dangling_dependency_without_base_execution() {
        let raw = json!({
            "jobs": [{"id": "a", "operation": "generate", "dependencies": ["ghost"]}]
        });
        assert!(parse_plan(&raw).is_err());
    }

    #[test]
    fn allows_dangling_dependency_with_base_execution() {
        let raw = json!({
            "baseExecutionId": Uuid::nil(),
            "jobs": [{"id": "a", "operation": "generate", "dependencies": ["ghost"]}]
        });
        assert!(parse_plan(&raw).is_ok());
    }

    #[test]
    fn rejects_empty_jobs() {
        let raw = json!({"jobs": []});
        assert!(parse_plan(&raw).is_err());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let raw = json!({
            "jobs": [
                {"id": "a", "operation": "generate"},
                {"id": "a", "operation": "merge"}
            ]
        });
        assert!(parse_plan(&raw).is_err());
    }
}
