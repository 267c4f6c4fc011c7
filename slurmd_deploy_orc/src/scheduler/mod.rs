// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

//! Derive the order of the deployment requests from the convergence gates.
//!
//! Every request is a [`Step`]. A step may run only when all the steps it
//! depends on have completed:
//!
//! - an attachment depends on the deploy of its service;
//! - a relation depends on the deploys of both endpoints and on its gates;
//! - a deploy depends on its gates;
//! - a convergence on service `s` depends on the deploy of `s`, on all the
//!   attachments to `s` and on all the relations of `s` that do not
//!   themselves wait for that convergence.
//!
//! Steps are grouped in waves: the steps of a wave do not depend on each
//! other and can be issued together.

use slurmd_deploy_api::error::DeployError;
use slurmd_deploy_api::relation::{PlannedRelation, RelationEdge};
use slurmd_deploy_api::service::ServiceDescriptor;
use slurmd_deploy_api::status::ConvergenceTarget;


#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Deploy(String),
    /// Service and resource name.
    Attach(String, String),
    Relate(RelationEdge),
    Converge(ConvergenceTarget),
}

impl Step {
    /// Service whose state is changed or observed by this step, if one.
    fn subject(&self) -> Option<&str> {
        match self {
            Step::Deploy(service) | Step::Attach(service, _) => Some(service.as_str()),
            Step::Converge(target) => Some(target.service.as_str()),
            Step::Relate(_) => None,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Step::Deploy(service) => write!(f, "deploy {}", service),
            Step::Attach(service, resource) => write!(f, "attach {} to {}", resource, service),
            Step::Relate(edge) => write!(f, "relate {}", edge),
            Step::Converge(target) => write!(f, "converge {}", target),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub steps: Vec<Step>,
    /// Indices into `steps`, in execution order.
    pub waves: Vec<Vec<usize>>,
}

impl DeploymentPlan {
    pub fn wave_steps(&self, wave: usize) -> Vec<&Step> {
        self.waves[wave].iter().map(|i| &self.steps[*i]).collect()
    }

    /// Position of the wave containing the given step.
    pub fn wave_of(&self, step: &Step) -> Option<usize> {
        self.waves.iter().position(|wave| wave.iter().any(|i| &self.steps[*i] == step))
    }
}

impl std::fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (i, wave) in self.waves.iter().enumerate() {
            writeln!(
                f,
                "wave {}: {}",
                i,
                wave.iter().map(|x| self.steps[*x].to_string()).collect::<Vec<String>>().join(", ")
            )?;
        }
        Ok(())
    }
}

fn plan_error(reason: String) -> anyhow::Error {
    DeployError::Plan(reason).into()
}

struct Graph {
    steps: Vec<Step>,
    // deps[i]: steps that must complete before step i.
    deps: Vec<std::collections::BTreeSet<usize>>,
}

impl Graph {
    fn add(&mut self, step: Step) -> usize {
        self.steps.push(step);
        self.deps.push(std::collections::BTreeSet::new());
        self.steps.len() - 1
    }

    fn find(&self, step: &Step) -> Option<usize> {
        self.steps.iter().position(|x| x == step)
    }

    fn depends_transitively(&self, from: usize, on: usize) -> bool {
        let mut visited = std::collections::HashSet::new();
        let mut stack = vec![from];
        while let Some(cur) = stack.pop() {
            for dep in &self.deps[cur] {
                if *dep == on {
                    return true;
                }
                if visited.insert(*dep) {
                    stack.push(*dep);
                }
            }
        }
        false
    }

    /// Kahn's algorithm, one wave per level.
    fn waves(&self) -> anyhow::Result<Vec<Vec<usize>>> {
        let mut remaining: Vec<usize> = (0..self.steps.len()).collect();
        let mut done = std::collections::HashSet::new();
        let mut waves = vec![];
        while !remaining.is_empty() {
            let (ready, blocked): (Vec<usize>, Vec<usize>) = remaining.iter().partition(|i| self.deps[**i].iter().all(|dep| done.contains(dep)));
            if ready.is_empty() {
                return Err(plan_error(format!(
                    "cyclic dependencies among: {}",
                    blocked.iter().map(|x| self.steps[*x].to_string()).collect::<Vec<String>>().join(", ")
                )));
            }
            done.extend(ready.iter().cloned());
            waves.push(ready);
            remaining = blocked;
        }
        Ok(waves)
    }
}

/// Build the deployment plan of a topology.
///
/// Gates and final targets on the same service and status are merged,
/// keeping the shortest timeout.
pub fn plan(services: &[ServiceDescriptor], relations: &[PlannedRelation], targets: &[ConvergenceTarget]) -> anyhow::Result<DeploymentPlan> {
    let mut graph = Graph {
        steps: vec![],
        deps: vec![],
    };

    let mut deploys = std::collections::HashMap::new();
    for service in services {
        if deploys.contains_key(&service.name) {
            return Err(plan_error(format!("service {} declared twice", service.name)));
        }
        deploys.insert(service.name.clone(), graph.add(Step::Deploy(service.name.clone())));
    }
    let deploy_of = |name: &str| -> anyhow::Result<usize> {
        match deploys.get(name) {
            Some(id) => Ok(*id),
            None => Err(plan_error(format!("unknown service {}", name))),
        }
    };

    for service in services {
        for resource in service.attach.keys() {
            let id = graph.add(Step::Attach(service.name.clone(), resource.clone()));
            graph.deps[id].insert(deploy_of(&service.name)?);
        }
    }

    // Convergence steps, one per (service, status).
    let mut converge_ids: std::collections::HashMap<(String, slurmd_deploy_api::status::WorkloadStatus), usize> = std::collections::HashMap::new();
    let all_targets = services
        .iter()
        .flat_map(|x| x.deploy_after.iter())
        .chain(relations.iter().flat_map(|x| x.after.iter()))
        .chain(targets.iter());
    for target in all_targets {
        deploy_of(&target.service)?;
        let key = (target.service.clone(), target.status);
        match converge_ids.get(&key) {
            Some(id) => {
                if let Step::Converge(existing) = &mut graph.steps[*id] {
                    existing.timeout_ms = std::cmp::min(existing.timeout_ms, target.timeout_ms);
                }
            }
            None => {
                let id = graph.add(Step::Converge(target.clone()));
                converge_ids.insert(key, id);
            }
        }
    }
    let converge_of = |target: &ConvergenceTarget| converge_ids[&(target.service.clone(), target.status)];

    for relation in relations {
        let edge = relation.edge();
        if relation.a == relation.b {
            return Err(plan_error(format!("service {} related to itself", relation.a)));
        }
        if graph.find(&Step::Relate(edge.clone())).is_some() {
            return Err(plan_error(format!("relation {} declared twice", edge)));
        }
        let deps = [deploy_of(&relation.a)?, deploy_of(&relation.b)?];
        let id = graph.add(Step::Relate(edge));
        graph.deps[id].extend(deps);
        for gate in &relation.after {
            graph.deps[id].insert(converge_of(gate));
        }
    }

    for service in services {
        let id = deploy_of(&service.name)?;
        for gate in &service.deploy_after {
            if gate.service == service.name {
                return Err(plan_error(format!("deploy of {} gated on itself", service.name)));
            }
            graph.deps[id].insert(converge_of(gate));
        }
    }

    let converge_steps: Vec<usize> = {
        let mut ids: Vec<usize> = converge_ids.values().cloned().collect();
        ids.sort();
        ids
    };
    for id in &converge_steps {
        let service = graph.steps[*id].subject().unwrap_or_default().to_string();
        graph.deps[*id].insert(deploy_of(&service)?);
        let attachments: Vec<usize> = (0..graph.steps.len())
            .filter(|x| matches!(&graph.steps[*x], Step::Attach(s, _) if *s == service))
            .collect();
        graph.deps[*id].extend(attachments);
    }

    // Relations of a service are part of its convergence, unless they wait
    // for it. Earlier decisions only add dependencies, so a relation
    // skipped here keeps waiting for the convergence.
    for id in &converge_steps {
        let service = graph.steps[*id].subject().unwrap_or_default().to_string();
        let incident: Vec<usize> = (0..graph.steps.len())
            .filter(|x| matches!(&graph.steps[*x], Step::Relate(edge) if edge.involves(&service)))
            .collect();
        for relation in incident {
            if !graph.depends_transitively(relation, *id) {
                graph.deps[*id].insert(relation);
            }
        }
    }

    let waves = graph.waves()?;
    Ok(DeploymentPlan { steps: graph.steps, waves })
}
