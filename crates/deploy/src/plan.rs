//! Dependency plan builder.
//!
//! Turns a declared set of [`ContractSpec`]s into a [`DeploymentPlan`]: a topological order in
//! which every contract comes after the contracts whose addresses it takes as constructor
//! arguments. Contracts with no ordering constraint between them keep their declaration order,
//! so the same manifest always yields the same plan.

use std::collections::{BTreeSet, HashMap};

use crate::contract::{ConstructorArg, ContractSpec, parse_literal};

/// Errors raised while building a plan. No transaction is ever sent when one of these occurs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// The reference graph contains a cycle; the cycle is listed dependent-first.
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    /// Two contracts share a name.
    #[error("contract `{0}` is declared more than once")]
    DuplicateContract(String),
    /// A literal argument does not parse as its declared ABI type.
    #[error("argument #{index} of `{contract}` is invalid: {reason}")]
    InvalidLiteral {
        contract: String,
        index: usize,
        reason: String,
    },
}

impl PlanError {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        2
    }
}

/// The ordered sequence of contracts to deploy.
///
/// Holds the declared specs and the deployment order as indices into them. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPlan {
    specs: Vec<ContractSpec>,
    order: Vec<usize>,
}

impl DeploymentPlan {
    /// Specs in deployment order.
    pub fn iter(&self) -> impl Iterator<Item = &ContractSpec> {
        self.order.iter().map(|&index| &self.specs[index])
    }

    /// Contract names in deployment order.
    pub fn names(&self) -> Vec<&str> {
        self.iter().map(|spec| spec.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Build a deployment plan from the declared contracts.
///
/// References to names outside `specs` are treated as contracts deployed by an earlier run:
/// they add no ordering edge and are resolved from the state store at deploy time.
pub fn build_plan(specs: Vec<ContractSpec>) -> Result<DeploymentPlan, PlanError> {
    let mut index = HashMap::with_capacity(specs.len());
    for (position, spec) in specs.iter().enumerate() {
        if index.insert(spec.name.as_str(), position).is_some() {
            return Err(PlanError::DuplicateContract(spec.name.clone()));
        }
        validate_literals(spec)?;
    }

    // Distinct in-plan dependencies of each spec.
    let dependencies: Vec<BTreeSet<usize>> = specs
        .iter()
        .map(|spec| {
            spec.dependencies()
                .filter_map(|name| index.get(name).copied())
                .collect()
        })
        .collect();

    let mut dependents = vec![Vec::new(); specs.len()];
    for (position, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(position);
        }
    }

    let mut remaining: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
    let mut ready: BTreeSet<usize> = (0..specs.len())
        .filter(|&position| remaining[position] == 0)
        .collect();
    let mut order = Vec::with_capacity(specs.len());

    // Always take the earliest-declared ready contract.
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < specs.len() {
        let cycle = find_cycle(&specs, &dependencies, &remaining);
        return Err(PlanError::CyclicDependency { cycle });
    }

    tracing::debug!(
        order = ?order.iter().map(|&i| specs[i].name.as_str()).collect::<Vec<_>>(),
        "Deployment plan built"
    );

    Ok(DeploymentPlan { specs, order })
}

fn validate_literals(spec: &ContractSpec) -> Result<(), PlanError> {
    for (index, arg) in spec.args.iter().enumerate() {
        if let ConstructorArg::Literal { ty, value } = arg {
            parse_literal(ty, value).map_err(|reason| PlanError::InvalidLiteral {
                contract: spec.name.clone(),
                index,
                reason,
            })?;
        }
    }
    Ok(())
}

/// Walk unresolved dependency edges until a node repeats.
///
/// Every spec left out of the order still waits on at least one dependency that was also left
/// out, so the walk always closes a cycle.
fn find_cycle(
    specs: &[ContractSpec],
    dependencies: &[BTreeSet<usize>],
    remaining: &[usize],
) -> Vec<String> {
    let name = |position: usize| specs[position].name.clone();

    let Some(mut current) = (0..specs.len()).find(|&position| remaining[position] > 0) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    loop {
        if let Some(start) = path.iter().position(|&seen| seen == current) {
            let mut cycle: Vec<String> = path[start..].iter().map(|&p| name(p)).collect();
            cycle.push(name(current));
            return cycle;
        }
        path.push(current);

        match dependencies[current]
            .iter()
            .copied()
            .find(|&dep| remaining[dep] > 0)
        {
            Some(dep) => current = dep,
            None => return path.into_iter().map(name).collect(),
        }
    }
}
