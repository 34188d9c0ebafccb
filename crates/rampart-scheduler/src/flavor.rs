use crate::types::{AssignmentMode, FlavorAssignment, PodSetFlavors};
use crate::Result;
use rampart_cache::{CachedClusterQueue, Snapshot, Usage};
use rampart_core::{FlavorResource, WhenCanBorrow, WhenCanPreempt, Workload};
use std::collections::BTreeMap;
use tracing::debug;

/// Outcome of trying one flavor for the resources of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlavorFit {
    mode: AssignmentMode,
    borrows: bool,
}

impl FlavorFit {
    /// Higher mode wins; at equal mode not borrowing wins
    fn better_than(&self, other: &FlavorFit) -> bool {
        (self.mode, !self.borrows) > (other.mode, !other.borrows)
    }
}

/// Choose a flavor for every requested resource of `workload` in `cq`.
///
/// Flavors are tried in the order their resource group lists them. The mode
/// of the whole workload is the worst mode of any of its choices.
pub fn assign_flavors(
    snapshot: &Snapshot,
    cq: &CachedClusterQueue,
    workload: &Workload,
) -> Result<FlavorAssignment> {
    let mut assignment = FlavorAssignment {
        mode: AssignmentMode::Fit,
        pod_sets: Vec::with_capacity(workload.spec.pod_sets.len()),
        usage: Usage::new(),
        borrows: false,
        reason: None,
    };

    for pod_set in &workload.spec.pod_sets {
        let requests = pod_set.total_requests()?;

        // Requested resources grouped by the resource group covering them
        let mut by_group: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for resource in requests.keys() {
            let Some(index) = cq
                .resource_groups
                .iter()
                .position(|g| g.covers(resource))
            else {
                return Ok(FlavorAssignment::no_fit(format!(
                    "resource {} is not covered by ClusterQueue {}",
                    resource, cq.name
                )));
            };
            by_group.entry(index).or_default().push(resource.as_str());
        }

        let mut flavors = BTreeMap::new();
        for (index, resources) in by_group {
            let group = &cq.resource_groups[index];
            let mut best: Option<(String, FlavorFit)> = None;

            for flavor in &group.flavors {
                let fit =
                    flavor_fit(snapshot, cq, flavor, &resources, &requests, &assignment.usage);
                debug!(
                    cluster_queue = %cq.name,
                    pod_set = %pod_set.name,
                    flavor = %flavor,
                    mode = ?fit.mode,
                    borrows = fit.borrows,
                    "Tried flavor"
                );
                if best.as_ref().is_none_or(|(_, b)| fit.better_than(b)) {
                    best = Some((flavor.clone(), fit));
                }
                if settles(cq, &fit) {
                    break;
                }
            }

            let Some((flavor, fit)) = best else {
                return Ok(FlavorAssignment::no_fit(format!(
                    "resource group {} of ClusterQueue {} has no flavors",
                    index, cq.name
                )));
            };
            if fit.mode < assignment.mode {
                assignment.mode = fit.mode;
                assignment.reason = Some(match fit.mode {
                    AssignmentMode::Preempt => format!(
                        "insufficient unused quota for {} in flavor {}",
                        resources.join(", "),
                        flavor
                    ),
                    _ => format!(
                        "insufficient quota for {} in flavor {}",
                        resources.join(", "),
                        flavor
                    ),
                });
            }
            assignment.borrows |= fit.borrows;
            for resource in resources {
                flavors.insert(resource.to_string(), flavor.clone());
                *assignment
                    .usage
                    .entry(FlavorResource::new(&flavor, resource))
                    .or_default() += requests.get(resource).copied().unwrap_or(0);
            }
        }

        assignment.pod_sets.push(PodSetFlavors {
            name: pod_set.name.clone(),
            count: pod_set.count,
            flavors,
            requests,
        });
    }

    Ok(assignment)
}

/// Whether `fit` ends the search under the queue's fungibility policy
fn settles(cq: &CachedClusterQueue, fit: &FlavorFit) -> bool {
    match fit.mode {
        AssignmentMode::Fit if !fit.borrows => true,
        AssignmentMode::Fit => cq.flavor_fungibility.when_can_borrow == WhenCanBorrow::Borrow,
        AssignmentMode::Preempt => {
            cq.flavor_fungibility.when_can_preempt == WhenCanPreempt::Preempt
        }
        AssignmentMode::NoFit => false,
    }
}

fn flavor_fit(
    snapshot: &Snapshot,
    cq: &CachedClusterQueue,
    flavor: &str,
    resources: &[&str],
    requests: &BTreeMap<String, i64>,
    already_assigned: &Usage,
) -> FlavorFit {
    let mut fit = FlavorFit {
        mode: AssignmentMode::Fit,
        borrows: false,
    };
    for resource in resources {
        let fr = FlavorResource::new(flavor, *resource);
        let Some(quota) = cq.quota(&fr) else {
            return FlavorFit {
                mode: AssignmentMode::NoFit,
                borrows: false,
            };
        };
        let needed = requests.get(*resource).copied().unwrap_or(0)
            + already_assigned.get(&fr).copied().unwrap_or(0);

        let mode = if needed <= snapshot.available(&cq.name, &fr) {
            AssignmentMode::Fit
        } else if needed <= snapshot.potential(&cq.name, &fr) {
            AssignmentMode::Preempt
        } else {
            AssignmentMode::NoFit
        };
        fit.mode = fit.mode.min(mode);
        if cq.used(&fr) + needed > quota.nominal {
            fit.borrows = true;
        }
    }
    fit
}
