use rampart_cache::{CachedClusterQueue, CachedWorkload, Snapshot, Usage};
use rampart_core::{FlavorResource, ReclaimPolicy, WithinClusterQueuePolicy};
use rampart_queue::WorkloadInfo;
use std::cmp::Reverse;
use tracing::debug;

/// Result of a victim search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreemptionOutcome {
    /// Evicting these makes room
    Victims(Vec<CachedWorkload>),
    /// Evictions already in progress will make room
    WaitForEvictions,
    /// No allowed set of victims makes room
    Infeasible,
}

struct Candidate {
    workload: CachedWorkload,
    /// Borrowed capacity reclaimed from another cohort member
    reclaim: bool,
}

/// Find a minimal set of admitted workloads whose eviction lets the
/// preemptor's `usage` fit into `cq_name`.
///
/// Workloads already being evicted and reservations not yet committed are
/// never chosen.
pub fn find_victims(
    snapshot: &Snapshot,
    cq_name: &str,
    preemptor: &WorkloadInfo,
    usage: &Usage,
) -> PreemptionOutcome {
    let Some(cq) = snapshot.cluster_queue(cq_name) else {
        return PreemptionOutcome::Infeasible;
    };

    let mut candidates = collect_candidates(snapshot, cq, preemptor, usage, false);
    candidates.sort_by_key(|c| {
        (
            !c.reclaim,
            c.workload.priority,
            Reverse(c.workload.reserved_at),
            c.workload.key.clone(),
        )
    });

    let mut working = snapshot.clone();
    let mut victims: Vec<Candidate> = Vec::new();
    let mut reclaiming = false;
    for candidate in candidates {
        if fits(&working, cq_name, usage, reclaiming) {
            break;
        }
        // A peer that stopped borrowing has nothing left to give back
        if candidate.reclaim
            && !still_borrowing(&working, &candidate.workload, usage)
        {
            continue;
        }
        working.remove_workload(&candidate.workload.key);
        reclaiming |= candidate.reclaim;
        victims.push(candidate);
    }

    if !fits(&working, cq_name, usage, reclaiming) {
        return if evictions_would_make_room(snapshot, cq, preemptor, usage) {
            PreemptionOutcome::WaitForEvictions
        } else {
            PreemptionOutcome::Infeasible
        };
    }

    // Give back every victim whose removal turned out unnecessary
    let mut needed = Vec::with_capacity(victims.len());
    for victim in victims.into_iter().rev() {
        if working.add_workload(victim.workload.clone()).is_ok() {
            if fits(&working, cq_name, usage, reclaiming) {
                continue;
            }
            working.remove_workload(&victim.workload.key);
        }
        needed.push(victim.workload);
    }
    needed.reverse();

    if needed.is_empty() {
        return PreemptionOutcome::Infeasible;
    }
    debug!(
        preemptor = %preemptor.key,
        cluster_queue = %cq_name,
        victims = needed.len(),
        "Found preemption victims"
    );
    PreemptionOutcome::Victims(needed)
}

fn collect_candidates(
    snapshot: &Snapshot,
    cq: &CachedClusterQueue,
    preemptor: &WorkloadInfo,
    usage: &Usage,
    include_evicting: bool,
) -> Vec<Candidate> {
    let uses_needed = |w: &CachedWorkload| usage.keys().any(|fr| w.usage.contains_key(fr));
    let eligible = |w: &CachedWorkload| {
        w.key != preemptor.key
            && !w.assumed
            && (include_evicting || !w.evicting)
            && uses_needed(w)
    };

    let mut candidates = Vec::new();
    for workload in cq.workloads.values().filter(|w| eligible(w)) {
        let allowed = match cq.preemption.within_cluster_queue {
            WithinClusterQueuePolicy::Never => false,
            WithinClusterQueuePolicy::LowerPriority => workload.priority < preemptor.priority,
            WithinClusterQueuePolicy::LowerOrNewerEqualPriority => {
                workload.priority < preemptor.priority
                    || (workload.priority == preemptor.priority
                        && workload.created_at.is_some_and(|c| c > preemptor.created_at))
            }
        };
        if allowed {
            candidates.push(Candidate {
                workload: workload.clone(),
                reclaim: false,
            });
        }
    }

    if cq.preemption.reclaim_within_cohort == ReclaimPolicy::Never
        || !within_nominal(cq, usage)
    {
        return candidates;
    }
    for peer in snapshot.cohort_peers(&cq.name) {
        let borrowing: Vec<&FlavorResource> = usage
            .keys()
            .filter(|fr| snapshot.borrowed(&peer.name, fr) > 0)
            .collect();
        if borrowing.is_empty() {
            continue;
        }
        for workload in peer.workloads.values().filter(|w| eligible(w)) {
            if !borrowing.iter().any(|fr| workload.usage.contains_key(*fr)) {
                continue;
            }
            let allowed = match cq.preemption.reclaim_within_cohort {
                ReclaimPolicy::Any => true,
                ReclaimPolicy::LowerPriority => workload.priority < preemptor.priority,
                ReclaimPolicy::Never => false,
            };
            if allowed {
                candidates.push(Candidate {
                    workload: workload.clone(),
                    reclaim: true,
                });
            }
        }
    }
    candidates
}

/// The preemptor would stay within nominal quota of its own queue
fn within_nominal(cq: &CachedClusterQueue, usage: &Usage) -> bool {
    usage.iter().all(|(fr, needed)| {
        cq.quota(fr)
            .is_some_and(|q| cq.used(fr) + needed <= q.nominal)
    })
}

fn fits(working: &Snapshot, cq_name: &str, usage: &Usage, without_borrowing: bool) -> bool {
    let Some(cq) = working.cluster_queue(cq_name) else {
        return false;
    };
    usage.iter().all(|(fr, needed)| {
        if *needed > working.available(cq_name, fr) {
            return false;
        }
        !without_borrowing || cq.quota(fr).is_some_and(|q| cq.used(fr) + needed <= q.nominal)
    })
}

fn still_borrowing(working: &Snapshot, workload: &CachedWorkload, usage: &Usage) -> bool {
    usage
        .keys()
        .any(|fr| {
            workload.usage.contains_key(fr) && working.borrowed(&workload.cluster_queue, fr) > 0
        })
}

/// Whether the workloads already being evicted would make room
fn evictions_would_make_room(
    snapshot: &Snapshot,
    cq: &CachedClusterQueue,
    preemptor: &WorkloadInfo,
    usage: &Usage,
) -> bool {
    let evicting: Vec<Candidate> = collect_candidates(snapshot, cq, preemptor, usage, true)
        .into_iter()
        .filter(|c| c.workload.evicting)
        .collect();
    if evicting.is_empty() {
        return false;
    }
    let reclaiming = evicting.iter().any(|c| c.reclaim);
    let mut working = snapshot.clone();
    for candidate in &evicting {
        working.remove_workload(&candidate.workload.key);
    }
    fits(&working, &cq.name, usage, reclaiming)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use rampart_cache::Cache;
    use rampart_core::k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use rampart_core::{
        Admission, ClusterQueue, FlavorQuotas, PodSetAssignment, PreemptionPolicy, ResourceFlavor,
        ResourceGroup, ResourceQuota, Workload, WorkloadKey,
    };
    use std::collections::BTreeMap;

    fn cpu() -> FlavorResource {
        FlavorResource::new("default", "cpu")
    }

    fn cluster_queue(
        name: &str,
        cohort: Option<&str>,
        quota: &str,
        preemption: PreemptionPolicy,
    ) -> ClusterQueue {
        let mut cq = ClusterQueue::new(name);
        cq.spec.cohort = cohort.map(str::to_string);
        cq.spec.preemption = preemption;
        cq.spec.resource_groups = vec![ResourceGroup {
            covered_resources: vec!["cpu".to_string()],
            flavors: vec![FlavorQuotas {
                name: "default".to_string(),
                resources: vec![ResourceQuota::new("cpu", quota)],
            }],
        }];
        cq
    }

    fn admit(cache: &Cache, name: &str, cq: &str, priority: i32, millis: i64, age_secs: i64) {
        let mut wl = Workload::new("ns", name, "main").with_priority(priority);
        wl.set_quota_reservation(
            Admission {
                cluster_queue: cq.to_string(),
                pod_set_assignments: vec![PodSetAssignment::new(
                    "main",
                    1,
                    BTreeMap::from([("cpu".to_string(), "default".to_string())]),
                    &BTreeMap::from([("cpu".to_string(), millis)]),
                )],
            },
            Utc::now() - TimeDelta::seconds(age_secs),
        );
        cache.add_or_update_workload(&wl).unwrap();
    }

    fn preemptor(cq: &str, priority: i32) -> WorkloadInfo {
        let wl = Workload::new("ns", "preemptor", "main").with_priority(priority);
        WorkloadInfo {
            key: wl.key(),
            workload: wl,
            cluster_queue: cq.to_string(),
            priority,
            created_at: Utc::now(),
            eligible_since: Utc::now(),
            attempts: 0,
            not_before: None,
        }
    }

    fn victim_names(outcome: &PreemptionOutcome) -> Vec<String> {
        match outcome {
            PreemptionOutcome::Victims(v) => v.iter().map(|w| w.key.name.clone()).collect(),
            _ => Vec::new(),
        }
    }

    fn lower_priority() -> PreemptionPolicy {
        PreemptionPolicy {
            within_cluster_queue: WithinClusterQueuePolicy::LowerPriority,
            ..Default::default()
        }
    }

    fn setup(policy: PreemptionPolicy) -> Cache {
        let cache = Cache::new();
        cache.upsert_flavor(&ResourceFlavor::new("default"));
        cache.upsert_cluster_queue(&cluster_queue("a", None, "4", policy));
        cache
    }

    #[test]
    fn test_minimal_victims_lowest_priority_first() {
        let cache = setup(lower_priority());
        admit(&cache, "low-1", "a", 1, 1000, 30);
        admit(&cache, "low-2", "a", 2, 1000, 20);
        admit(&cache, "mid", "a", 3, 2000, 10);

        let usage = Usage::from([(cpu(), 2000)]);
        let outcome = find_victims(&cache.snapshot(), "a", &preemptor("a", 5), &usage);
        assert_eq!(victim_names(&outcome), vec!["low-1", "low-2"]);
    }

    #[test]
    fn test_fill_back_drops_unneeded_victims() {
        let cache = setup(lower_priority());
        admit(&cache, "small", "a", 1, 1000, 30);
        admit(&cache, "large", "a", 2, 3000, 20);

        // Greedy takes small then large; small alone never suffices
        let usage = Usage::from([(cpu(), 3000)]);
        let outcome = find_victims(&cache.snapshot(), "a", &preemptor("a", 5), &usage);
        assert_eq!(victim_names(&outcome), vec!["large"]);
    }

    #[test]
    fn test_never_preempts_equal_or_higher_priority() {
        let cache = setup(lower_priority());
        admit(&cache, "peer", "a", 5, 4000, 10);
        let usage = Usage::from([(cpu(), 1000)]);
        let outcome = find_victims(&cache.snapshot(), "a", &preemptor("a", 5), &usage);
        assert_eq!(outcome, PreemptionOutcome::Infeasible);
    }

    #[test]
    fn test_newer_equal_priority_policy() {
        let cache = setup(PreemptionPolicy {
            within_cluster_queue: WithinClusterQueuePolicy::LowerOrNewerEqualPriority,
            ..Default::default()
        });
        let mut newer = Workload::new("ns", "newer", "main").with_priority(5);
        newer.metadata.creation_timestamp = Some(Time(Utc::now() + TimeDelta::seconds(60)));
        newer.set_quota_reservation(
            Admission {
                cluster_queue: "a".to_string(),
                pod_set_assignments: vec![PodSetAssignment::new(
                    "main",
                    1,
                    BTreeMap::from([("cpu".to_string(), "default".to_string())]),
                    &BTreeMap::from([("cpu".to_string(), 4000)]),
                )],
            },
            Utc::now(),
        );
        cache.add_or_update_workload(&newer).unwrap();

        let usage = Usage::from([(cpu(), 1000)]);
        let outcome = find_victims(&cache.snapshot(), "a", &preemptor("a", 5), &usage);
        assert_eq!(victim_names(&outcome), vec!["newer"]);
    }

    #[test]
    fn test_reclaim_from_borrowing_peer() {
        let cache = Cache::new();
        cache.upsert_flavor(&ResourceFlavor::new("default"));
        cache.upsert_cluster_queue(&cluster_queue(
            "a",
            Some("pool"),
            "4",
            PreemptionPolicy {
                reclaim_within_cohort: ReclaimPolicy::Any,
                ..Default::default()
            },
        ));
        let b = cluster_queue("b", Some("pool"), "4", PreemptionPolicy::default());
        cache.upsert_cluster_queue(&b);
        admit(&cache, "b-nominal", "b", 10, 4000, 30);
        admit(&cache, "b-borrowed", "b", 10, 3000, 10);

        let usage = Usage::from([(cpu(), 2000)]);
        let outcome = find_victims(&cache.snapshot(), "a", &preemptor("a", 0), &usage);
        assert_eq!(victim_names(&outcome), vec!["b-borrowed"]);
    }

    #[test]
    fn test_wait_for_evictions_in_progress() {
        let cache = setup(lower_priority());
        admit(&cache, "low", "a", 1, 4000, 10);
        cache.mark_evicting(&WorkloadKey::new("ns", "low"));

        let usage = Usage::from([(cpu(), 2000)]);
        let outcome = find_victims(&cache.snapshot(), "a", &preemptor("a", 5), &usage);
        assert_eq!(outcome, PreemptionOutcome::WaitForEvictions);
    }
}
