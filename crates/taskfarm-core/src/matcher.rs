//! Resource matching: assign concrete resources to resource specs.
//!
//! Specs are matched per resource type. Within a type, the matcher first
//! decides feasibility with a maximum bipartite matching (augmenting paths)
//! and only then computes the minimum-cost assignment with the Hungarian
//! algorithm. The cost of a resource is the number of capabilities it offers,
//! which keeps versatile resources free for the specs that need them.
//!
//! Matching never mutates the pool. Callers that want to reserve the result
//! do so afterwards through [`ResourcePool::reserve`].

use std::collections::BTreeMap;

use crate::diagnostics::Reason;
use crate::resource::{Availability, Resource, ResourcePool, ResourceSpec};
use crate::ResourceId;

/// Result of a successful match: reference name to resource id.
pub type Assignment = BTreeMap<String, ResourceId>;

/// Find a minimum-cost assignment of available resources to `specs`.
///
/// Returns `None` when no complete assignment exists; in that case at least
/// one [`Reason`] is appended to `reasons`.
pub fn match_claim(
    specs: &[&ResourceSpec],
    pool: &ResourcePool,
    reasons: &mut Vec<Reason>,
) -> Option<Assignment> {
    let mut by_type: BTreeMap<&str, Vec<&ResourceSpec>> = BTreeMap::new();
    for &spec in specs {
        by_type.entry(spec.res_type.as_str()).or_default().push(spec);
    }

    let mut assignment = Assignment::new();
    let mut feasible = true;
    for (res_type, type_specs) in by_type {
        let resources: Vec<&Resource> = pool.of_type(res_type).collect();
        match match_type(res_type, &type_specs, &resources, reasons) {
            Some(found) => assignment.extend(found),
            None => feasible = false,
        }
    }

    feasible.then_some(assignment)
}

/// Returns true if `specs` could be matched right now, without computing the
/// optimal assignment.
pub fn is_feasible(specs: &[&ResourceSpec], pool: &ResourcePool) -> bool {
    let mut by_type: BTreeMap<&str, Vec<&ResourceSpec>> = BTreeMap::new();
    for &spec in specs {
        by_type.entry(spec.res_type.as_str()).or_default().push(spec);
    }
    by_type.into_iter().all(|(res_type, type_specs)| {
        let resources: Vec<&Resource> = pool.of_type(res_type).collect();
        let usable = usable_edges(&type_specs, &resources);
        max_matching(&usable, resources.len()) == type_specs.len()
    })
}

fn usable_edges(specs: &[&ResourceSpec], resources: &[&Resource]) -> Vec<Vec<usize>> {
    specs
        .iter()
        .map(|spec| {
            resources
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_free() && r.satisfies(spec))
                .map(|(idx, _)| idx)
                .collect()
        })
        .collect()
}

fn match_type(
    res_type: &str,
    specs: &[&ResourceSpec],
    resources: &[&Resource],
    reasons: &mut Vec<Reason>,
) -> Option<Assignment> {
    // Capability check first: a spec nobody can ever satisfy is the most
    // useful thing to report.
    for spec in specs {
        if !resources.iter().any(|r| r.satisfies(spec)) {
            reasons.push(Reason::no_capable_resource(res_type, &spec.capabilities));
            return None;
        }
    }

    let usable = usable_edges(specs, resources);
    for (spec, edges) in specs.iter().zip(&usable) {
        if edges.is_empty() {
            let capable = resources.iter().copied().filter(|r| r.satisfies(spec));
            reasons.push(unavailable_reason(res_type, capable));
            return None;
        }
    }

    if max_matching(&usable, resources.len()) < specs.len() {
        let mut free: Vec<usize> = usable.iter().flatten().copied().collect();
        free.sort_unstable();
        free.dedup();
        reasons.push(Reason::insufficient_resources(res_type, specs.len(), free.len()));
        return None;
    }

    let columns = optimal_assignment(specs, resources, &usable);
    Some(
        specs
            .iter()
            .zip(columns)
            .map(|(spec, col)| (spec.reference.clone(), resources[col].id.clone()))
            .collect(),
    )
}

/// Explain why none of the `capable` resources can be handed out.
pub(crate) fn unavailable_reason<'a>(
    res_type: &str,
    capable: impl IntoIterator<Item = &'a Resource>,
) -> Reason {
    let (mut reserved, mut suspended, mut lost) = (0usize, 0usize, 0usize);
    for resource in capable {
        match resource.availability() {
            Availability::Reserved => reserved += 1,
            Availability::Suspended => suspended += 1,
            Availability::Disconnected => lost += 1,
            Availability::Free => {}
        }
    }
    if reserved > 0 {
        Reason::resources_reserved(res_type)
    } else if suspended > 0 && lost > 0 {
        Reason::resources_unavailable(res_type, "suspended or lost")
    } else if suspended > 0 {
        Reason::resources_unavailable(res_type, "suspended")
    } else {
        Reason::resources_unavailable(res_type, "lost")
    }
}

/// Size of a maximum matching between specs (rows) and resources (columns).
fn max_matching(edges: &[Vec<usize>], columns: usize) -> usize {
    let mut owner: Vec<Option<usize>> = vec![None; columns];
    let mut size = 0;
    for row in 0..edges.len() {
        let mut seen = vec![false; columns];
        if augment(row, edges, &mut seen, &mut owner) {
            size += 1;
        }
    }
    size
}

fn augment(row: usize, edges: &[Vec<usize>], seen: &mut [bool], owner: &mut [Option<usize>]) -> bool {
    for &col in &edges[row] {
        if seen[col] {
            continue;
        }
        seen[col] = true;
        let free = match owner[col] {
            None => true,
            Some(other) => augment(other, edges, seen, owner),
        };
        if free {
            owner[col] = Some(row);
            return true;
        }
    }
    false
}

/// Hungarian algorithm on the rectangular spec x resource matrix.
///
/// Must only be called when a complete matching over `edges` exists; the
/// returned vector maps every row to a distinct usable column.
fn optimal_assignment(
    specs: &[&ResourceSpec],
    resources: &[&Resource],
    edges: &[Vec<usize>],
) -> Vec<usize> {
    let n = specs.len();
    let m = resources.len();

    // Any assignment using a forbidden cell costs more than every assignment
    // that does not.
    let forbidden: i64 = resources.iter().map(|r| r.cost() as i64).sum::<i64>() * (n as i64) + 1;
    let mut cost = vec![vec![forbidden; m]; n];
    for (row, cols) in edges.iter().enumerate() {
        for &col in cols {
            cost[row][col] = resources[col].cost() as i64;
        }
    }

    let inf = i64::MAX / 4;
    let mut u = vec![0i64; n + 1];
    let mut v = vec![0i64; m + 1];
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![inf; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = inf;
            let mut j1 = 0usize;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut columns = vec![0usize; n];
    for j in 1..=m {
        if p[j] != 0 {
            columns[p[j] - 1] = j - 1;
        }
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{top_reason, ReasonCategory};
    use proptest::prelude::*;
    use std::collections::{BTreeSet, HashSet};

    fn pool_of(resources: Vec<Resource>) -> ResourcePool {
        let mut pool = ResourcePool::new();
        for r in resources {
            pool.add(r).unwrap();
        }
        pool
    }

    #[test]
    fn test_prefers_simpler_resource() {
        let pool = pool_of(vec![
            Resource::new("big", "board", ["usb", "jtag", "wifi"]),
            Resource::new("small", "board", ["usb"]),
        ]);
        let spec = ResourceSpec::new("dut", "board", ["usb"]);
        let mut reasons = Vec::new();

        let found = match_claim(&[&spec], &pool, &mut reasons).unwrap();
        assert_eq!(found["dut"].as_str(), "small");
        assert!(reasons.is_empty());
    }

    #[test]
    fn test_keeps_capable_resource_for_demanding_spec() {
        // Greedy in claim order would hand "big" to the undemanding spec.
        let pool = pool_of(vec![
            Resource::new("big", "board", ["usb", "jtag"]),
            Resource::new("small", "board", ["usb"]),
        ]);
        let plain = ResourceSpec::new("a", "board", ["usb"]);
        let jtag = ResourceSpec::new("b", "board", ["jtag"]);
        let mut reasons = Vec::new();

        let found = match_claim(&[&plain, &jtag], &pool, &mut reasons).unwrap();
        assert_eq!(found["a"].as_str(), "small");
        assert_eq!(found["b"].as_str(), "big");
    }

    #[test]
    fn test_reports_missing_capability() {
        let pool = pool_of(vec![Resource::new("r1", "board", ["usb"])]);
        let spec = ResourceSpec::new("dut", "board", ["pcie"]);
        let mut reasons = Vec::new();

        assert!(match_claim(&[&spec], &pool, &mut reasons).is_none());
        assert_eq!(
            reasons[0].description(),
            "no resource of type 'board' has capabilities: pcie"
        );
    }

    #[test]
    fn test_reports_reserved_and_suspended() {
        let mut pool = pool_of(vec![Resource::new("r1", "board", ["usb"])]);
        let spec = ResourceSpec::new("dut", "board", ["usb"]);
        let id = ResourceId::new("r1");

        pool.reserve(&id, "someone").unwrap();
        let mut reasons = Vec::new();
        assert!(match_claim(&[&spec], &pool, &mut reasons).is_none());
        assert!(reasons[0].description().contains("reserved"));

        pool.release(&id, "someone").unwrap();
        pool.get_mut(&id).unwrap().suspended = true;
        let mut reasons = Vec::new();
        assert!(match_claim(&[&spec], &pool, &mut reasons).is_none());
        assert!(reasons[0].description().contains("suspended"));
    }

    #[test]
    fn test_reports_insufficient_count() {
        let pool = pool_of(vec![Resource::new("r1", "board", ["usb"])]);
        let a = ResourceSpec::new("a", "board", ["usb"]);
        let b = ResourceSpec::new("b", "board", Vec::<String>::new());
        let mut reasons = Vec::new();

        assert!(match_claim(&[&a, &b], &pool, &mut reasons).is_none());
        assert_eq!(
            reasons[0].description(),
            "needs 2 resources of type 'board', only 1 available"
        );
        assert_eq!(top_reason(&reasons).unwrap().category(), ReasonCategory::Resource);
    }

    #[test]
    fn test_types_are_matched_independently() {
        let pool = pool_of(vec![
            Resource::new("db1", "database", ["pg"]),
            Resource::new("b1", "board", ["usb"]),
        ]);
        let db = ResourceSpec::new("db", "database", ["pg"]);
        let board = ResourceSpec::new("dut", "board", ["usb"]);
        let mut reasons = Vec::new();

        let found = match_claim(&[&db, &board], &pool, &mut reasons).unwrap();
        assert_eq!(found.len(), 2);
        assert!(is_feasible(&[&db, &board], &pool));
    }

    #[test]
    fn test_matching_does_not_mutate_pool() {
        let pool = pool_of(vec![Resource::new("r1", "board", ["usb"])]);
        let spec = ResourceSpec::new("dut", "board", ["usb"]);
        let mut reasons = Vec::new();
        match_claim(&[&spec], &pool, &mut reasons).unwrap();
        assert!(pool.get(&ResourceId::new("r1")).unwrap().is_free());
    }

    // Brute-force reference solver: minimum cost over all injective
    // assignments, or None.
    fn brute_force(specs: &[ResourceSpec], resources: &[Resource]) -> Option<usize> {
        fn go(
            idx: usize,
            specs: &[ResourceSpec],
            resources: &[Resource],
            used: &mut Vec<bool>,
        ) -> Option<usize> {
            if idx == specs.len() {
                return Some(0);
            }
            let mut best: Option<usize> = None;
            for (col, r) in resources.iter().enumerate() {
                if used[col] || !r.is_free() || !r.satisfies(&specs[idx]) {
                    continue;
                }
                used[col] = true;
                if let Some(rest) = go(idx + 1, specs, resources, used) {
                    let total = rest + r.cost();
                    best = Some(best.map_or(total, |b| b.min(total)));
                }
                used[col] = false;
            }
            best
        }
        go(0, specs, resources, &mut vec![false; resources.len()])
    }

    const CAPS: [&str; 3] = ["a", "b", "c"];
    const TYPES: [&str; 2] = ["x", "y"];

    fn arb_caps() -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set(prop::sample::select(CAPS.to_vec()), 0..=3)
            .prop_map(|s| s.into_iter().map(String::from).collect())
    }

    fn arb_pool() -> impl Strategy<Value = ResourcePool> {
        prop::collection::vec(
            (prop::sample::select(TYPES.to_vec()), arb_caps(), any::<bool>(), any::<bool>()),
            0..6,
        )
        .prop_map(|items| {
            let mut pool = ResourcePool::new();
            for (i, (t, caps, suspended, reserved)) in items.into_iter().enumerate() {
                let mut r = Resource::new(format!("r{i}"), t, caps);
                r.suspended = suspended && i % 3 == 0;
                let id = r.id.clone();
                pool.add(r).unwrap();
                if reserved && i % 2 == 0 {
                    pool.reserve(&id, "other").unwrap();
                }
            }
            pool
        })
    }

    fn arb_specs() -> impl Strategy<Value = Vec<ResourceSpec>> {
        prop::collection::vec((prop::sample::select(TYPES.to_vec()), arb_caps()), 1..5).prop_map(
            |items| {
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, (t, caps))| ResourceSpec::new(format!("s{i}"), t, caps))
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_match_is_valid_complete_and_minimal(
            pool in arb_pool(),
            specs in arb_specs(),
        ) {
            let resources: Vec<Resource> = pool.iter().cloned().collect();
            let spec_refs: Vec<&ResourceSpec> = specs.iter().collect();
            let mut reasons = Vec::new();
            let found = match_claim(&spec_refs, &pool, &mut reasons);
            let reference = brute_force(&specs, &resources);

            prop_assert_eq!(found.is_some(), reference.is_some());
            prop_assert_eq!(is_feasible(&spec_refs, &pool), reference.is_some());

            match found {
                Some(assignment) => {
                    prop_assert_eq!(assignment.len(), specs.len());
                    let mut used = HashSet::new();
                    let mut total = 0;
                    for spec in &specs {
                        let id = &assignment[&spec.reference];
                        let resource = pool.get(id).unwrap();
                        prop_assert!(resource.satisfies(spec));
                        prop_assert!(resource.is_free());
                        prop_assert!(used.insert(id.clone()));
                        total += resource.cost();
                    }
                    prop_assert_eq!(Some(total), reference);
                }
                None => prop_assert!(!reasons.is_empty()),
            }
        }
    }
}
