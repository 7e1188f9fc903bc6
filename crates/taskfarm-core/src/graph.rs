//! Task grouping and sequencing.
//!
//! A job's tasks are partitioned into a [`MainGroup`]: tasks connected
//! through local products form a [`LocalGroup`] that must run on one agent,
//! every other task stays a plain item. Items are sequenced by repeated
//! topological relaxation ordered by `(priority, name)`; a graph that cannot
//! be resolved (cycle, input nobody produces) is flattened instead of
//! rejected.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use petgraph::unionfind::UnionFind;
use serde::Serialize;
use tracing::debug;

use crate::agent::{missing_capabilities, AgentInfo};
use crate::diagnostics::{Reason, SelectionScope};
use crate::job::Job;
use crate::product::Product;
use crate::resource::ResourcePool;
use crate::task::Task;
use crate::{AgentId, ResourceId, RunState};

/// One entry in the main sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupItem {
    Task { name: String },
    Local(LocalGroup),
}

/// Tasks that share local products and therefore one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalGroup {
    members: Vec<String>,
    products: BTreeSet<String>,
    needed_caps: BTreeSet<String>,
    priority: i32,
}

impl LocalGroup {
    /// Members in execution order.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// The local products tying the members together.
    pub fn products(&self) -> &BTreeSet<String> {
        &self.products
    }

    /// Union of the members' agent capabilities.
    pub fn needed_capabilities(&self) -> &BTreeSet<String> {
        &self.needed_caps
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn contains(&self, task: &str) -> bool {
        self.members.iter().any(|m| m == task)
    }

    /// Agent the group is bound to, derived from its members.
    pub fn bound_agent<'j>(&self, job: &'j Job) -> Option<&'j AgentId> {
        self.members
            .iter()
            .filter_map(|m| job.task(m).ok())
            .find_map(Task::binding)
    }

    /// Returns true if `agent` may take work from this group.
    fn accepts(&self, job: &Job, agent: &AgentInfo) -> bool {
        match self.bound_agent(job) {
            Some(bound) => *bound == agent.id,
            None => agent.has_capabilities(&self.needed_caps),
        }
    }

    /// Narrow `agents` down to those the group may use, explaining when none
    /// is left.
    pub(crate) fn candidates<'a>(
        &self,
        job: &Job,
        agents: &[&'a AgentInfo],
        pool: &ResourcePool,
        reasons: &mut Vec<Reason>,
    ) -> Option<(Vec<&'a AgentInfo>, SelectionScope)> {
        match self.bound_agent(job) {
            Some(bound) => {
                let Some(agent) = agents.iter().copied().find(|a| a.id == *bound) else {
                    match agents {
                        [only] => reasons.push(Reason::bound_to_other_agent(bound, &only.id)),
                        _ => reasons.push(Reason::bound_agent_unavailable(bound, "not available")),
                    }
                    return None;
                };
                match pool.get(&ResourceId::from(bound)) {
                    None => {
                        reasons.push(Reason::bound_agent_unavailable(bound, "deleted"));
                        None
                    }
                    Some(resource) if !resource.is_free() => {
                        let state = resource.availability().to_string();
                        reasons.push(Reason::bound_agent_unavailable(bound, &state));
                        None
                    }
                    Some(_) => Some((vec![agent], SelectionScope::BoundGroup)),
                }
            }
            None => {
                let capable: Vec<&AgentInfo> = agents
                    .iter()
                    .copied()
                    .filter(|a| a.has_capabilities(&self.needed_caps))
                    .collect();
                if capable.is_empty() && !agents.is_empty() {
                    let missing = missing_capabilities(&self.needed_caps, agents);
                    reasons.push(Reason::capabilities_missing(
                        SelectionScope::UnboundGroup,
                        &missing,
                    ));
                    return None;
                }
                Some((capable, SelectionScope::UnboundGroup))
            }
        }
    }

    fn check_runners(
        &self,
        job: &Job,
        agents: &[&AgentInfo],
        pool: &ResourcePool,
        reasons: &mut Vec<Reason>,
    ) -> bool {
        let Some((candidates, scope)) = self.candidates(job, agents, pool, reasons) else {
            return false;
        };
        check_siblings(&self.members, reasons, |name, reasons| {
            job.check_task(name, &candidates, pool, scope, reasons)
        })
    }
}

/// All tasks of a job, grouped and sequenced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MainGroup {
    items: Vec<GroupItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Node {
    Task(String),
    Product(String),
}

/// Tasks joined through the local products they share. Components come out
/// in the order of their first task; members keep task name order.
fn local_components(tasks: &BTreeMap<String, Task>, products: &BTreeMap<String, Product>) -> Vec<Vec<Node>> {
    let mut nodes: Vec<Node> = tasks.keys().map(|name| Node::Task(name.clone())).collect();
    let mut index: HashMap<Node, usize> = HashMap::new();
    let mut edges = Vec::new();
    for (task_idx, task) in tasks.values().enumerate() {
        let def = task.def();
        let local = def
            .inputs
            .iter()
            .chain(&def.outputs)
            .filter(|p| products.get(p.as_str()).is_some_and(Product::is_local));
        for product in local {
            let node = Node::Product(product.clone());
            let product_idx = *index.entry(node.clone()).or_insert_with(|| {
                nodes.push(node);
                nodes.len() - 1
            });
            edges.push((task_idx, product_idx));
        }
    }

    let mut sets = UnionFind::new(nodes.len());
    for (a, b) in edges {
        sets.union(a, b);
    }

    let mut slot_of: HashMap<usize, usize> = HashMap::new();
    let mut components: Vec<Vec<Node>> = Vec::new();
    for (node, label) in nodes.into_iter().zip(sets.into_labeling()) {
        let slot = *slot_of.entry(label).or_insert_with(|| {
            components.push(Vec::new());
            components.len() - 1
        });
        components[slot].push(node);
    }
    components
}

/// What the sequencer needs to know about an item.
struct SeqNode {
    priority: i32,
    name: String,
    inputs: BTreeSet<String>,
    outputs: BTreeSet<String>,
}

impl SeqNode {
    fn of_task(task: &Task) -> Self {
        let def = task.def();
        Self {
            priority: def.priority,
            name: def.name.clone(),
            inputs: def.inputs.difference(&def.outputs).cloned().collect(),
            outputs: def.outputs.clone(),
        }
    }

    fn of_members<'t>(members: impl IntoIterator<Item = &'t Task>) -> Self {
        let mut node = Self {
            priority: i32::MAX,
            name: String::new(),
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
        };
        for task in members {
            let def = task.def();
            node.priority = node.priority.min(def.priority);
            if node.name.is_empty() || def.name < node.name {
                node.name = def.name.clone();
            }
            node.inputs.extend(def.inputs.iter().cloned());
            node.outputs.extend(def.outputs.iter().cloned());
        }
        node.inputs = node.inputs.difference(&node.outputs).cloned().collect();
        node
    }
}

/// Order `nodes` so that every node comes after the producers of its inputs.
///
/// Products no node produces count as available from the start. A combined
/// product becomes available once every node producing it has been placed,
/// any other product on its first producer.
fn sequence(nodes: &[SeqNode], products: &BTreeMap<String, Product>) -> Vec<usize> {
    let mut remaining: BTreeMap<&str, usize> = BTreeMap::new();
    for node in nodes {
        for output in &node.outputs {
            *remaining.entry(output.as_str()).or_default() += 1;
        }
    }
    let is_combined = |name: &str| products.get(name).is_some_and(Product::is_combined);

    let mut available: BTreeSet<&str> = nodes
        .iter()
        .flat_map(|node| node.inputs.iter())
        .map(String::as_str)
        .filter(|name| !remaining.contains_key(name))
        .collect();
    let mut queued = vec![false; nodes.len()];
    let mut heap = BinaryHeap::new();
    let mut order = Vec::with_capacity(nodes.len());

    loop {
        for (idx, node) in nodes.iter().enumerate() {
            if !queued[idx] && node.inputs.iter().all(|i| available.contains(i.as_str())) {
                queued[idx] = true;
                heap.push(Reverse((node.priority, node.name.as_str(), idx)));
            }
        }
        let Some(Reverse((_, _, idx))) = heap.pop() else {
            break;
        };
        order.push(idx);
        for output in &nodes[idx].outputs {
            let left = remaining.entry(output.as_str()).or_default();
            *left = left.saturating_sub(1);
            if !is_combined(output.as_str()) || *left == 0 {
                available.insert(output.as_str());
            }
        }
    }

    if order.len() < nodes.len() {
        let mut stalled: Vec<usize> = (0..nodes.len()).filter(|&i| !queued[i]).collect();
        stalled.sort_by(|&a, &b| {
            (nodes[a].priority, &nodes[a].name).cmp(&(nodes[b].priority, &nodes[b].name))
        });
        debug!(
            stalled = stalled.len(),
            "Unresolvable dependencies, appending remaining items in priority order"
        );
        order.extend(stalled);
    }
    order
}

/// Run `check` over siblings in order. Reasons of each sibling are dropped
/// after it has been checked; when none can run, the reasons of the first
/// blocked sibling are kept.
fn check_siblings<T>(
    siblings: impl IntoIterator<Item = T>,
    reasons: &mut Vec<Reason>,
    mut check: impl FnMut(T, &mut Vec<Reason>) -> bool,
) -> bool {
    let mut first_blocked: Option<Vec<Reason>> = None;
    for sibling in siblings {
        let mark = reasons.len();
        if check(sibling, reasons) {
            reasons.truncate(mark);
            return true;
        }
        if first_blocked.is_none() && reasons.len() > mark {
            first_blocked = Some(reasons[mark..].to_vec());
        }
        reasons.truncate(mark);
    }
    reasons.extend(first_blocked.unwrap_or_default());
    false
}

impl MainGroup {
    /// Group and sequence `tasks`.
    pub(crate) fn build(tasks: &BTreeMap<String, Task>, products: &BTreeMap<String, Product>) -> Self {
        let mut items = Vec::new();
        let mut nodes = Vec::new();
        for component in local_components(tasks, products) {
            let mut members = Vec::new();
            let mut local = BTreeSet::new();
            for node in component {
                match node {
                    Node::Task(name) => members.push(name),
                    Node::Product(name) => {
                        local.insert(name);
                    }
                }
            }
            let member_tasks: Vec<&Task> = members.iter().filter_map(|m| tasks.get(m)).collect();
            if local.is_empty() {
                if let Some(task) = member_tasks.first() {
                    nodes.push(SeqNode::of_task(task));
                    items.push(GroupItem::Task {
                        name: task.name().to_string(),
                    });
                }
                continue;
            }

            let member_nodes: Vec<SeqNode> = member_tasks.iter().map(|t| SeqNode::of_task(t)).collect();
            let ordered = sequence(&member_nodes, products)
                .into_iter()
                .map(|i| member_nodes[i].name.clone())
                .collect();
            let needed_caps = member_tasks
                .iter()
                .flat_map(|t| t.def().claim.agent_capabilities().iter().cloned())
                .collect();
            let node = SeqNode::of_members(member_tasks.iter().copied());
            items.push(GroupItem::Local(LocalGroup {
                members: ordered,
                products: local,
                needed_caps,
                priority: node.priority,
            }));
            nodes.push(node);
        }

        let order = sequence(&nodes, products);
        let mut slots: Vec<Option<GroupItem>> = items.into_iter().map(Some).collect();
        Self {
            items: order.into_iter().filter_map(|i| slots[i].take()).collect(),
        }
    }

    pub fn items(&self) -> &[GroupItem] {
        &self.items
    }

    /// Task names in sequence order, local groups flattened in place.
    pub fn task_sequence(&self) -> Vec<String> {
        self.items
            .iter()
            .flat_map(|item| match item {
                GroupItem::Task { name } => std::slice::from_ref(name),
                GroupItem::Local(group) => group.members.as_slice(),
            })
            .cloned()
            .collect()
    }

    /// The local group `task` belongs to, if any.
    pub fn local_group_of(&self, task: &str) -> Option<&LocalGroup> {
        self.items.iter().find_map(|item| match item {
            GroupItem::Local(group) if group.contains(task) => Some(group),
            _ => None,
        })
    }

    /// Waiting tasks `agent` may be offered, in the order to try them.
    pub(crate) fn assign_candidates(&self, job: &Job, agent: &AgentInfo) -> Vec<String> {
        let waiting = |name: &String| {
            job.task(name)
                .is_ok_and(|t| t.run().state() == RunState::Waiting)
        };
        let mut candidates = Vec::new();
        for item in &self.items {
            match item {
                GroupItem::Task { name } if waiting(name) => candidates.push(name.clone()),
                GroupItem::Task { .. } => {}
                GroupItem::Local(group) if group.accepts(job, agent) => {
                    candidates.extend(group.members.iter().filter(|&m| waiting(m)).cloned());
                }
                GroupItem::Local(_) => {}
            }
        }
        candidates
    }

    /// Returns true if some task could start on one of `agents`; otherwise
    /// `reasons` explains why the first blocked item is waiting.
    pub fn check_runners(
        &self,
        job: &Job,
        agents: &[&AgentInfo],
        pool: &ResourcePool,
        reasons: &mut Vec<Reason>,
    ) -> bool {
        check_siblings(&self.items, reasons, |item, reasons| match item {
            GroupItem::Task { name } => {
                job.check_task(name, agents, pool, SelectionScope::Plain, reasons)
            }
            GroupItem::Local(group) => group.check_runners(job, agents, pool, reasons),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobDefinition;
    use crate::product::ProductDef;
    use crate::resource::ResourceClaim;
    use crate::task::TaskDef;
    use crate::JobId;
    use chrono::Utc;
    use proptest::prelude::*;

    fn job(tasks: Vec<TaskDef>, products: Vec<ProductDef>) -> Job {
        let def = JobDefinition {
            target: "linux".to_string(),
            owner: "tester".to_string(),
            tasks,
            products,
        };
        Job::new(JobId::new("j1"), def, Utc::now()).unwrap()
    }

    #[test]
    fn test_sequence_respects_dependencies_then_priority() {
        let job = job(
            vec![
                TaskDef::new("test").with_input("bin").with_priority(0),
                TaskDef::new("build").with_output("bin").with_priority(5),
                TaskDef::new("docs").with_priority(1),
                TaskDef::new("lint").with_priority(1),
            ],
            vec![],
        );
        assert_eq!(job.task_sequence(), vec!["docs", "lint", "build", "test"]);
    }

    #[test]
    fn test_combined_product_waits_for_every_producer() {
        let job = job(
            vec![
                TaskDef::new("report").with_input("results").with_priority(-10),
                TaskDef::new("a").with_output("results").with_priority(1),
                TaskDef::new("b").with_output("results").with_priority(2),
            ],
            vec![ProductDef::new("results").combined()],
        );
        assert_eq!(job.task_sequence(), vec!["a", "b", "report"]);
    }

    #[test]
    fn test_plain_product_released_by_first_producer() {
        let job = job(
            vec![
                TaskDef::new("use").with_input("bin").with_priority(-10),
                TaskDef::new("a").with_output("bin").with_priority(1),
                TaskDef::new("b").with_output("bin").with_priority(2),
            ],
            vec![],
        );
        assert_eq!(job.task_sequence(), vec!["a", "use", "b"]);
    }

    #[test]
    fn test_cycle_is_flattened() {
        let job = job(
            vec![
                TaskDef::new("x").with_input("p").with_output("q"),
                TaskDef::new("y").with_input("q").with_output("p").with_priority(-1),
                TaskDef::new("z"),
            ],
            vec![],
        );
        assert_eq!(job.task_sequence(), vec!["z", "y", "x"]);
    }

    #[test]
    fn test_local_products_form_groups() {
        let job = job(
            vec![
                TaskDef::new("prepare").with_output("src"),
                TaskDef::new("build")
                    .with_input("src")
                    .with_output("tree")
                    .with_claim(ResourceClaim::agent_only(["gcc"])),
                TaskDef::new("check")
                    .with_input("tree")
                    .with_claim(ResourceClaim::agent_only(["python"])),
                TaskDef::new("other"),
            ],
            vec![ProductDef::new("tree").local()],
        );
        let groups = job.main_group();
        let group = groups.local_group_of("check").unwrap();
        assert_eq!(group.members(), ["build", "check"]);
        assert_eq!(
            group.needed_capabilities().iter().collect::<Vec<_>>(),
            vec!["gcc", "python"]
        );
        assert!(groups.local_group_of("prepare").is_none());
        assert_eq!(
            job.task_sequence(),
            vec!["other", "prepare", "build", "check"]
        );
    }

    /// Acyclic jobs: task `i` outputs `p{i}` and consumes outputs of lower
    /// indexed tasks only.
    fn arb_acyclic_tasks() -> impl Strategy<Value = Vec<TaskDef>> {
        prop::collection::vec((-3i32..3, prop::collection::btree_set(0usize..8, 0..4)), 1..8).prop_map(
            |items| {
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, (priority, inputs))| {
                        inputs
                            .into_iter()
                            .filter(|&j| j < i)
                            .fold(TaskDef::new(format!("t{i}")), |def, j| def.with_input(format!("p{j}")))
                            .with_output(format!("p{i}"))
                            .with_priority(priority)
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_producers_come_before_consumers(tasks in arb_acyclic_tasks()) {
            let job = job(tasks.clone(), vec![]);
            let sequence = job.task_sequence();
            prop_assert_eq!(sequence.len(), tasks.len());
            let position = |name: &str| sequence.iter().position(|t| t == name);

            for def in &tasks {
                let consumer = position(&def.name);
                prop_assert!(consumer.is_some());
                for input in &def.inputs {
                    let producer = format!("t{}", &input[1..]);
                    prop_assert!(
                        position(&producer) < consumer,
                        "{} runs before its producer {} in {:?}",
                        def.name,
                        producer,
                        sequence
                    );
                }
            }
        }
    }
}
