//! Dependency resolver
//!
//! Pure functions over a store snapshot. `analyze` builds the full
//! `DependencyAnalysis` in O(V+E); callers memoize results by the store
//! version counter since nothing here touches shared state.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::Task;

/// Everything the scheduler needs to know about the dependency graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyAnalysis {
    pub has_cycles: bool,
    /// Each inner vec is one detected cycle, in edge order.
    pub cycles: Vec<Vec<String>>,
    /// Level 0 holds tasks with no dependencies; level k tasks whose deepest
    /// predecessor sits at k-1. Cyclic tasks are excluded.
    pub execution_levels: BTreeMap<usize, Vec<String>>,
    /// Longest duration-weighted chain through the graph.
    pub critical_path: Vec<String>,
    /// Per level, maximal subsets whose summed resource requirements fit the
    /// configured pool capacities.
    pub parallelizable_groups: Vec<Vec<String>>,
    /// Non-terminal tasks whose dependencies are all satisfied.
    pub ready_tasks: Vec<String>,
    /// Non-terminal tasks waiting on dependencies or stuck on a cycle.
    pub blocked_tasks: Vec<String>,
}

impl DependencyAnalysis {
    pub fn cyclic_task_ids(&self) -> HashSet<String> {
        self.cycles.iter().flatten().cloned().collect()
    }
}

/// Number of tasks that (transitively or directly) depend on each task.
/// The scheduler uses the direct count as critical-path weight in its
/// composite ordering.
pub fn dependent_counts(tasks: &[Task]) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            *counts.entry(dep.clone()).or_default() += 1;
        }
    }
    counts
}

/// Whether adding `new_deps` to `task_id` would close a dependency cycle.
///
/// An edge `task -> dep` cycles iff `task_id` is reachable from `dep` by
/// following existing dependency edges.
pub fn would_create_cycle(tasks: &[Task], task_id: &str, new_deps: &[String]) -> bool {
    if new_deps.iter().any(|d| d == task_id) {
        return true;
    }

    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut stack: Vec<&str> = new_deps.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::new();

    while let Some(current) = stack.pop() {
        if current == task_id {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(task) = by_id.get(current) {
            stack.extend(task.dependencies.iter().map(String::as_str));
        }
    }
    false
}

/// Builds the full analysis for one snapshot of the task set.
pub fn analyze(tasks: &[Task], pool_capacity: &BTreeMap<String, u32>) -> DependencyAnalysis {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let cycles = find_cycles(tasks, &by_id);
    let cyclic: HashSet<&str> = cycles
        .iter()
        .flatten()
        .map(String::as_str)
        .collect();

    let execution_levels = compute_levels(tasks, &by_id, &cyclic);
    let critical_path = compute_critical_path(tasks, &by_id, &execution_levels);
    let parallelizable_groups = compute_parallel_groups(&execution_levels, &by_id, pool_capacity);

    let mut ready_tasks = Vec::new();
    let mut blocked_tasks = Vec::new();
    for task in tasks {
        if task.status.is_terminal() {
            continue;
        }
        let satisfied = !cyclic.contains(task.id.as_str())
            && task.dependencies.iter().all(|dep| {
                by_id
                    .get(dep.as_str())
                    .map(|d| d.status.satisfies_dependency())
                    .unwrap_or(false)
            });
        if satisfied {
            ready_tasks.push(task.id.clone());
        } else {
            blocked_tasks.push(task.id.clone());
        }
    }

    DependencyAnalysis {
        has_cycles: !cycles.is_empty(),
        cycles,
        execution_levels,
        critical_path,
        parallelizable_groups,
        ready_tasks,
        blocked_tasks,
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-color DFS over dependency edges. Every distinct cycle is reported
/// once, in the order its edges are walked.
fn find_cycles(tasks: &[Task], by_id: &HashMap<&str, &Task>) -> Vec<Vec<String>> {
    let mut colors: HashMap<&str, Color> =
        tasks.iter().map(|t| (t.id.as_str(), Color::White)).collect();
    let mut cycles = Vec::new();

    for task in tasks {
        if colors[task.id.as_str()] == Color::White {
            let mut path: Vec<&str> = Vec::new();
            dfs_cycles(task.id.as_str(), by_id, &mut colors, &mut path, &mut cycles);
        }
    }
    cycles
}

fn dfs_cycles<'a>(
    node: &'a str,
    by_id: &HashMap<&str, &'a Task>,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    colors.insert(node, Color::Gray);
    path.push(node);

    if let Some(task) = by_id.get(node) {
        for dep in &task.dependencies {
            let dep = dep.as_str();
            match colors.get(dep).copied() {
                Some(Color::White) => dfs_cycles(dep, by_id, colors, path, cycles),
                Some(Color::Gray) => {
                    // Back edge: the cycle is the path suffix from `dep`.
                    if let Some(start) = path.iter().position(|&n| n == dep) {
                        cycles.push(path[start..].iter().map(|s| s.to_string()).collect());
                    }
                }
                // Black or a dangling reference: nothing to do.
                _ => {}
            }
        }
    }

    path.pop();
    colors.insert(node, Color::Black);
}

/// Kahn-style peeling: strip zero-in-degree tasks, level by level.
fn compute_levels(
    tasks: &[Task],
    by_id: &HashMap<&str, &Task>,
    cyclic: &HashSet<&str>,
) -> BTreeMap<usize, Vec<String>> {
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    for task in tasks {
        if cyclic.contains(task.id.as_str()) {
            continue;
        }
        let degree = task
            .dependencies
            .iter()
            .filter(|dep| by_id.contains_key(dep.as_str()) && !cyclic.contains(dep.as_str()))
            .count();
        remaining.insert(task.id.as_str(), degree);
    }

    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.id.as_str());
        }
    }

    let mut levels: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut frontier: Vec<&str> = remaining
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    frontier.sort_unstable();

    let mut level = 0usize;
    while !frontier.is_empty() {
        levels.insert(level, frontier.iter().map(|s| s.to_string()).collect());

        let mut next: Vec<&str> = Vec::new();
        for &id in &frontier {
            remaining.remove(id);
            if let Some(children) = dependents.get(id) {
                for &child in children {
                    if let Some(degree) = remaining.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(child);
                        }
                    }
                }
            }
        }
        next.sort_unstable();
        frontier = next;
        level += 1;
    }

    levels
}

fn weight(task: &Task) -> u64 {
    task.estimated_duration_ms.unwrap_or(1)
}

/// Prefer `a` over `b` on equal distance: higher priority, then earlier
/// creation, then lexical id.
fn better_tie(a: &Task, b: &Task) -> bool {
    (a.priority, std::cmp::Reverse(a.created_at), std::cmp::Reverse(a.id.as_str()))
        > (b.priority, std::cmp::Reverse(b.created_at), std::cmp::Reverse(b.id.as_str()))
}

/// Longest duration-weighted path, walked in level order so every
/// dependency's distance is final before its dependents are visited.
fn compute_critical_path(
    tasks: &[Task],
    by_id: &HashMap<&str, &Task>,
    levels: &BTreeMap<usize, Vec<String>>,
) -> Vec<String> {
    let mut dist: HashMap<&str, u64> = HashMap::new();
    let mut pred: HashMap<&str, &str> = HashMap::new();

    for ids in levels.values() {
        for id in ids {
            let task = match by_id.get(id.as_str()) {
                Some(t) => *t,
                None => continue,
            };
            let mut best: Option<(&str, u64)> = None;
            for dep in &task.dependencies {
                let dep = dep.as_str();
                let Some(&d) = dist.get(dep) else { continue };
                let replace = match best {
                    None => true,
                    Some((cur, cur_d)) => {
                        d > cur_d
                            || (d == cur_d
                                && by_id
                                    .get(dep)
                                    .zip(by_id.get(cur))
                                    .map(|(a, b)| better_tie(a, b))
                                    .unwrap_or(false))
                    }
                };
                if replace {
                    best = Some((dep, d));
                }
            }
            let base = best.map(|(_, d)| d).unwrap_or(0);
            dist.insert(task.id.as_str(), base + weight(task));
            if let Some((p, _)) = best {
                pred.insert(task.id.as_str(), p);
            }
        }
    }

    // Pick the endpoint with the greatest distance, tie-broken like edges.
    let mut end: Option<(&str, u64)> = None;
    for task in tasks {
        let Some(&d) = dist.get(task.id.as_str()) else { continue };
        let replace = match end {
            None => true,
            Some((cur, cur_d)) => {
                d > cur_d
                    || (d == cur_d
                        && by_id
                            .get(cur)
                            .map(|b| better_tie(task, b))
                            .unwrap_or(true))
            }
        };
        if replace {
            end = Some((task.id.as_str(), d));
        }
    }

    let mut path = Vec::new();
    let mut cursor = end.map(|(id, _)| id);
    while let Some(id) = cursor {
        path.push(id.to_string());
        cursor = pred.get(id).copied();
    }
    path.reverse();
    path
}

/// Greedy packing of each level into groups whose summed requirements fit
/// the pool capacities. Resources the pools do not define are unconstrained.
fn compute_parallel_groups(
    levels: &BTreeMap<usize, Vec<String>>,
    by_id: &HashMap<&str, &Task>,
    pool_capacity: &BTreeMap<String, u32>,
) -> Vec<Vec<String>> {
    let mut groups = Vec::new();

    for ids in levels.values() {
        let mut group: Vec<String> = Vec::new();
        let mut used: BTreeMap<&str, u32> = BTreeMap::new();

        for id in ids {
            let task = match by_id.get(id.as_str()) {
                Some(t) => *t,
                None => continue,
            };
            if task.status.is_terminal() {
                continue;
            }

            let fits = task.resource_requirements.iter().all(|(name, need)| {
                match pool_capacity.get(name) {
                    Some(&cap) => used.get(name.as_str()).copied().unwrap_or(0) + need <= cap,
                    None => true,
                }
            });

            if !fits {
                // Flush and start over. A task that alone exceeds capacity
                // still occupies its own group rather than vanishing from
                // the plan; the scheduler will simply never co-schedule it.
                if !group.is_empty() {
                    groups.push(std::mem::take(&mut group));
                    used.clear();
                }
            }
            for (name, need) in &task.resource_requirements {
                *used.entry(name.as_str()).or_default() += need;
            }
            group.push(id.clone());
        }

        if !group.is_empty() {
            groups.push(group);
        }
    }

    groups
}
