use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::crew::{find_cycle, DependencyGraph};
use crate::error::{CrewError, Result};

use super::types::{FlowTransition, TransitionKind};

/// `validate_workflow()` 的结果
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct FlowPlan {
    pub entry_nodes: Vec<String>,
    pub terminal_nodes: Vec<String>,
    /// 去掉循环边与重试边后的前向顺序
    pub order: Vec<String>,
    pub back_edges: Vec<(String, String)>,
}

/// 校验与调度共用的边分类
pub(crate) struct Topology {
    pub entries: Vec<String>,
    pub terminals: Vec<String>,
    pub back_edges: HashSet<usize>,
    pub outgoing: HashMap<String, Vec<usize>>,
    pub incoming: HashMap<String, Vec<usize>>,
    pub order: Vec<String>,
}

impl Topology {
    pub fn build(
        nodes: &[String],
        transitions: &[FlowTransition],
        entry: Option<&str>,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(CrewError::InvalidConfiguration(
                "flow has no agents".to_string(),
            ));
        }
        for transition in transitions {
            for endpoint in [&transition.from, &transition.to] {
                if !nodes.contains(endpoint) {
                    return Err(CrewError::UnknownNode(endpoint.clone()));
                }
            }
        }
        if let Some(entry) = entry {
            if !nodes.iter().any(|node| node == entry) {
                return Err(CrewError::UnknownNode(entry.to_string()));
            }
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, transition) in transitions.iter().enumerate() {
            outgoing.entry(transition.from.clone()).or_default().push(index);
            incoming.entry(transition.to.clone()).or_default().push(index);
        }

        // handler -> source 的边，用于重试失败的 source
        let retry_edges: HashSet<usize> = transitions
            .iter()
            .enumerate()
            .filter(|(_, transition)| !transition.kind.is_error())
            .filter(|(_, transition)| {
                transitions.iter().any(|other| {
                    other.kind.is_error() && other.from == transition.to && other.to == transition.from
                })
            })
            .map(|(index, _)| index)
            .collect();

        let unconditional: Vec<&str> = nodes.iter().map(String::as_str).collect();
        if let Some(cycle) = find_cycle(&unconditional, |node| {
            outgoing
                .get(node)
                .map(|edges| {
                    edges
                        .iter()
                        .map(|index| &transitions[*index])
                        .filter(|transition| matches!(transition.kind, TransitionKind::OnSuccess))
                        .map(|transition| transition.to.as_str())
                        .collect()
                })
                .unwrap_or_default()
        }) {
            return Err(CrewError::CycleDetected(cycle));
        }

        let reach: HashMap<&str, HashSet<&str>> = nodes
            .iter()
            .map(|node| (node.as_str(), forward_reach(node, transitions, &outgoing)))
            .collect();
        let reaches = |from: &str, to: &str| {
            reach.get(from).is_some_and(|set| set.contains(to))
        };

        let entries: Vec<String> = match entry {
            Some(entry) => vec![entry.to_string()],
            None => {
                // 每条入边要么是重试边，要么是从本节点开始的循环绕回来的边
                let candidates: Vec<&String> = nodes
                    .iter()
                    .filter(|node| {
                        incoming.get(node.as_str()).map_or(true, |edges| {
                            edges.iter().all(|index| {
                                let transition = &transitions[*index];
                                retry_edges.contains(index)
                                    || (!transition.kind.is_error()
                                        && reaches(node.as_str(), transition.from.as_str()))
                            })
                        })
                    })
                    .collect();
                let mut roots: Vec<String> = Vec::new();
                for node in candidates {
                    let same_loop = roots.iter().any(|root| {
                        reaches(root.as_str(), node.as_str()) && reaches(node.as_str(), root.as_str())
                    });
                    if !same_loop {
                        roots.push(node.clone());
                    }
                }
                if roots.is_empty() {
                    nodes.iter().take(1).cloned().collect()
                } else {
                    roots
                }
            }
        };

        // 循环头优先，使被标记为回边的是闭合循环的那条边
        let mut starts: Vec<&str> = entries
            .iter()
            .filter(|node| incoming.contains_key(node.as_str()))
            .map(String::as_str)
            .collect();
        starts.extend(
            entries
                .iter()
                .filter(|node| !incoming.contains_key(node.as_str()))
                .map(String::as_str),
        );
        starts.extend(nodes.iter().map(String::as_str));

        let mut back_edges = retry_edges;
        let mut visited: HashSet<&str> = HashSet::new();
        for start in starts {
            if visited.contains(start) {
                continue;
            }
            let mut on_stack: Vec<&str> = Vec::new();
            mark_back_edges(
                start,
                transitions,
                &outgoing,
                &mut visited,
                &mut on_stack,
                &mut back_edges,
            );
        }

        let terminals = nodes
            .iter()
            .filter(|node| {
                let forward_out = outgoing
                    .get(node.as_str())
                    .map(|edges| edges.iter().any(|index| !transitions[*index].kind.is_error()))
                    .unwrap_or(false);
                let inbound = incoming.get(node.as_str());
                let pure_handler = inbound
                    .map(|edges| {
                        edges.iter().any(|index| transitions[*index].kind.is_error())
                            && edges.iter().all(|index| transitions[*index].kind.is_error())
                    })
                    .unwrap_or(false);
                !forward_out && !pure_handler
            })
            .cloned()
            .collect();

        let mut graph = DependencyGraph::new();
        for node in nodes {
            graph.add_node(node.clone());
        }
        for (index, transition) in transitions.iter().enumerate() {
            if !back_edges.contains(&index) {
                graph.add_edge(transition.from.clone(), transition.to.clone());
            }
        }
        let order = graph.topological_order()?;

        Ok(Self {
            entries,
            terminals,
            back_edges,
            outgoing,
            incoming,
            order,
        })
    }

    pub fn outgoing(&self, node: &str) -> &[usize] {
        self.outgoing.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 决定就绪的入边（不含回边）
    pub fn readiness_edges<'a>(&'a self, node: &str) -> impl Iterator<Item = usize> + 'a {
        self.incoming
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .copied()
            .filter(move |index| !self.back_edges.contains(index))
    }

    pub fn is_back_edge(&self, index: usize) -> bool {
        self.back_edges.contains(&index)
    }

    pub fn plan(&self, transitions: &[FlowTransition]) -> FlowPlan {
        let mut back_edges: Vec<(String, String)> = self
            .back_edges
            .iter()
            .map(|index| {
                let transition = &transitions[*index];
                (transition.from.clone(), transition.to.clone())
            })
            .collect();
        back_edges.sort();
        FlowPlan {
            entry_nodes: self.entries.clone(),
            terminal_nodes: self.terminals.clone(),
            order: self.order.clone(),
            back_edges,
        }
    }
}

/// 从 `start` 沿成功边与条件边可达的节点
fn forward_reach<'a>(
    start: &'a str,
    transitions: &'a [FlowTransition],
    outgoing: &'a HashMap<String, Vec<usize>>,
) -> HashSet<&'a str> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        for index in outgoing.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            let transition = &transitions[*index];
            if !transition.kind.is_error() && seen.insert(transition.to.as_str()) {
                stack.push(transition.to.as_str());
            }
        }
    }
    seen
}

fn mark_back_edges<'a>(
    node: &'a str,
    transitions: &'a [FlowTransition],
    outgoing: &'a HashMap<String, Vec<usize>>,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut Vec<&'a str>,
    back_edges: &mut HashSet<usize>,
) {
    visited.insert(node);
    on_stack.push(node);
    for index in outgoing.get(node).map(Vec::as_slice).unwrap_or(&[]) {
        let target = transitions[*index].to.as_str();
        if on_stack.contains(&target) {
            back_edges.insert(*index);
        } else if !visited.contains(target) {
            mark_back_edges(target, transitions, outgoing, visited, on_stack, back_edges);
        }
    }
    on_stack.pop();
}
