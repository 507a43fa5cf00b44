use std::collections::{HashMap, VecDeque};

use crate::error::{CrewError, Result};

/// 依赖图（source -> target 表示 target 依赖 source）
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    edges: Vec<(String, String)>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: impl Into<String>) {
        let node = node.into();
        if !self.nodes.contains(&node) {
            self.nodes.push(node);
        }
    }

    pub fn add_edge(&mut self, source: impl Into<String>, target: impl Into<String>) {
        let edge = (source.into(), target.into());
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    pub fn has_edges(&self) -> bool {
        !self.edges.is_empty()
    }

    pub fn dependencies(&self, node: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, target)| target == node)
            .map(|(source, _)| source.as_str())
            .collect()
    }

    pub fn dependents(&self, node: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(source, _)| source == node)
            .map(|(_, target)| target.as_str())
            .collect()
    }

    /// 没有任何节点依赖的节点
    pub fn terminals(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|node| self.dependents(node).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Kahn 算法；并列时按注册顺序
    pub fn topological_order(&self) -> Result<Vec<String>> {
        for (source, target) in &self.edges {
            for endpoint in [source, target] {
                if !self.nodes.contains(endpoint) {
                    return Err(CrewError::UnknownNode(endpoint.clone()));
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|node| (node.as_str(), 0)).collect();
        for (_, target) in &self.edges {
            if let Some(degree) = in_degree.get_mut(target.as_str()) {
                *degree += 1;
            }
        }

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(String::as_str)
            .filter(|node| in_degree.get(node) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            for next in self.dependents(node) {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            let remaining: Vec<&str> = self
                .nodes
                .iter()
                .map(String::as_str)
                .filter(|node| !order.iter().any(|done| done == *node))
                .collect();
            Err(CrewError::CycleDetected(
                find_cycle(&remaining, |node| self.dependents(node)).unwrap_or_else(|| {
                    remaining.iter().map(|node| node.to_string()).collect()
                }),
            ))
        }
    }
}

/// 对 `nodes` 做 DFS；以 `[a, b, .., a]` 形式返回找到的第一个环
pub(crate) fn find_cycle<'a, F>(nodes: &[&'a str], successors: F) -> Option<Vec<String>>
where
    F: Fn(&'a str) -> Vec<&'a str>,
{
    // 0 = 未访问，1 = 在栈中，2 = 已完成
    let mut marks: HashMap<&str, u8> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a, F>(
        node: &'a str,
        successors: &F,
        marks: &mut HashMap<&'a str, u8>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>>
    where
        F: Fn(&'a str) -> Vec<&'a str>,
    {
        match marks.get(node) {
            Some(1) => {
                let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            Some(2) => return None,
            _ => {}
        }
        marks.insert(node, 1);
        stack.push(node);
        for next in successors(node) {
            if let Some(cycle) = visit(next, successors, marks, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        marks.insert(node, 2);
        None
    }

    nodes
        .iter()
        .find_map(|node| visit(*node, &successors, &mut marks, &mut stack))
}
