use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use crate::{Scope, Token};

/// Vertex of the [`DependencyGraph`].
#[derive(Clone, Debug)]
pub struct DependencyNode {
    pub token: Token,
    pub dependencies: Vec<Token>,
    pub scope: Scope,
    /// Dependencies allowed to have no provider.
    pub optional: Vec<Token>,
    /// Set by [`DependencyGraph::detect_cycles`].
    pub in_cycle: bool,
    /// Length of the longest known dependency chain below this node.
    pub depth: usize,
}

impl DependencyNode {
    pub fn new(token: Token, dependencies: Vec<Token>, scope: Scope) -> Self {
        Self {
            token,
            dependencies,
            scope,
            optional: Vec::new(),
            in_cycle: false,
            depth: 0,
        }
    }

    /// Marks `tokens` as optional dependencies of this node.
    pub fn optional(mut self, tokens: impl IntoIterator<Item = Token>) -> Self {
        for token in tokens {
            if !self.optional.contains(&token) {
                self.optional.push(token);
            }
        }
        self
    }

    pub fn is_optional(&self, dependency: &Token) -> bool {
        self.optional.contains(dependency)
    }

    pub fn depends_on_itself(&self) -> bool {
        self.dependencies.contains(&self.token)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleAnalysis {
    pub cycles: Vec<Vec<Token>>,
    pub max_cycle_length: usize,
    pub total_nodes: usize,
    pub nodes_in_cycles: usize,
}

/// Directed graph from tokens to their declared dependencies.
///
/// Used for diagnostics only, see [`Container::validate`](crate::Container::validate).
///
/// # Examples
///
/// ```rust
/// use anode::{DependencyGraph, DependencyNode, Scope, Token};
///
/// let mut graph = DependencyGraph::new();
/// graph.add_node(DependencyNode::new("a".into(), vec!["b".into()], Scope::Singleton));
/// graph.add_node(DependencyNode::new("b".into(), vec!["a".into()], Scope::Singleton));
///
/// let cycles = graph.detect_cycles();
/// assert_eq!(cycles.len(), 1);
/// assert_eq!(cycles[0].len(), 2);
/// ```
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<Token, DependencyNode>,
    // Insertion order of tokens, keeps traversals deterministic.
    order: Vec<Token>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `node`, replacing a previous node of the same token.
    pub fn add_node(&mut self, node: DependencyNode) {
        if !self.nodes.contains_key(&node.token) {
            self.order.push(node.token.clone());
        }
        self.nodes.insert(node.token.clone(), node);
    }

    pub fn node(&self, token: &Token) -> Option<&DependencyNode> {
        self.nodes.get(token)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.order.iter().filter_map(|v| self.nodes.get(v))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns strongly connected components with more than one member.
    ///
    /// Nodes depending only on themselves form a component of size one and
    /// are not reported, see [`DependencyGraph::self_loops`]. Members of the
    /// reported cycles get their `in_cycle` flag set.
    pub fn detect_cycles(&mut self) -> Vec<Vec<Token>> {
        let mut state = TarjanState::default();
        for token in &self.order {
            if !state.index.contains_key(token) {
                strong_connect(token, &self.nodes, &mut state);
            }
        }
        let cycles: Vec<Vec<Token>> = state
            .components
            .into_iter()
            .filter(|v| v.len() > 1)
            .collect();
        for node in self.nodes.values_mut() {
            node.in_cycle = false;
        }
        for token in cycles.iter().flatten() {
            if let Some(node) = self.nodes.get_mut(token) {
                node.in_cycle = true;
            }
        }
        self.update_depths();
        cycles
    }

    pub fn get_cycle_analysis(&mut self) -> CycleAnalysis {
        let cycles = self.detect_cycles();
        let nodes_in_cycles = cycles
            .iter()
            .flatten()
            .collect::<HashSet<_>>()
            .len();
        CycleAnalysis {
            max_cycle_length: cycles.iter().map(Vec::len).max().unwrap_or(0),
            total_nodes: self.nodes.len(),
            nodes_in_cycles,
            cycles,
        }
    }

    /// Tokens depending directly on themselves.
    pub fn self_loops(&self) -> Vec<Token> {
        self.nodes()
            .filter(|v| v.depends_on_itself())
            .map(|v| v.token.clone())
            .collect()
    }

    /// Edge targets that have no node, each reported once.
    ///
    /// Optional edges are skipped; a token is still reported when another
    /// node requires it.
    pub fn get_missing_dependencies(&self) -> Vec<Token> {
        let mut missing = Vec::new();
        for node in self.nodes() {
            for dependency in &node.dependencies {
                if node.is_optional(dependency) {
                    continue;
                }
                if !self.nodes.contains_key(dependency) && !missing.contains(dependency) {
                    missing.push(dependency.clone());
                }
            }
        }
        missing
    }

    /// Depth-first post-order: dependencies precede their dependents.
    ///
    /// Only meaningful for acyclic graphs, check [`DependencyGraph::detect_cycles`] first.
    pub fn get_resolution_order(&self) -> Vec<Token> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited = HashSet::new();
        for token in &self.order {
            post_order(token, &self.nodes, &mut visited, &mut order);
        }
        order
    }

    /// Human readable dump of the graph.
    pub fn visualize(&self) -> String {
        let mut out = String::new();
        for node in self.nodes() {
            let _ = write!(out, "{} [{}", node.token, node.scope);
            if node.in_cycle {
                out.push_str(", cycle");
            }
            out.push(']');
            if node.dependencies.is_empty() {
                out.push('\n');
                continue;
            }
            out.push_str(" -> ");
            for (i, dependency) in node.dependencies.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{dependency}");
                if !self.nodes.contains_key(dependency) {
                    out.push_str(" (missing)");
                }
            }
            out.push('\n');
        }
        out
    }

    fn update_depths(&mut self) {
        let mut depths = HashMap::new();
        let mut pending = HashSet::new();
        for token in &self.order {
            node_depth(token, &self.nodes, &mut depths, &mut pending);
        }
        for (token, depth) in depths {
            if let Some(node) = self.nodes.get_mut(&token) {
                node.depth = depth;
            }
        }
    }
}

#[derive(Default)]
struct TarjanState {
    next_index: usize,
    index: HashMap<Token, usize>,
    low_link: HashMap<Token, usize>,
    stack: Vec<Token>,
    on_stack: HashSet<Token>,
    components: Vec<Vec<Token>>,
}

fn strong_connect(token: &Token, nodes: &HashMap<Token, DependencyNode>, state: &mut TarjanState) {
    let index = state.next_index;
    state.next_index += 1;
    state.index.insert(token.clone(), index);
    state.low_link.insert(token.clone(), index);
    state.stack.push(token.clone());
    state.on_stack.insert(token.clone());

    if let Some(node) = nodes.get(token) {
        for dependency in &node.dependencies {
            // Edges to missing nodes cannot close a cycle.
            if !nodes.contains_key(dependency) {
                continue;
            }
            if !state.index.contains_key(dependency) {
                strong_connect(dependency, nodes, state);
                let low = state.low_link[token].min(state.low_link[dependency]);
                state.low_link.insert(token.clone(), low);
            } else if state.on_stack.contains(dependency) {
                let low = state.low_link[token].min(state.index[dependency]);
                state.low_link.insert(token.clone(), low);
            }
        }
    }

    if state.low_link[token] == index {
        let mut component = Vec::new();
        while let Some(member) = state.stack.pop() {
            state.on_stack.remove(&member);
            let done = &member == token;
            component.push(member);
            if done {
                break;
            }
        }
        component.reverse();
        state.components.push(component);
    }
}

fn post_order(
    token: &Token,
    nodes: &HashMap<Token, DependencyNode>,
    visited: &mut HashSet<Token>,
    order: &mut Vec<Token>,
) {
    let Some(node) = nodes.get(token) else {
        return;
    };
    if !visited.insert(token.clone()) {
        return;
    }
    for dependency in &node.dependencies {
        post_order(dependency, nodes, visited, order);
    }
    order.push(token.clone());
}

fn node_depth(
    token: &Token,
    nodes: &HashMap<Token, DependencyNode>,
    depths: &mut HashMap<Token, usize>,
    pending: &mut HashSet<Token>,
) -> usize {
    if let Some(depth) = depths.get(token) {
        return *depth;
    }
    let Some(node) = nodes.get(token) else {
        return 0;
    };
    if !pending.insert(token.clone()) {
        return 0;
    }
    let depth = node
        .dependencies
        .iter()
        .filter(|v| nodes.contains_key(*v) && *v != token)
        .map(|v| node_depth(v, nodes, depths, pending) + 1)
        .max()
        .unwrap_or(0);
    pending.remove(token);
    depths.insert(token.clone(), depth);
    depth
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(token: &str, dependencies: &[&str]) -> DependencyNode {
        DependencyNode::new(
            token.into(),
            dependencies.iter().map(|v| Token::from(*v)).collect(),
            Scope::Singleton,
        )
    }

    fn names(tokens: &[Token]) -> Vec<String> {
        tokens.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_two_node_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", &["b"]));
        graph.add_node(node("b", &["a"]));
        graph.add_node(node("c", &["a"]));

        let cycles = graph.detect_cycles();
        assert_eq!(cycles.len(), 1);
        let mut members = names(&cycles[0]);
        members.sort();
        assert_eq!(members, vec!["a", "b"]);
        assert!(graph.node(&"a".into()).unwrap().in_cycle);
        assert!(!graph.node(&"c".into()).unwrap().in_cycle);
    }

    #[test]
    fn test_self_loop_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", &["a"]));
        assert!(graph.detect_cycles().is_empty());
        assert_eq!(names(&graph.self_loops()), vec!["a"]);
    }

    #[test]
    fn test_cycle_analysis() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", &["b"]));
        graph.add_node(node("b", &["c"]));
        graph.add_node(node("c", &["a"]));
        graph.add_node(node("d", &["e"]));
        graph.add_node(node("e", &["d"]));
        graph.add_node(node("f", &[]));

        let analysis = graph.get_cycle_analysis();
        assert_eq!(analysis.cycles.len(), 2);
        assert_eq!(analysis.max_cycle_length, 3);
        assert_eq!(analysis.total_nodes, 6);
        assert_eq!(analysis.nodes_in_cycles, 5);
    }

    #[test]
    fn test_resolution_order() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("app", &["service", "config"]));
        graph.add_node(node("service", &["repository"]));
        graph.add_node(node("repository", &["config"]));
        graph.add_node(node("config", &[]));

        assert!(graph.detect_cycles().is_empty());
        assert_eq!(
            names(&graph.get_resolution_order()),
            vec!["config", "repository", "service", "app"],
        );
        assert_eq!(graph.node(&"app".into()).unwrap().depth, 3);
        assert_eq!(graph.node(&"config".into()).unwrap().depth, 0);
    }

    #[test]
    fn test_missing_dependencies() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", &["b", "x"]));
        graph.add_node(node("b", &["x", "y"]));
        assert_eq!(names(&graph.get_missing_dependencies()), vec!["x", "y"]);
        assert!(graph.visualize().contains("x (missing)"));
    }

    #[test]
    fn test_missing_optional_dependencies() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", &["x", "y"]).optional(["x".into(), "y".into()]));
        assert!(graph.get_missing_dependencies().is_empty());

        graph.add_node(node("b", &["y"]));
        assert_eq!(names(&graph.get_missing_dependencies()), vec!["y"]);
        assert!(graph.node(&"a".into()).unwrap().is_optional(&"x".into()));
        assert!(!graph.node(&"b".into()).unwrap().is_optional(&"y".into()));
    }

    #[test]
    fn test_add_node_overwrites() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", &["b"]));
        graph.add_node(node("b", &["a"]));
        graph.add_node(node("a", &[]));
        assert!(graph.detect_cycles().is_empty());
        assert_eq!(graph.len(), 2);
    }
}
