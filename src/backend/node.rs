//! The flat output node table. Generated graphs are value graphs: a node is
//! either a constant or an op applied to earlier nodes, and structurally
//! identical nodes are stored once. Roots (one per archetype callback) are
//! plain indexes into the table.

use hashbrown::HashMap;
use serde::Serialize;

use crate::backend::ops::Op;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutputNode {
    Value { value: f64 },
    Function { func: &'static str, args: Vec<usize> },
}

/// Hash-consing node builder shared by every callback of one compiled mode
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: Vec<OutputNode>,
    index: HashMap<NodeKey, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeKey {
    // f64 is not Hash; constants are keyed by their bit pattern
    Value(u64),
    Function(&'static str, Vec<usize>),
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&mut self, value: f64) -> usize {
        let key = NodeKey::Value(value.to_bits());

        if let Some(existing) = self.index.get(&key) {
            return *existing;
        }

        let index = self.nodes.len();
        self.nodes.push(OutputNode::Value { value });
        self.index.insert(key, index);

        index
    }

    pub fn function(&mut self, op: Op, args: Vec<usize>) -> usize {
        let func = op.engine_name();
        let key = NodeKey::Function(func, args.clone());

        if let Some(existing) = self.index.get(&key) {
            return *existing;
        }

        let index = self.nodes.len();
        self.nodes.push(OutputNode::Function { func, args });
        self.index.insert(key, index);

        index
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[OutputNode] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_subtrees_are_stored_once() {
        let mut table = NodeTable::new();

        let one = table.value(1.0);
        let two = table.value(2.0);
        let a = table.function(Op::Add, vec![one, two]);
        let b = table.function(Op::Add, vec![one, two]);

        assert_eq!(a, b);
        assert_eq!(table.len(), 3);

        let c = table.function(Op::Add, vec![two, one]);
        assert_ne!(a, c);
    }

    #[test]
    fn constants_are_keyed_by_bits() {
        let mut table = NodeTable::new();

        assert_eq!(table.value(0.5), table.value(0.5));
        assert_ne!(table.value(0.0), table.value(-0.0));
    }

    #[test]
    fn serializes_in_the_runtime_shape() {
        let mut table = NodeTable::new();

        let zero = table.value(0.0);
        table.function(Op::Get, vec![zero, zero]);

        let json = serde_json::to_string(table.nodes()).unwrap();
        assert_eq!(json, r#"[{"value":0.0},{"func":"Get","args":[0,0]}]"#);
    }
}
