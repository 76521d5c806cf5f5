//! Static index over properly nested spans, answering point queries.

use crate::{Error, Result};

use super::Span;

#[derive(Debug, Clone)]
struct Node<V> {
    span: Span,
    values: Vec<V>,
    /// Sorted by start, pairwise disjoint.
    children: Vec<usize>,
}

impl<V> Node<V> {
    fn new(span: Span) -> Self {
        Self {
            span,
            values: Vec::new(),
            children: Vec::new(),
        }
    }
}

/// Tree of spans where every pair of entries is either disjoint or nested.
///
/// Node `0` is a synthetic root covering [`Span::ALL`].
#[derive(Debug, Clone)]
pub struct IntervalTree<V> {
    nodes: Vec<Node<V>>,
}

impl<V> Default for IntervalTree<V> {
    fn default() -> Self {
        Self {
            nodes: vec![Node::new(Span::ALL)],
        }
    }
}

impl<V> IntervalTree<V> {
    /// Builds the tree, failing on partially overlapping spans.
    pub fn of(mut entries: Vec<(Span, V)>) -> Result<Self> {
        // Outer intervals are visited right before anything they contain.
        entries.sort_by(|(a, _), (b, _)| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

        let mut tree = Self::default();
        let mut stack = vec![0usize];

        for (span, value) in entries {
            while let Some(&top) = stack.last() {
                if top != 0 && span.start >= tree.nodes[top].span.end {
                    stack.pop();
                } else {
                    break;
                }
            }
            let parent = *stack
                .last()
                .ok_or_else(|| Error::internal("interval tree lost its root"))?;
            let parent_span = tree.nodes[parent].span;

            if parent_span == span && parent != 0 {
                tree.nodes[parent].values.push(value);
                continue;
            }
            if span.end > parent_span.end {
                return Err(Error::CrossingIntervals {
                    child: span,
                    parent: parent_span,
                });
            }

            let index = tree.nodes.len();
            let mut node = Node::new(span);
            node.values.push(value);
            tree.nodes.push(node);
            tree.nodes[parent].children.push(index);
            stack.push(index);
        }

        Ok(tree)
    }

    fn child_containing(&self, node: usize, offset: usize) -> Option<usize> {
        let children = &self.nodes[node].children;
        let upper = children.partition_point(|&child| self.nodes[child].span.start <= offset);
        let candidate = *children.get(upper.checked_sub(1)?)?;
        self.nodes[candidate]
            .span
            .contains(offset)
            .then_some(candidate)
    }

    /// Every value on the path to `offset`, outermost first.
    pub fn get_all(&self, offset: usize) -> Vec<&V> {
        let mut out = Vec::new();
        let mut node = 0;
        while let Some(child) = self.child_containing(node, offset) {
            out.extend(self.nodes[child].values.iter());
            node = child;
        }
        out
    }

    /// The first value of the innermost span containing `offset`.
    pub fn get_leaf(&self, offset: usize) -> Option<(Span, &V)> {
        let mut node = 0;
        let mut best = None;
        while let Some(child) = self.child_containing(node, offset) {
            node = child;
            best = Some(child);
        }
        let leaf = &self.nodes[best?];
        leaf.values.first().map(|value| (leaf.span, value))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }
}
