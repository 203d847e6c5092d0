//! Singly linked node shared by the stack, queue and list.

use crate::numa::NodeBox;

pub(crate) type Link<'a> = Option<NodeBox<'a, ChainNode<'a>>>;

pub(crate) struct ChainNode<'a> {
    pub(crate) value: u64,
    pub(crate) next: Link<'a>,
}

impl ChainNode<'_> {
    pub(crate) fn new(value: u64) -> Self {
        Self { value, next: None }
    }
}

/// Free a chain front to back without recursing through `next`.
pub(crate) fn drop_chain(mut head: Link<'_>) {
    while let Some(mut node) = head {
        head = node.next.take();
    }
}

/// Iterate the values of a chain.
pub(crate) fn values<'c, 'a>(head: &'c Link<'a>) -> Values<'c, 'a> {
    Values {
        cursor: head.as_deref(),
    }
}

pub(crate) struct Values<'c, 'a> {
    cursor: Option<&'c ChainNode<'a>>,
}

impl Iterator for Values<'_, '_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let node = self.cursor?;
        self.cursor = node.next.as_deref();
        Some(node.value)
    }
}
