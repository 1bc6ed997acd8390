//! Hierarchical token accounting
//!
//! Each agent run owns a node; sub-agents and tool calls hang child nodes off
//! it. A node's total is its own usage plus everything below it.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sortie_provider::Usage;

struct Node {
    label: String,
    own: Mutex<Usage>,
    children: Mutex<Vec<TokenTracker>>,
}

/// Shared handle to one node of the usage tree. Clones refer to the same node.
#[derive(Clone)]
pub struct TokenTracker {
    node: Arc<Node>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TokenTracker {
    pub fn root(label: impl Into<String>) -> Self {
        Self {
            node: Arc::new(Node {
                label: label.into(),
                own: Mutex::new(Usage::default()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Scope whose usage rolls up into this one. Asking twice for the same
    /// label yields the same node.
    pub fn child(&self, label: impl Into<String>) -> Self {
        let label = label.into();
        let mut children = lock(&self.node.children);
        if let Some(existing) = children.iter().find(|c| c.label() == label) {
            return existing.clone();
        }
        let child = Self::root(label);
        children.push(child.clone());
        child
    }

    pub fn add(&self, usage: &Usage) {
        *lock(&self.node.own) += *usage;
    }

    pub fn own(&self) -> Usage {
        *lock(&self.node.own)
    }

    pub fn total(&self) -> Usage {
        let children: Vec<TokenTracker> = lock(&self.node.children).clone();
        let mut total = self.own();
        for child in children {
            total += child.total();
        }
        total
    }

    pub fn label(&self) -> &str {
        &self.node.label
    }

    pub fn children(&self) -> Vec<TokenTracker> {
        lock(&self.node.children).clone()
    }

    /// Indented usage tree, skipping scopes that never consumed anything
    pub fn report(&self) -> String {
        let mut out = String::new();
        self.render(0, &mut out);
        out
    }

    fn render(&self, depth: usize, out: &mut String) {
        let total = self.total();
        if depth > 0 && total.total() == 0 {
            return;
        }
        let _ = writeln!(
            out,
            "{}{}: {} in / {} out (cache {} read, {} write)",
            "  ".repeat(depth),
            self.label(),
            total.input_tokens,
            total.output_tokens,
            total.cache_read_tokens,
            total.cache_write_tokens
        );
        for child in self.children() {
            child.render(depth + 1, out);
        }
    }
}

impl std::fmt::Debug for TokenTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenTracker")
            .field("label", &self.label())
            .field("total", &self.total())
            .finish()
    }
}
