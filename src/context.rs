use rand::Rng;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-request context: a short correlation id plus a cancellation token.
///
/// Contexts form a tree — one root per client request, one child per
/// dispatched task. Children inherit cancellation from their parent;
/// cancellation is monotonic. The id is stamped on every log line emitted
/// on behalf of the request so partial-response logs can be correlated.
#[derive(Clone)]
pub struct Context {
    id: Arc<str>,
    cancel: CancellationToken,
}

impl Context {
    pub fn root() -> Self {
        Self {
            id: short_id().into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Derive a child context. The child carries its own id (prefixed with
    /// the parent's for readability) and is cancelled whenever the parent is.
    pub fn child(&self) -> Self {
        Self {
            id: format!("{}/{}", self.id, short_id()).into(),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when this context (or any ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

fn short_id() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits_cancellation() {
        let root = Context::root();
        let child = root.child();
        let grandchild = child.child();

        assert!(!grandchild.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let root = Context::root();
        let child = root.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_child_id_carries_parent_prefix() {
        let root = Context::root();
        let child = root.child();
        assert!(child.id().starts_with(root.id()));
        assert_ne!(child.id(), root.id());
    }
}
