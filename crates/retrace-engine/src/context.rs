//! Ambient context propagation.
//!
//! [`with_context`] activates an [`OperationContext`] for the duration of a
//! future via a tokio task-local; everything the future calls observes it
//! through [`current`], with no parameter threading. The scope is restored
//! on every exit path, panics included.
//!
//! Deferred work must never read the task-local lazily: a task queued during
//! an operation stores an owned clone of the context captured at deferral
//! time, so it still observes the right operator and correlation id when it
//! runs after commit under whatever context happens to be active then.

use retrace_core::context::OperationContext;

tokio::task_local! {
    static CURRENT_CONTEXT: OperationContext;
}

/// Run `fut` with `ctx` as the ambient operation context.
pub async fn with_context<F>(ctx: OperationContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONTEXT.scope(ctx, fut).await
}

/// The active context, or `OperationContext::system()` outside any scope.
#[must_use]
pub fn current() -> OperationContext {
    try_current().unwrap_or_else(OperationContext::system)
}

/// The active context, if any.
#[must_use]
pub fn try_current() -> Option<OperationContext> {
    CURRENT_CONTEXT.try_with(Clone::clone).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn scope_activates_and_restores() {
        assert!(try_current().is_none());

        let ctx = OperationContext::new("alice", "cor-11111111");
        with_context(ctx, async {
            assert_eq!(current().operator, "alice");
        })
        .await;

        assert!(try_current().is_none());
        assert_eq!(current().operator, "system");
    }

    #[tokio::test]
    async fn nested_scope_shadows_and_unwinds() {
        let outer = OperationContext::new("alice", "cor-11111111");
        let inner = OperationContext::new("bob", "cor-22222222");

        with_context(outer, async {
            with_context(inner, async {
                assert_eq!(current().operator, "bob");
            })
            .await;
            assert_eq!(current().operator, "alice");
        })
        .await;
    }

    #[tokio::test]
    async fn deferred_task_sees_captured_snapshot_not_live_context() {
        let ctx = OperationContext::new("alice", "cor-11111111");

        // Deferral captures an owned clone; the closure runs later, outside
        // the scope that was active at capture time.
        let captured = with_context(ctx, async { current() }).await;
        let deferred = move || captured.operator.clone();

        assert_eq!(current().operator, "system");
        assert_eq!(deferred(), "alice");
    }
}
