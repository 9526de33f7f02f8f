//! Built-in CEP that traces every matching update.

use async_trait::async_trait;
use tracing::info;

use super::{CepContext, CepFunction};
use crate::task::Task;

/// Registry name of [`SystemLogger`]. Exempt from CEP-sourced sync skipping
/// by default.
pub const SYSTEM_LOGGER: &str = "CEPSystemLogger";

pub struct SystemLogger;

#[async_trait]
impl CepFunction for SystemLogger {
    async fn call(&self, ctx: CepContext, task: &mut Task) -> anyhow::Result<()> {
        info!(
            owner = %ctx.owner_instance_id,
            instance_id = ?task.instance_id,
            task_id = ?task.id,
            state = ?task.current_state(),
            command = ?task.effective_command(),
            "CEP log"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Outbound;
    use crate::store::MemoryTaskStore;
    use crate::task::NodeRole;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn logger_leaves_task_untouched() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbound = Outbound::new("n1", NodeRole::Coprocessor, tx, Arc::new(MemoryTaskStore::new()));
        let ctx = CepContext {
            owner_instance_id: "sys".into(),
            name: SYSTEM_LOGGER.into(),
            args: None,
            outbound,
        };
        let mut task = Task::new("root.ui.chat", "i1");
        let before = task.clone();
        SystemLogger.call(ctx, &mut task).await.unwrap();
        assert_eq!(task, before);
        assert!(rx.try_recv().is_err());
    }
}
