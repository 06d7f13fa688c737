use tokio::task::JoinHandle;

/// Owner of the single live poll loop for an orchestrator.
///
/// Starting a new loop aborts the previous one, so at most one loop runs at
/// a time. Aborting drops any poll still in flight.
#[derive(Debug, Default)]
pub struct PollingHandle {
    task: Option<(u64, JoinHandle<()>)>,
}

impl PollingHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the loop for job `epoch`, replacing any existing one.
    pub fn start(&mut self, epoch: u64, task: JoinHandle<()>) {
        if let Some((previous, old)) = self.task.replace((epoch, task)) {
            tracing::debug!(previous_epoch = previous, epoch, "Replacing active poll loop");
            old.abort();
        }
    }

    /// Abort the loop, if any. Safe to call repeatedly.
    pub fn stop(&mut self) -> bool {
        match self.task.take() {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Forget the loop for `epoch` without aborting it. Used by the loop
    /// itself once it has finished its work.
    pub fn release(&mut self, epoch: u64) {
        if matches!(self.task, Some((active, _)) if active == epoch) {
            self.task = None;
        }
    }

    pub fn is_active(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|(_, task)| !task.is_finished())
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
