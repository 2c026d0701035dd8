use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events produced by a background task reacting to one store subscription.
///
/// Dropping the feed cancels the task, which drops the subscription; nothing
/// is written to the store on the way out.
pub struct Feed<T> {
    rx: mpsc::UnboundedReceiver<T>,
    task: JoinHandle<()>,
}

impl<T> Feed<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Next event, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// An event that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Cancels the task and waits until it is gone, so no further store
    /// write can originate from it.
    pub async fn shutdown(&mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        self.rx.close();
    }
}

impl<T> Drop for Feed<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
