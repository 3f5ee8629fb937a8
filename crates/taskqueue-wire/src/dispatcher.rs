//! Turns a stream of freshly-leased tasks for one (session, queueName) pair
//! into outbound `TaskProcess` frames.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use taskqueue_core::queue::QueueService;

use crate::frame::Response;

pub struct Dispatcher {
    queue_service: Arc<QueueService>,
    queue_name: String,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(queue_service: Arc<QueueService>, queue_name: String, cancel: CancellationToken) -> Self {
        Self {
            queue_service,
            queue_name,
            cancel,
        }
    }

    /// Spawns the dispatch loop, feeding `out` until the dispatcher's scope
    /// is cancelled or the channel's receiver is dropped.
    pub fn spawn(self, out: mpsc::Sender<Response>) {
        tokio::spawn(async move {
            let mut tasks = self.queue_service.subscribe_stream(self.queue_name.clone(), self.cancel.clone());

            loop {
                let task = tokio::select! {
                    t = tasks.recv() => t,
                    _ = self.cancel.cancelled() => return,
                };

                let Some(task) = task else { return };

                if out.send(Response::task_process(&task)).await.is_err() {
                    return;
                }
            }
        });
    }
}
