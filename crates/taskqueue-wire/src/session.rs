//! Per-connection full-duplex session: decodes framed requests, drives the
//! queue/task services, multiplexes responses and streamed task
//! notifications onto the write side.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use taskqueue_core::queue::QueueService;
use taskqueue_core::task::TaskService;

use crate::dispatcher::Dispatcher;
use crate::frame::{read_request, write_response, FrameError, Request, Response};

/// Capacity of the internal channel the reader and every spawned
/// dispatcher send responses on; a blocked writer backpressures them,
/// which is the accepted trade-off over dropping frames.
const WRITE_CHANNEL_CAPACITY: usize = 1;

pub struct SubscriptionSession {
    queue_service: Arc<QueueService>,
    task_service: Arc<TaskService>,
}

impl SubscriptionSession {
    pub fn new(queue_service: Arc<QueueService>, task_service: Arc<TaskService>) -> Self {
        Self {
            queue_service,
            task_service,
        }
    }

    /// Runs the session to completion: spawns the writer, runs the reader
    /// inline, and returns once the connection is closed or `parent_cancel`
    /// fires. `stream` is split into owned read/write halves so the writer
    /// can run on its own task.
    pub async fn run<S>(&self, stream: S, parent_cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);
        let cancel = parent_cancel.child_token();
        let (tx, rx) = mpsc::channel::<Response>(WRITE_CHANNEL_CAPACITY);

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(write_loop(write_half, rx, writer_cancel));

        self.read_loop(&mut read_half, tx, cancel.clone()).await;

        cancel.cancel();
        let _ = writer.await;
    }

    async fn read_loop<R>(&self, reader: &mut R, tx: mpsc::Sender<Response>, cancel: CancellationToken)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let request = tokio::select! {
                r = read_request(reader) => r,
                _ = cancel.cancelled() => return,
            };

            match request {
                Ok(Request::ConnClose) => return,
                Ok(req) => {
                    if self.handle(req, &tx, &cancel).await.is_err() {
                        return;
                    }
                }
                Err(FrameError::Eof) => return,
                Err(e) => {
                    tracing::error!(error = %e, "read message error");
                    return;
                }
            }
        }
    }

    async fn handle(
        &self,
        req: Request,
        tx: &mpsc::Sender<Response>,
        cancel: &CancellationToken,
    ) -> Result<(), mpsc::error::SendError<Response>> {
        match req {
            Request::ConnClose => Ok(()),
            Request::QueueSubscribe { queue_name } => {
                if queue_name.is_empty() {
                    tracing::debug!("subscribe rejected: empty queue name");
                    return tx.send(Response::QueueSubscribeFail).await;
                }

                tracing::debug!(queue_name = %queue_name, "subscribed to queue chan");
                tx.send(Response::QueueSubscribePass).await?;

                let dispatcher = Dispatcher::new(self.queue_service.clone(), queue_name, cancel.child_token());
                dispatcher.spawn(tx.clone());
                Ok(())
            }
            Request::TaskAck { task_id } => match self.task_service.ack(task_id, None).await {
                Ok(()) => tx.send(Response::TaskAckPass).await,
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "task ack error");
                    tx.send(Response::TaskAckFail).await
                }
            },
            Request::TaskNack { task_id } => match self.task_service.nack(task_id, None).await {
                Ok(()) => tx.send(Response::TaskNackPass).await,
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "task nack error");
                    tx.send(Response::TaskNackFail).await
                }
            },
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Response>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let resp = tokio::select! {
            r = rx.recv() => r,
            _ = cancel.cancelled() => return,
        };

        let Some(resp) = resp else { return };

        if let Err(e) = write_response(&mut writer, &resp).await {
            tracing::error!(error = %e, "write message error");
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
}
