//! Two subscribers fan out 100 pushed tasks between them with no task
//! delivered twice.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskqueue_core::clock::SystemClock;
use taskqueue_core::idempotency::IdempotencyCache;
use taskqueue_core::queue::{PushRequest, QueueService};
use taskqueue_core::task::TaskService;
use taskqueue_core::testing::InMemoryStore;
use taskqueue_wire::frame::{InType, OutType, SIZE_QUEUE_NAME, SIZE_TASK_CREATED_AT, SIZE_TASK_ID, SIZE_TASK_PAYLOAD};
use taskqueue_wire::SubscriptionSession;

const TASK_COUNT: usize = 100;

/// Subscribes `session` to "q" and reads `TaskProcess` frames until the
/// shared `delivered` counter reaches `total` (at which point every other
/// collector's read loop also observes the target and exits) or the
/// session closes.
async fn subscribe_and_collect(
    session: Arc<SubscriptionSession>,
    cancel: CancellationToken,
    delivered: Arc<AtomicUsize>,
    total: usize,
) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<Vec<Uuid>>) {
    let (client, server) = duplex(64 * 1024);
    let session_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move { session.run(server, session_cancel).await });

    let (mut read_half, mut write_half) = tokio::io::split(client);

    write_half.write_u8(InType::QueueSubscribe as u8).await.unwrap();
    let mut queue_name_buf = [0u8; SIZE_QUEUE_NAME];
    queue_name_buf[..1].copy_from_slice(b"q");
    write_half.write_all(&queue_name_buf).await.unwrap();

    let collector_cancel = cancel.clone();
    let collector = tokio::spawn(async move {
        let cancel = collector_cancel;
        let mut received = Vec::new();

        let mut resp_type = [0u8; 1];
        read_half.read_exact(&mut resp_type).await.unwrap();
        assert_eq!(resp_type[0], OutType::QueueSubscribePass as u8);

        while delivered.load(Ordering::SeqCst) < total {
            let mut resp_type = [0u8; 1];
            if read_half.read_exact(&mut resp_type).await.is_err() {
                break;
            }
            assert_eq!(resp_type[0], OutType::TaskProcess as u8);

            let mut id_buf = [0u8; SIZE_TASK_ID];
            read_half.read_exact(&mut id_buf).await.unwrap();

            let mut payload_buf = [0u8; SIZE_TASK_PAYLOAD];
            read_half.read_exact(&mut payload_buf).await.unwrap();

            let mut created_at_buf = [0u8; SIZE_TASK_CREATED_AT];
            read_half.read_exact(&mut created_at_buf).await.unwrap();

            received.push(Uuid::from_bytes(id_buf));
            if delivered.fetch_add(1, Ordering::SeqCst) + 1 >= total {
                // Last expected frame: tear down both sessions so the
                // peer collector's in-flight read unblocks via EOF
                // instead of waiting forever for a frame that won't come.
                cancel.cancel();
                break;
            }
        }

        received
    });

    (server_handle, collector)
}

#[tokio::test]
async fn subscription_fan_out_delivers_every_task_exactly_once() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(SystemClock);
    let idempotency = Arc::new(IdempotencyCache::new());
    let queue_service = Arc::new(QueueService::new(clock.clone(), idempotency.clone(), store.clone()));
    let task_service = Arc::new(TaskService::new(clock, idempotency, store));

    let base_cancel = CancellationToken::new();
    let delivered = Arc::new(AtomicUsize::new(0));

    let s1 = Arc::new(SubscriptionSession::new(queue_service.clone(), task_service.clone()));
    let s2 = Arc::new(SubscriptionSession::new(queue_service.clone(), task_service.clone()));

    let (s1_handle, s1_collector) =
        subscribe_and_collect(s1, base_cancel.clone(), delivered.clone(), TASK_COUNT).await;
    let (s2_handle, s2_collector) =
        subscribe_and_collect(s2, base_cancel.clone(), delivered.clone(), TASK_COUNT).await;

    for i in 0..TASK_COUNT {
        queue_service
            .push(PushRequest {
                queue_name: "q".to_string(),
                payload: format!("task-{i}"),
                idempotency_key: None,
            })
            .await
            .unwrap();
    }

    let (s1_ids, s2_ids) = tokio::time::timeout(Duration::from_secs(10), async {
        let s1_ids = s1_collector.await.unwrap();
        let s2_ids = s2_collector.await.unwrap();
        (s1_ids, s2_ids)
    })
    .await
    .expect("fan-out did not complete in time");

    base_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), s1_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), s2_handle).await;

    let mut all_ids: Vec<Uuid> = s1_ids.into_iter().chain(s2_ids).collect();
    assert_eq!(all_ids.len(), TASK_COUNT);

    let unique: HashSet<Uuid> = all_ids.drain(..).collect();
    assert_eq!(unique.len(), TASK_COUNT, "no task id should be delivered twice");
}
