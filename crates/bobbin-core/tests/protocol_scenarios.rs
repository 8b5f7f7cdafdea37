//! host と worker を LoopbackChannel でつないだ end-to-end シナリオ

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bobbin_core::app::{Effect, EndpointBuilder, RenderingQueue, Role, TaskKey, VisibleViews};
use bobbin_core::typed::{StreamAction, StreamHandler};
use bobbin_core::{
    BobbinError, DocumentId, Endpoint, LoopbackChannel, QueueingStrategy, RemoteError,
    RenderingState, StreamSink, ViewId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use ulid::Ulid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamFetch {
    key: String,
}

impl StreamAction for StreamFetch {
    const NAME: &'static str = "streamFetch";
    type Chunk = String;
}

fn connect_pair<H>(producer: H) -> (Endpoint, Endpoint)
where
    H: StreamHandler<StreamFetch> + 'static,
{
    let document = DocumentId::from_ulid(Ulid::new());
    let (host_port, worker_port) = LoopbackChannel::new();
    let worker = EndpointBuilder::for_document(Role::Worker, document)
        .register_stream::<StreamFetch, _>(producer)
        .unwrap()
        .expect_actions(&[StreamFetch::NAME])
        .build()
        .unwrap()
        .connect(Arc::new(worker_port));
    let host = EndpointBuilder::for_document(Role::Host, document)
        .build()
        .unwrap()
        .connect(Arc::new(host_port));
    (host, worker)
}

/// 3 つ送って終わる。2 つ目と 3 つ目の後で残り credit を報告する
struct ThreeChunks {
    credit: mpsc::UnboundedSender<f64>,
}

#[async_trait]
impl StreamHandler<StreamFetch> for ThreeChunks {
    async fn handle(&self, request: StreamFetch, sink: StreamSink<String>) -> Result<(), BobbinError> {
        sink.enqueue(format!("{}#1", request.key), 1.0).await?;
        sink.enqueue(format!("{}#2", request.key), 1.0).await?;
        let _ = self.credit.send(sink.desired_size());
        sink.enqueue(format!("{}#3", request.key), 1.0).await?;
        let _ = self.credit.send(sink.desired_size());
        Ok(())
    }
}

#[tokio::test]
async fn stream_fetch_blocks_on_credit_until_pulled() {
    let (credit_tx, mut credit_rx) = mpsc::unbounded_channel();
    let (host, worker) = connect_pair(ThreeChunks { credit: credit_tx });

    let reader = host
        .stream_typed(
            &StreamFetch {
                key: "page:3".into(),
            },
            QueueingStrategy::count(2.0),
        )
        .unwrap();

    // 2 つ送ったところで credit が尽きる
    assert_eq!(credit_rx.recv().await, Some(0.0));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(credit_rx.try_recv().is_err(), "producer should be blocked");
    assert_eq!(worker.counts().chunks_sent, 2);

    let chunks = reader.collect().await.unwrap();
    assert_eq!(chunks, vec!["page:3#1", "page:3#2", "page:3#3"]);
    // pull(2) のあとで 1 つ使った
    assert_eq!(credit_rx.recv().await, Some(1.0));
    assert!(host.counts().pulls_sent >= 1);
    assert_eq!(host.counts().chunks_received, 3);

    host.destroy();
    worker.destroy();
}

/// 1 つ送ったあと cancel されるまで待ち、その後にもう 1 つ送ろうとする
struct UntilCancelled {
    events: mpsc::UnboundedSender<&'static str>,
}

#[async_trait]
impl StreamHandler<StreamFetch> for UntilCancelled {
    async fn handle(&self, request: StreamFetch, sink: StreamSink<String>) -> Result<(), BobbinError> {
        let events = self.events.clone();
        sink.on_cancel(move |_reason| {
            let events = events.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = events.send("on_cancel finished");
                Ok(())
            }
        });

        sink.enqueue(request.key, 1.0).await?;
        let _ = self.events.send("enqueued");
        while !sink.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sink.enqueue("too late".into(), 1.0).await?;
        let _ = self.events.send("late enqueue returned");
        Ok(())
    }
}

#[tokio::test]
async fn cancel_in_flight_stream() {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (host, worker) = connect_pair(UntilCancelled { events: events_tx });

    let reader = host
        .stream_typed(
            &StreamFetch {
                key: "page:7".into(),
            },
            QueueingStrategy::count(4.0),
        )
        .unwrap();
    assert_eq!(reader.read().await.unwrap().as_deref(), Some("page:7"));
    assert_eq!(events_rx.recv().await, Some("enqueued"));

    let pending = tokio::spawn({
        let reader = reader.clone();
        async move { reader.read().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    reader.cancel(RemoteError::abort("page hidden")).await.unwrap();
    // cancel_complete は on_cancel が終わってから届く
    assert_eq!(events_rx.try_recv().ok(), Some("on_cancel finished"));
    assert_eq!(
        pending.await.unwrap(),
        Err(RemoteError::abort("page hidden"))
    );

    assert_eq!(events_rx.recv().await, Some("late enqueue returned"));
    assert_eq!(worker.counts().chunks_sent, 1);
    assert_eq!(host.live_streams(), (0, 0));
    assert!(host.fatal_error().is_none());
    assert!(worker.fatal_error().is_none());

    // もう一度 cancel しても何も起きない
    reader.cancel(RemoteError::abort("again")).await.unwrap();
    assert_eq!(host.counts().cancels_sent, 1);
}

#[test]
fn higher_priority_view_preempts_running_one() {
    let mut queue = RenderingQueue::new(2);
    let (a, b) = (ViewId::new(0), ViewId::new(1));

    // A を始め、B に切り替える（A は Paused のまま残る）
    queue.render_highest_priority(&VisibleViews::new(vec![a]), true);
    queue.render_highest_priority(&VisibleViews::new(vec![b]), true);
    assert_eq!(queue.state(a), RenderingState::Paused);
    assert_eq!(queue.state(b), RenderingState::Running);

    let visible = VisibleViews::from_weights([(a, Some(1)), (b, Some(0))]);
    let effects = queue.render_highest_priority(&visible, true);

    assert_eq!(
        effects,
        vec![
            Effect::Pause(TaskKey::display(b)),
            Effect::Resume(TaskKey::display(a)),
        ]
    );
    assert_eq!(queue.state(a), RenderingState::Running);
    assert_eq!(queue.state(b), RenderingState::Paused);
    assert_eq!(queue.highest_priority(), Some(a));
}

/// 2 つ送ってから壊れたデータに当たる
struct BrokenAfterTwo;

#[async_trait]
impl StreamHandler<StreamFetch> for BrokenAfterTwo {
    async fn handle(&self, request: StreamFetch, sink: StreamSink<String>) -> Result<(), BobbinError> {
        sink.enqueue(format!("{}#1", request.key), 1.0).await?;
        sink.enqueue(format!("{}#2", request.key), 1.0).await?;
        Err(RemoteError::InvalidContent {
            message: "bad xref".into(),
        }
        .into())
    }
}

#[tokio::test]
async fn producer_error_reaches_the_reader() {
    let (host, worker) = connect_pair(BrokenAfterTwo);

    let reader = host
        .stream_typed(
            &StreamFetch {
                key: "page:1".into(),
            },
            QueueingStrategy::count(4.0),
        )
        .unwrap();
    assert_eq!(reader.read().await.unwrap().as_deref(), Some("page:1#1"));
    assert_eq!(reader.read().await.unwrap().as_deref(), Some("page:1#2"));
    let err = reader.read().await.unwrap_err();
    assert_eq!(
        err,
        RemoteError::InvalidContent {
            message: "bad xref".into()
        }
    );
    // 以後の read も同じ理由で失敗する
    assert_eq!(reader.read().await.unwrap_err(), err);
    assert_eq!(host.live_streams(), (0, 0));

    host.destroy();
    worker.destroy();
}

#[tokio::test]
async fn calling_a_stream_action_is_answered_with_unknown() {
    let (host, worker) = connect_pair(BrokenAfterTwo);

    let err = host
        .call(StreamFetch::NAME, serde_json::json!({"key": "page:1"}))
        .await
        .unwrap_err();
    match err {
        BobbinError::Remote(RemoteError::Unknown { message, .. }) => {
            assert!(message.contains("is a stream"), "{message}")
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(worker.fatal_error().is_none());
    assert_eq!(worker.counts().chunks_sent, 0);

    host.destroy();
    worker.destroy();
}
