//! Integration tests for CommandQueue

use procraft::queue::{CommandQueue, QueueError, Value};
use proptest::prelude::*;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::test]
async fn test_fifo_without_waiters() {
    let queue = CommandQueue::new();
    queue.add([Value::One("a")]).await.unwrap();
    queue.add([Value::One("b")]).await.unwrap();

    assert_eq!(queue.next().await, Some("a"));
    assert_eq!(queue.next().await, Some("b"));
}

#[tokio::test]
async fn test_pending_waiter_receives_added_value() {
    let queue = Arc::new(CommandQueue::new());
    let pending = queue.next();

    let producer = Arc::clone(&queue);
    tokio::spawn(async move {
        producer.add([Value::One("x")]).await.unwrap();
    });

    assert_eq!(pending.await, Some("x"));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_nested_values_flatten_in_order() {
    let queue = CommandQueue::new();
    queue
        .add([Value::many([
            Value::One("a"),
            Value::many([Value::One("b"), Value::many([Value::One("c")])]),
        ])])
        .await
        .unwrap();
    queue.add([Value::One("d")]).await.unwrap();

    let mut out = Vec::new();
    while !queue.is_empty() {
        out.push(queue.next().await.unwrap());
    }
    assert_eq!(out, vec!["a", "b", "c", "d"]);
}

#[tokio::test(start_paused = true)]
async fn test_deferred_value_keeps_its_position() {
    let queue = CommandQueue::new();
    queue
        .add([
            Value::One("a"),
            Value::later(async {
                sleep(Duration::from_millis(50)).await;
                "b"
            }),
            Value::One("c"),
        ])
        .await
        .unwrap();

    assert_eq!(queue.next().await, Some("a"));
    assert_eq!(queue.next().await, Some("b"));
    assert_eq!(queue.next().await, Some("c"));
}

#[tokio::test(start_paused = true)]
async fn test_deferred_can_resolve_to_list() {
    let queue = CommandQueue::new();
    queue
        .add([Value::deferred(async {
            Ok(Value::list(["x", "y"]))
        })])
        .await
        .unwrap();

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.next().await, Some("x"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_adds_keep_issue_order() {
    let queue = CommandQueue::new();

    let slow = queue.add([Value::later(async {
        sleep(Duration::from_millis(100)).await;
        "slow"
    })]);
    let fast = async {
        tokio::task::yield_now().await;
        queue.add([Value::One("fast")]).await
    };
    let (slow, fast) = tokio::join!(slow, fast);
    slow.unwrap();
    fast.unwrap();

    assert_eq!(queue.next().await, Some("slow"));
    assert_eq!(queue.next().await, Some("fast"));
}

#[tokio::test]
async fn test_failed_deferred_only_fails_that_insertion() {
    let queue = CommandQueue::new();
    let result = queue
        .add([
            Value::One(1),
            Value::deferred(async { Err(QueueError::Deferred("boom".into())) }),
            Value::One(2),
        ])
        .await;

    assert!(matches!(result, Err(QueueError::Deferred(_))));
    assert_eq!(queue.len(), 1);

    queue.add([Value::One(3)]).await.unwrap();
    assert_eq!(queue.next().await, Some(1));
    assert_eq!(queue.next().await, Some(3));
}

#[tokio::test]
async fn test_push_does_not_wake_waiter() {
    let queue = CommandQueue::new();
    let waiting = queue.next();

    queue.push([Value::list(["p", "q"])]).await.unwrap();
    assert_eq!(queue.len(), 2);

    // The earlier waiter is served by the next add, not by the backlog.
    queue.add([Value::One("r")]).await.unwrap();
    assert_eq!(waiting.await, Some("r"));
    assert_eq!(queue.next().await, Some("p"));
}

#[tokio::test]
async fn test_closed_queue_is_done_after_backlog() {
    let queue = CommandQueue::new();
    queue.add([Value::list([1, 2])]).await.unwrap();
    queue.close();

    assert_eq!(queue.next().await, Some(1));
    assert_eq!(queue.next().await, Some(2));
    assert_eq!(queue.next().await, None);
}

fn nested(groups: &[Vec<u32>]) -> Vec<Value<u32>> {
    groups
        .iter()
        .map(|group| match group.len() {
            1 => Value::One(group[0]),
            _ => Value::many([Value::list(group.clone())]),
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_flatten_preserves_order(groups in prop::collection::vec(prop::collection::vec(any::<u32>(), 0..5), 0..8)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let out = runtime.block_on(async {
            let queue = CommandQueue::new();
            queue.add(nested(&groups)).await.unwrap();
            let mut out = Vec::new();
            while !queue.is_empty() {
                out.push(queue.next().await.unwrap());
            }
            out
        });

        let expected: Vec<u32> = groups.into_iter().flatten().collect();
        prop_assert_eq!(out, expected);
    }
}
