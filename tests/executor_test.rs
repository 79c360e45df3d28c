//! Deadline enforcement and request concurrency through the handle.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use vlm_runtime::cache::TurnSnapshot;
use vlm_runtime::{
    ChatMessage, EmbeddingRanker, ItemId, ModelBinding, RankOutcome, RankingModel,
    RequestParams, Result, StatusCode, Ticket, VlmError, VlmHandle,
};

/// Delays before ranking, honoring cancellation while it waits.
struct SlowRanker {
    delay: Duration,
}

impl RankingModel for SlowRanker {
    fn rank(
        &self,
        binding: &ModelBinding,
        snapshot: &TurnSnapshot,
        new_items: &[ItemId],
        params: &RequestParams,
        ticket: &Ticket,
    ) -> Result<RankOutcome> {
        let deadline = Instant::now() + self.delay;
        while Instant::now() < deadline {
            if ticket.is_cancelled() {
                return Err(VlmError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        EmbeddingRanker.rank(binding, snapshot, new_items, params, ticket)
    }
}

fn ready_handle(model: &tempfile::TempDir) -> VlmHandle {
    common::init_tracing();
    let handle = VlmHandle::new();
    handle
        .initialize(model.path().to_str().unwrap(), "cuda:0", None)
        .unwrap();
    handle
}

#[test]
fn slow_generation_reports_timeout() {
    let model = common::model_dir("rec-v1", 32, 8);
    let handle = ready_handle(&model);
    handle.set_ranker(Arc::new(SlowRanker {
        delay: Duration::from_millis(500),
    }));

    let messages = [ChatMessage::user("jacket")];
    let started = Instant::now();
    let response = handle.chat_completions("rec-v1", &messages, None, 25);
    assert_eq!(response.status, StatusCode::Timeout);
    assert!(response.choices.is_empty());
    assert!(started.elapsed() < Duration::from_millis(400), "caller must not wait for the worker");

    // Destroy joins the stranded worker before releasing resources.
    let gauge = handle.device_memory_gauge().unwrap();
    handle.destroy();
    assert_eq!(gauge.bytes(), 0);
}

#[test]
fn timed_out_turn_leaves_no_session_trace() {
    let model = common::model_dir("rec-v1", 32, 8);
    let handle = ready_handle(&model);
    handle.set_ranker(Arc::new(SlowRanker {
        delay: Duration::from_millis(100),
    }));

    let messages = [ChatMessage::user("jacket")];
    let response = handle.chat_completions("rec-v1", &messages, None, 10);
    assert_eq!(response.status, StatusCode::Timeout);

    // Let the cancelled worker drain fully.
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(handle.session_history_len("rec-v1", &messages), Some(0));

    // The session serves normally once the ranker is fast again.
    handle.set_ranker(Arc::new(EmbeddingRanker));
    let response = handle.chat_completions("rec-v1", &messages, None, 0);
    assert_eq!(response.status, StatusCode::Success);
    assert!(handle.session_history_len("rec-v1", &messages).unwrap() > 0);

    handle.destroy();
}

#[test]
fn distinct_sessions_serve_concurrently() {
    let model = common::model_dir("rec-v1", 64, 8);
    let handle = Arc::new(ready_handle(&model));

    let joins: Vec<_> = ["jacket", "boots", "scarf", "gloves"]
        .into_iter()
        .map(|opening| {
            let handle = handle.clone();
            std::thread::spawn(move || {
                handle.chat_completions("rec-v1", &[ChatMessage::user(opening)], None, 5_000)
            })
        })
        .collect();

    for join in joins {
        let response = join.join().unwrap();
        assert_eq!(response.status, StatusCode::Success);
    }
    assert_eq!(handle.cache_len(), 4);
    handle.destroy();
}

#[test]
fn same_session_turns_are_serialized() {
    let model = common::model_dir("rec-v1", 64, 8);
    let handle = Arc::new(ready_handle(&model));
    let messages = [ChatMessage::user("jacket")];

    let joins: Vec<_> = (0..4)
        .map(|_| {
            let handle = handle.clone();
            let messages = messages.clone();
            std::thread::spawn(move || handle.chat_completions("rec-v1", &messages, None, 0))
        })
        .collect();

    let mut committed = 0;
    for join in joins {
        let response = join.join().unwrap();
        assert_eq!(response.status, StatusCode::Success);
        committed += 1 + response.choices[0]
            .message
            .content
            .trim_start_matches("items: ")
            .split_whitespace()
            .count();
    }

    // Every turn committed whole: the history is the exact sum of the
    // four turns, with no interleaved partial writes.
    assert_eq!(
        handle.session_history_len("rec-v1", &messages),
        Some(committed)
    );
    assert_eq!(handle.cache_len(), 1);
    handle.destroy();
}

/// Always dies mid-rank, leaving the session entry's lock poisoned.
struct FailingRanker;

impl RankingModel for FailingRanker {
    fn rank(
        &self,
        _binding: &ModelBinding,
        _snapshot: &TurnSnapshot,
        _new_items: &[ItemId],
        _params: &RequestParams,
        _ticket: &Ticket,
    ) -> Result<RankOutcome> {
        panic!("ranker died mid-turn");
    }
}

#[test]
fn panicked_worker_does_not_wedge_the_handle() {
    let model = common::model_dir("rec-v1", 32, 8);
    let handle = ready_handle(&model);
    handle.set_ranker(Arc::new(FailingRanker));

    let messages = [ChatMessage::user("jacket")];
    let response = handle.chat_completions("rec-v1", &messages, None, 0);
    assert_eq!(response.status, StatusCode::DeviceInitError);
    assert!(response.choices.is_empty());

    // The dead turn committed nothing and the session stays reachable.
    assert_eq!(handle.session_history_len("rec-v1", &messages), Some(0));

    // The same session serves again once the ranker behaves.
    handle.set_ranker(Arc::new(EmbeddingRanker));
    let response = handle.chat_completions("rec-v1", &messages, None, 0);
    assert_eq!(response.status, StatusCode::Success);

    // Teardown completes and releases everything despite the earlier
    // panic; dropping afterwards must also be a clean no-op.
    let gauge = handle.device_memory_gauge().unwrap();
    handle.destroy();
    assert_eq!(gauge.bytes(), 0);
    drop(handle);
}

#[test]
fn zero_timeout_waits_out_slow_generation() {
    let model = common::model_dir("rec-v1", 32, 8);
    let handle = ready_handle(&model);
    handle.set_ranker(Arc::new(SlowRanker {
        delay: Duration::from_millis(50),
    }));

    let response = handle.chat_completions("rec-v1", &[ChatMessage::user("jacket")], None, 0);
    assert_eq!(response.status, StatusCode::Success);
    handle.destroy();
}
