//! Per-measurement progress buffer.
//!
//! Linearizes and throttles the partial updates a handler produces so the
//! coordinator sees at most one progress event per interval. The first push
//! goes out immediately; everything after that coalesces behind a timer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use common::{ProgressEvent, ResultEvent, EV_MEASUREMENT_PROGRESS, EV_MEASUREMENT_RESULT};

use crate::session::{EventSender, WireEvent};

/// Minimum spacing between consecutive progress emissions.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// How pushed values coalesce while the timer is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Field-by-field concatenation of everything pushed.
    Append,
    /// Latest push wins; events carry `overwrite: true`.
    Overwrite,
    /// Pushes are snapshots of a growing string; events carry the suffix
    /// since the last emission.
    Diff,
}

struct Inner {
    pending: Option<Value>,
    /// Snapshot as of the last emission (diff mode only).
    emitted_snapshot: Value,
    last_emit: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    closed: bool,
}

pub struct ProgressBuffer {
    mode: BufferMode,
    measurement_id: String,
    test_id: String,
    tx: EventSender,
    inner: Arc<Mutex<Inner>>,
}

impl ProgressBuffer {
    pub fn new(
        mode: BufferMode,
        measurement_id: impl Into<String>,
        test_id: impl Into<String>,
        tx: EventSender,
    ) -> Self {
        Self {
            mode,
            measurement_id: measurement_id.into(),
            test_id: test_id.into(),
            tx,
            inner: Arc::new(Mutex::new(Inner {
                pending: None,
                emitted_snapshot: Value::Null,
                last_emit: None,
                timer: None,
                closed: false,
            })),
        }
    }

    /// Queue one partial value. Emits immediately on the first call, then
    /// at most once per [`PROGRESS_INTERVAL`].
    pub fn push_progress(&self, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        if inner.last_emit.is_none() {
            let payload = self.prepare_emission(&mut inner, value);
            inner.last_emit = Some(Instant::now());
            drop(inner);
            self.send_progress(payload);
            return;
        }

        match (self.mode, inner.pending.take()) {
            (BufferMode::Append, Some(mut acc)) => {
                merge_append(&mut acc, value);
                inner.pending = Some(acc);
            }
            // overwrite and diff both keep only the latest snapshot
            (_, _) => inner.pending = Some(value),
        }

        if inner.timer.is_none() {
            let deadline = inner.last_emit.unwrap() + PROGRESS_INTERVAL;
            let buffer = self.clone_handle();
            inner.timer = Some(tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                buffer.flush_pending();
            }));
        }
    }

    /// Emit the terminal result. Discards any pending partials (the final
    /// result subsumes them), cancels the timer and closes the buffer.
    pub fn push_result(&self, result: Value) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.pending = None;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        drop(inner);

        let event = ResultEvent {
            measurement_id: self.measurement_id.clone(),
            test_id: self.test_id.clone(),
            result,
        };
        let _ = self.tx.send(WireEvent {
            name: EV_MEASUREMENT_RESULT,
            payload: serde_json::to_value(event).unwrap_or(Value::Null),
        });
    }

    fn flush_pending(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.timer = None;
        if inner.closed {
            return;
        }
        if let Some(value) = inner.pending.take() {
            let payload = self.prepare_emission(&mut inner, value);
            inner.last_emit = Some(Instant::now());
            drop(inner);
            self.send_progress(payload);
        }
    }

    /// Convert the coalesced value into the on-wire payload, updating any
    /// mode-specific bookkeeping.
    fn prepare_emission(&self, inner: &mut Inner, value: Value) -> Value {
        match self.mode {
            BufferMode::Append | BufferMode::Overwrite => value,
            BufferMode::Diff => {
                let suffix = diff_since(&inner.emitted_snapshot, &value);
                inner.emitted_snapshot = value;
                suffix
            }
        }
    }

    fn send_progress(&self, result: Value) {
        let overwrite = match self.mode {
            BufferMode::Append => None,
            BufferMode::Overwrite => Some(true),
            BufferMode::Diff => Some(false),
        };
        let event = ProgressEvent {
            measurement_id: self.measurement_id.clone(),
            test_id: self.test_id.clone(),
            result,
            overwrite,
        };
        let _ = self.tx.send(WireEvent {
            name: EV_MEASUREMENT_PROGRESS,
            payload: serde_json::to_value(event).unwrap_or(Value::Null),
        });
    }

    fn clone_handle(&self) -> Self {
        Self {
            mode: self.mode,
            measurement_id: self.measurement_id.clone(),
            test_id: self.test_id.clone(),
            tx: self.tx.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Field-by-field append merge: strings concatenate, nested objects merge
/// recursively, any other value is replaced by the newer one.
fn merge_append(acc: &mut Value, next: Value) {
    match (acc, next) {
        (Value::String(a), Value::String(b)) => a.push_str(&b),
        (Value::Object(a), Value::Object(b)) => {
            for (key, value) in b {
                match a.get_mut(&key) {
                    Some(existing) => merge_append(existing, value),
                    None => {
                        a.insert(key, value);
                    }
                }
            }
        }
        (slot, other) => *slot = other,
    }
}

/// Suffix of `current` relative to `previous`, applied per string field.
fn diff_since(previous: &Value, current: &Value) -> Value {
    match (previous, current) {
        (Value::String(old), Value::String(new)) if new.starts_with(old.as_str()) => {
            Value::String(new[old.len()..].to_string())
        }
        (Value::Object(old), Value::Object(new)) => {
            let mut out = serde_json::Map::new();
            for (key, value) in new {
                match old.get(key) {
                    Some(prev) => {
                        out.insert(key.clone(), diff_since(prev, value));
                    }
                    None => {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(out)
        }
        (_, new) => new.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn buffer(mode: BufferMode) -> (ProgressBuffer, mpsc::UnboundedReceiver<WireEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProgressBuffer::new(mode, "m1", "t1", tx), rx)
    }

    fn progress_result(event: &WireEvent) -> Value {
        assert_eq!(event.name, EV_MEASUREMENT_PROGRESS);
        event.payload["result"].clone()
    }

    #[tokio::test(start_paused = true)]
    async fn first_push_emits_immediately() {
        let (buf, mut rx) = buffer(BufferMode::Append);
        buf.push_progress(json!({"rawOutput": "line1\n"}));
        let event = rx.try_recv().expect("first push should emit at once");
        assert_eq!(progress_result(&event)["rawOutput"], "line1\n");
    }

    #[tokio::test(start_paused = true)]
    async fn later_pushes_coalesce_behind_the_timer() {
        let (buf, mut rx) = buffer(BufferMode::Append);
        buf.push_progress(json!({"rawOutput": "a"}));
        rx.try_recv().unwrap();

        buf.push_progress(json!({"rawOutput": "b"}));
        buf.push_progress(json!({"rawOutput": "c"}));
        assert!(rx.try_recv().is_err(), "nothing before the timer fires");

        tokio::time::sleep(PROGRESS_INTERVAL + Duration::from_millis(10)).await;
        let event = rx.try_recv().expect("timer flush");
        assert_eq!(progress_result(&event)["rawOutput"], "bc");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn emissions_respect_the_minimum_spacing() {
        let (buf, mut rx) = buffer(BufferMode::Append);
        buf.push_progress(json!({"rawOutput": "1"}));
        rx.try_recv().unwrap();

        for i in 2..=5 {
            buf.push_progress(json!({ "rawOutput": format!("{}", i) }));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // 400ms elapsed: still inside the interval
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(150)).await;
        let event = rx.try_recv().expect("single coalesced emission");
        assert_eq!(progress_result(&event)["rawOutput"], "2345");
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_mode_keeps_latest_and_flags_it() {
        let (buf, mut rx) = buffer(BufferMode::Overwrite);
        buf.push_progress(json!({"hops": 1}));
        let first = rx.try_recv().unwrap();
        assert_eq!(first.payload["overwrite"], true);

        buf.push_progress(json!({"hops": 2}));
        buf.push_progress(json!({"hops": 3}));
        tokio::time::sleep(PROGRESS_INTERVAL + Duration::from_millis(10)).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(progress_result(&event)["hops"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn diff_mode_emits_only_the_suffix() {
        let (buf, mut rx) = buffer(BufferMode::Diff);
        buf.push_progress(json!({"rawOutput": "PING host.\n"}));
        let first = rx.try_recv().unwrap();
        assert_eq!(first.payload["overwrite"], false);
        assert_eq!(progress_result(&first)["rawOutput"], "PING host.\n");

        buf.push_progress(json!({"rawOutput": "PING host.\nreply 1\n"}));
        buf.push_progress(json!({"rawOutput": "PING host.\nreply 1\nreply 2\n"}));
        tokio::time::sleep(PROGRESS_INTERVAL + Duration::from_millis(10)).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(progress_result(&event)["rawOutput"], "reply 1\nreply 2\n");
    }

    #[tokio::test(start_paused = true)]
    async fn result_discards_pending_and_closes() {
        let (buf, mut rx) = buffer(BufferMode::Append);
        buf.push_progress(json!({"rawOutput": "a"}));
        rx.try_recv().unwrap();
        buf.push_progress(json!({"rawOutput": "never sent"}));

        buf.push_result(json!({"status": "finished", "rawOutput": "a"}));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, EV_MEASUREMENT_RESULT);

        // pending partial was dropped and the timer no longer fires
        tokio::time::sleep(PROGRESS_INTERVAL * 2).await;
        assert!(rx.try_recv().is_err());

        // pushes after the result are ignored
        buf.push_progress(json!({"rawOutput": "late"}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn append_emissions_reconstruct_all_pushes() {
        let (buf, mut rx) = buffer(BufferMode::Append);
        let pushes = ["a", "b", "c", "d", "e"];
        for (i, p) in pushes.iter().enumerate() {
            buf.push_progress(json!({ "rawOutput": *p }));
            if i % 2 == 0 {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }
        tokio::time::sleep(PROGRESS_INTERVAL * 2).await;

        let mut combined = String::new();
        while let Ok(event) = rx.try_recv() {
            combined.push_str(progress_result(&event)["rawOutput"].as_str().unwrap());
        }
        assert_eq!(combined, pushes.concat());
    }

    #[test]
    fn merge_append_semantics() {
        let mut acc = json!({"rawOutput": "ab", "count": 1, "nested": {"s": "x"}});
        merge_append(
            &mut acc,
            json!({"rawOutput": "cd", "count": 2, "nested": {"s": "y"}, "extra": true}),
        );
        assert_eq!(acc["rawOutput"], "abcd");
        assert_eq!(acc["count"], 2);
        assert_eq!(acc["nested"]["s"], "xy");
        assert_eq!(acc["extra"], true);
    }
}
