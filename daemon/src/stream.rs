//! Bounded newline-delimited JSON response streams.
//!
//! A producer task writes lines; the response body reads them. With
//! [`StreamPolicy::Block`] the producer waits for the client. With
//! [`StreamPolicy::DropOldest`] a full buffer discards its oldest line,
//! but the line passed to [`LineSender::finish`] is always delivered.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use andock_core::config::StreamPolicy;
use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

/// Create a line stream holding at most `capacity` undelivered lines.
pub fn channel(capacity: usize, policy: StreamPolicy) -> (LineSender, LineReceiver) {
    let capacity = capacity.max(1);
    match policy {
        StreamPolicy::Block => {
            let (tx, rx) = mpsc::channel(capacity);
            (
                LineSender(SenderInner::Block(tx)),
                LineReceiver(ReceiverInner::Block(rx)),
            )
        }
        StreamPolicy::DropOldest => {
            let ring = Arc::new(Ring {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                notify: Notify::new(),
                finished: AtomicBool::new(false),
                receiver_gone: AtomicBool::new(false),
            });
            (
                LineSender(SenderInner::DropOldest(ring.clone())),
                LineReceiver(ReceiverInner::DropOldest(ring)),
            )
        }
    }
}

/// Serialize `value` as one line.
pub fn json_line<T: Serialize>(value: &T) -> Bytes {
    let mut line = serde_json::to_vec(value).unwrap_or_else(|e| {
        format!(r#"{{"error":"failed to encode event: {}"}}"#, e).into_bytes()
    });
    line.push(b'\n');
    Bytes::from(line)
}

struct Ring {
    queue: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    notify: Notify,
    finished: AtomicBool,
    receiver_gone: AtomicBool,
}

impl Ring {
    fn push(&self, line: Bytes) {
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = queue.len() >= self.capacity;
            if dropped {
                queue.pop_front();
            }
            queue.push_back(line);
            dropped
        };
        if dropped {
            tracing::trace!("Stream buffer full, dropped oldest line");
        }
        self.notify.notify_one();
    }
}

/// Producer half.
pub struct LineSender(SenderInner);

enum SenderInner {
    Block(mpsc::Sender<Bytes>),
    DropOldest(Arc<Ring>),
}

impl LineSender {
    /// Queue one line. Returns false once the client has gone away.
    pub async fn send(&self, line: Bytes) -> bool {
        match &self.0 {
            SenderInner::Block(tx) => tx.send(line).await.is_ok(),
            SenderInner::DropOldest(ring) => {
                if ring.receiver_gone.load(Ordering::SeqCst) {
                    return false;
                }
                ring.push(line);
                true
            }
        }
    }

    /// Queue the terminal line and close the stream.
    pub async fn finish(self, line: Bytes) {
        match &self.0 {
            SenderInner::Block(tx) => {
                let _ = tx.send(line).await;
            }
            // Drop marks the ring finished
            SenderInner::DropOldest(ring) => ring.push(line),
        }
    }

    /// Whether the client has gone away.
    pub fn is_closed(&self) -> bool {
        match &self.0 {
            SenderInner::Block(tx) => tx.is_closed(),
            SenderInner::DropOldest(ring) => ring.receiver_gone.load(Ordering::SeqCst),
        }
    }
}

impl Drop for LineSender {
    fn drop(&mut self) {
        if let SenderInner::DropOldest(ring) = &self.0 {
            ring.finished.store(true, Ordering::SeqCst);
            ring.notify.notify_one();
        }
    }
}

/// Consumer half, turned into a response body.
pub struct LineReceiver(ReceiverInner);

enum ReceiverInner {
    Block(mpsc::Receiver<Bytes>),
    DropOldest(Arc<Ring>),
}

/// Marks the ring abandoned when the body is dropped.
struct ReceiverGuard(Arc<Ring>);

impl Drop for ReceiverGuard {
    fn drop(&mut self) {
        self.0.receiver_gone.store(true, Ordering::SeqCst);
    }
}

impl LineReceiver {
    pub fn into_stream(self) -> futures::stream::BoxStream<'static, Bytes> {
        match self.0 {
            ReceiverInner::Block(rx) => ReceiverStream::new(rx).boxed(),
            ReceiverInner::DropOldest(ring) => {
                futures::stream::unfold(ReceiverGuard(ring), |guard| async move {
                    loop {
                        let next = guard.0.queue.lock().pop_front();
                        if let Some(line) = next {
                            return Some((line, guard));
                        }
                        if guard.0.finished.load(Ordering::SeqCst) {
                            // A push may have landed between the pop and the flag read
                            let last = guard.0.queue.lock().pop_front();
                            return last.map(|line| (line, guard));
                        }
                        guard.0.notify.notified().await;
                    }
                })
                .boxed()
            }
        }
    }

    pub fn into_body(self) -> Body {
        Body::from_stream(self.into_stream().map(Ok::<_, Infallible>))
    }
}
