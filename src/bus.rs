//! Fan-out of decoded events to application subscribers.
//!
//! One [`EventBus`] instance carries raw segments, another completed files;
//! the two are independent. Every subscriber owns a bounded queue. Stream
//! subscribers exert backpressure: a full queue blocks the producer until the
//! consumer catches up. Callback subscribers never block the producer; their
//! queue sheds its oldest event instead.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

use crate::logging::warn_throttled;

const WARN_EVERY: Duration = Duration::from_secs(30);

pub struct EventBus<T> {
    shared: Arc<BusShared<T>>,
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct BusShared<T> {
    slots: Mutex<Vec<Slot<T>>>,
    next_id: AtomicU64,
}

struct Slot<T> {
    id: u64,
    kind: SlotKind<T>,
}

enum SlotKind<T> {
    Stream(mpsc::Sender<T>),
    Callback(Arc<CallbackQueue<T>>),
}

impl<T> Clone for SlotKind<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Stream(tx) => Self::Stream(tx.clone()),
            Self::Callback(q) => Self::Callback(Arc::clone(q)),
        }
    }
}

struct CallbackQueue<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped_total: AtomicU64,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BusShared {
                slots: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock_slots().len()
    }

    /// Stream-style subscription with backpressure. Dropping the returned
    /// stream releases the subscription.
    pub fn subscribe(&self, capacity: usize) -> EventStream<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.register(SlotKind::Stream(tx));
        EventStream {
            rx,
            _guard: SubscriptionGuard {
                id,
                shared: Arc::downgrade(&self.shared),
            },
        }
    }

    /// Callback-style subscription: a worker task drains the queue and runs
    /// `handler` on every event. A full queue drops its oldest event rather
    /// than stalling the stream. A handler error skips that one event and is
    /// logged; the subscription stays alive.
    pub fn subscribe_with<F>(&self, capacity: usize, mut handler: F) -> Subscription<T>
    where
        F: FnMut(T) -> anyhow::Result<()> + Send + 'static,
    {
        let queue = Arc::new(CallbackQueue {
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped_total: AtomicU64::new(0),
        });
        let id = self.register(SlotKind::Callback(Arc::clone(&queue)));

        let worker_queue = Arc::clone(&queue);
        tokio::spawn(async move {
            loop {
                let batch: Vec<T> = {
                    let mut q = worker_queue.lock_queue();
                    q.drain(..).collect()
                };
                if batch.is_empty() {
                    if worker_queue.closed.load(Ordering::Acquire) {
                        break;
                    }
                    worker_queue.notified().await;
                    continue;
                }
                for event in batch {
                    if let Err(err) = handler(event) {
                        tracing::warn!(error = %err, "subscriber handler failed; event skipped");
                    }
                }
            }
        });

        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
            queue: Some(queue),
        }
    }

    /// Deliver one event to every subscriber in registration order. Awaits
    /// stream subscribers with full queues; never awaits callback subscribers.
    pub async fn publish(&self, event: T) {
        let targets: Vec<(u64, SlotKind<T>)> = {
            let slots = self.shared.lock_slots();
            slots.iter().map(|s| (s.id, s.kind.clone())).collect()
        };
        if targets.is_empty() {
            return;
        }

        let mut dead = Vec::new();
        for (id, kind) in targets {
            match kind {
                SlotKind::Stream(tx) => {
                    // Blocks while this subscriber's queue is full; that is
                    // the backpressure contract of the stream mode.
                    if tx.send(event.clone()).await.is_err() {
                        dead.push(id);
                    }
                }
                SlotKind::Callback(q) => {
                    if q.closed.load(Ordering::Acquire) {
                        continue;
                    }
                    {
                        let mut queue = q.lock_queue();
                        if queue.len() >= q.capacity {
                            queue.pop_front();
                            q.dropped_total.fetch_add(1, Ordering::Relaxed);
                            if warn_throttled("bus_drop_oldest", WARN_EVERY) {
                                tracing::warn!(
                                    dropped_total = q.dropped_total.load(Ordering::Relaxed),
                                    "slow callback subscriber; dropping oldest event"
                                );
                            }
                        }
                        queue.push_back(event.clone());
                    }
                    q.notify.notify_one();
                }
            }
        }
        if !dead.is_empty() {
            let mut slots = self.shared.lock_slots();
            slots.retain(|s| !dead.contains(&s.id));
        }
    }

    fn register(&self, kind: SlotKind<T>) -> u64 {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.lock_slots().push(Slot { id, kind });
        id
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BusShared<T> {
    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<Slot<T>>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn remove(&self, id: u64) {
        self.lock_slots().retain(|s| s.id != id);
    }
}

impl<T> CallbackQueue<T> {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Handle for a callback subscription. Dropping the handle does NOT
/// unsubscribe; call [`unsubscribe`](Self::unsubscribe) to stop. Events
/// already queued at that point are still delivered.
pub struct Subscription<T> {
    id: u64,
    shared: Weak<BusShared<T>>,
    queue: Option<Arc<CallbackQueue<T>>>,
}

impl<T> Subscription<T> {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
        if let Some(queue) = self.queue.take() {
            queue.closed.store(true, Ordering::Release);
            queue.notify.notify_one();
        }
    }
}

/// Stream-style subscription. Implements [`tokio_stream::Stream`]; dropping
/// it releases the subscription (in-flight events are simply discarded with
/// the queue).
pub struct EventStream<T> {
    rx: mpsc::Receiver<T>,
    _guard: SubscriptionGuard<T>,
}

impl<T> EventStream<T> {
    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> tokio_stream::Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

struct SubscriptionGuard<T> {
    id: u64,
    shared: Weak<BusShared<T>>,
}

impl<T> Drop for SubscriptionGuard<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn stream_subscriber_receives_in_order() {
        let bus: EventBus<u32> = EventBus::new();
        let mut stream = bus.subscribe(16);
        for i in 0..5 {
            bus.publish(i).await;
        }
        for expected in 0..5 {
            assert_eq!(stream.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn dropping_stream_releases_subscription() {
        let bus: EventBus<u32> = EventBus::new();
        let stream = bus.subscribe(4);
        assert_eq!(bus.subscriber_count(), 1);
        drop(stream);
        assert_eq!(bus.subscriber_count(), 0);
        // Publishing into the void must not hang or panic.
        bus.publish(1).await;
    }

    #[tokio::test]
    async fn stream_mode_applies_backpressure() {
        let bus: EventBus<u32> = EventBus::new();
        let mut stream = bus.subscribe(1);
        bus.publish(1).await;

        // The queue is full: the next publish must block until we consume.
        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(2).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished(), "publish should be blocked");

        assert_eq!(stream.recv().await, Some(1));
        publisher.await.expect("publisher join");
        assert_eq!(stream.recv().await, Some(2));
    }

    #[tokio::test]
    async fn callback_subscriber_sees_events() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus.subscribe_with(16, move |v| {
            sink.lock().expect("lock").push(v);
            Ok(())
        });

        for i in 0..4 {
            bus.publish(i).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().expect("lock"), vec![0, 1, 2, 3]);
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn callback_handler_error_skips_event_but_keeps_subscription() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe_with(16, move |v| {
            if v == 1 {
                anyhow::bail!("boom");
            }
            sink.lock().expect("lock").push(v);
            Ok(())
        });

        for i in 0..3 {
            bus.publish(i).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().expect("lock"), vec![0, 2]);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_callback_subscriber_drops_oldest_not_producer() {
        let bus: EventBus<u32> = EventBus::new();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let worker_gate = Arc::clone(&gate);
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe_with(2, move |v| {
            // Handler stalls until the test releases it.
            while worker_gate.try_acquire().is_err() {
                std::thread::sleep(Duration::from_millis(1));
            }
            sink.lock().expect("lock").push(v);
            Ok(())
        });

        // The worker grabs whatever was queued at its first wakeup, then the
        // queue (capacity 2) sheds from the front as the producer runs ahead.
        for i in 0..6 {
            bus.publish(i).await;
        }
        gate.add_permits(6);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = seen.lock().expect("lock").clone();
        assert!(!seen.is_empty());
        assert!(seen.len() < 6, "some events must have been shed");
        assert_eq!(*seen.last().expect("last"), 5, "newest event survives");
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted, "delivery order is preserved");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsubscribe_still_delivers_already_queued_events() {
        let bus: EventBus<u32> = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let worker_gate = Arc::clone(&gate);

        let sub = bus.subscribe_with(16, move |_| {
            while worker_gate.try_acquire().is_err() {
                std::thread::sleep(Duration::from_millis(1));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for i in 0..3 {
            bus.publish(i).await;
        }
        sub.unsubscribe();
        gate.add_permits(3);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(delivered.load(Ordering::SeqCst), 3);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_every_event() {
        let bus: EventBus<u32> = EventBus::new();
        let mut a = bus.subscribe(8);
        let mut b = bus.subscribe(8);
        bus.publish(7).await;
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn event_stream_implements_stream() {
        let bus: EventBus<u32> = EventBus::new();
        let stream = bus.subscribe(8);
        bus.publish(1).await;
        bus.publish(2).await;
        drop(bus);

        let collected: Vec<u32> = stream.collect().await;
        assert_eq!(collected, vec![1, 2]);
    }
}
