//! Broadcast hub fanning every published message out to all live subscribers
//!
//! The hub is an actor: a single control loop task owns the subscriber set and
//! is the only code that ever mutates it. Callers reach the loop through three
//! bounded request queues (subscribe, unsubscribe, publish), and the loop
//! multiplexes over them together with the root cancellation token.
//!
//! Guarantees provided to callers:
//! - `subscribe` returns only after the loop registered the outbox, so every
//!   message dispatched after the call returns reaches it
//! - `unsubscribe` returns only after the loop removed and closed the outbox
//! - every subscriber observes published messages in the same relative order
//!
//! Dispatch to subscribers is sequential and blocking, so one stalled outbox
//! delays delivery to the subscribers after it in the same pass. Removal uses
//! `swap_remove`, which means the iteration order across subscribers is
//! unspecified and may change after any removal.

use crate::error::HubError;
use log::{debug, info, warn};
use shared::Message;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Opaque identity of a registered outbox, assigned by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Running,
    ShuttingDown,
    Stopped,
}

/// Queue sizes used by the hub
///
/// All values are clamped to at least 1. Small queues give tighter
/// backpressure: a publisher waits as soon as the loop falls behind.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Messages buffered per subscriber before dispatch blocks
    pub outbox_capacity: usize,
    /// Messages buffered in the shared inbound queue before `publish` blocks
    pub publish_queue: usize,
    /// Pending subscribe or unsubscribe requests before callers block
    pub request_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 16,
            publish_queue: 64,
            request_queue: 16,
        }
    }
}

/// Receiving side of one subscription
///
/// `recv` yields `None` once the hub closed the outbox, either because the
/// subscription was cancelled or because the hub shut down.
#[derive(Debug)]
pub struct Outbox {
    id: SubscriberId,
    receiver: mpsc::Receiver<Message>,
}

impl Outbox {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    #[cfg(test)]
    fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

struct SubscribeRequest {
    outbox: mpsc::Sender<Message>,
    reply: oneshot::Sender<SubscriberId>,
}

struct UnsubscribeRequest {
    id: SubscriberId,
    reply: oneshot::Sender<()>,
}

struct Subscriber {
    id: SubscriberId,
    outbox: mpsc::Sender<Message>,
}

/// Cloneable handle to a running hub
#[derive(Clone)]
pub struct BroadcastHub {
    subscribe_tx: mpsc::Sender<SubscribeRequest>,
    unsubscribe_tx: mpsc::Sender<UnsubscribeRequest>,
    publish_tx: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    outbox_capacity: usize,
    subscriber_count: Arc<AtomicUsize>,
    state: watch::Receiver<HubState>,
}

impl BroadcastHub {
    /// Starts the control loop on a new task
    ///
    /// The loop runs until `shutdown` is cancelled, then closes every
    /// remaining outbox exactly once.
    pub fn spawn(config: HubConfig, shutdown: CancellationToken) -> Self {
        let (subscribe_tx, subscribe_rx) = mpsc::channel(config.request_queue.max(1));
        let (unsubscribe_tx, unsubscribe_rx) = mpsc::channel(config.request_queue.max(1));
        let (publish_tx, publish_rx) = mpsc::channel(config.publish_queue.max(1));
        let (state_tx, state_rx) = watch::channel(HubState::Running);
        let subscriber_count = Arc::new(AtomicUsize::new(0));

        let control = ControlLoop {
            subscribers: Vec::new(),
            next_id: 1,
            subscribe_rx,
            unsubscribe_rx,
            publish_rx,
            shutdown: shutdown.clone(),
            subscriber_count: Arc::clone(&subscriber_count),
            state: state_tx,
        };
        tokio::spawn(control.run());

        Self {
            subscribe_tx,
            unsubscribe_tx,
            publish_tx,
            shutdown,
            outbox_capacity: config.outbox_capacity.max(1),
            subscriber_count,
            state: state_rx,
        }
    }

    /// Registers a new outbox and waits for the control loop to acknowledge it
    pub async fn subscribe(&self) -> Result<Outbox, HubError> {
        let (outbox, receiver) = mpsc::channel(self.outbox_capacity);
        let (reply, ack) = oneshot::channel();

        self.submit(&self.subscribe_tx, SubscribeRequest { outbox, reply })
            .await?;
        let id = ack.await.map_err(|_| HubError::ShutDown)?;

        debug!("Subscribed {}", id);
        Ok(Outbox { id, receiver })
    }

    /// Removes and closes `outbox`, waiting for the control loop to acknowledge
    ///
    /// Messages still arriving on the outbox while the request is in flight
    /// are discarded. Draining keeps the loop from blocking on this outbox
    /// while it has the removal request queued behind a dispatch.
    pub async fn unsubscribe(&self, outbox: Outbox) -> Result<(), HubError> {
        let Outbox { id, mut receiver } = outbox;
        let (reply, ack) = oneshot::channel();

        let removal = async {
            self.submit(&self.unsubscribe_tx, UnsubscribeRequest { id, reply })
                .await?;
            ack.await.map_err(|_| HubError::ShutDown)
        };
        tokio::pin!(removal);

        let mut open = true;
        let mut discarded = 0usize;
        loop {
            tokio::select! {
                result = &mut removal => {
                    if discarded > 0 {
                        debug!("Discarded {} undelivered messages for {}", discarded, id);
                    }
                    return result;
                }
                message = receiver.recv(), if open => match message {
                    Some(_) => discarded += 1,
                    None => open = false,
                },
            }
        }
    }

    /// Hands `message` to the control loop's shared inbound queue
    ///
    /// Waits while the queue is full. Fails once the hub is shutting down.
    pub async fn publish(&self, message: Message) -> Result<(), HubError> {
        self.submit(&self.publish_tx, message).await
    }

    /// Number of outboxes currently registered
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Acquire)
    }

    pub fn state(&self) -> HubState {
        *self.state.borrow()
    }

    /// Resolves once the control loop has closed every outbox and exited
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        // The loop publishes Stopped before dropping the sender.
        let _ = state.wait_for(|s| *s == HubState::Stopped).await;
    }

    async fn submit<T>(&self, queue: &mpsc::Sender<T>, request: T) -> Result<(), HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::ShutDown);
        }

        tokio::select! {
            result = queue.send(request) => result.map_err(|_| HubError::ShutDown),
            _ = self.shutdown.cancelled() => Err(HubError::ShutDown),
        }
    }
}

/// State owned exclusively by the hub task
struct ControlLoop {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    subscribe_rx: mpsc::Receiver<SubscribeRequest>,
    unsubscribe_rx: mpsc::Receiver<UnsubscribeRequest>,
    publish_rx: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
    subscriber_count: Arc<AtomicUsize>,
    state: watch::Sender<HubState>,
}

impl ControlLoop {
    async fn run(mut self) {
        info!("Broadcast hub started");

        loop {
            // Unbiased select: every ready queue gets serviced eventually,
            // no ordering between request kinds.
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(request) = self.subscribe_rx.recv() => self.add(request),
                Some(request) = self.unsubscribe_rx.recv() => self.remove(request),
                message = self.publish_rx.recv() => match message {
                    Some(message) => {
                        if self.dispatch(message).await.is_break() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.shut_down();
    }

    fn add(&mut self, request: SubscribeRequest) {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;

        self.subscribers.push(Subscriber {
            id,
            outbox: request.outbox,
        });

        if request.reply.send(id).is_err() {
            // Caller stopped waiting, so nobody holds the receiving end.
            self.subscribers.pop();
            debug!("Subscriber {} abandoned before registration completed", id);
        }
        self.update_count();
    }

    fn remove(&mut self, request: UnsubscribeRequest) {
        match self.subscribers.iter().position(|s| s.id == request.id) {
            Some(index) => {
                // Dropping the only sender closes the outbox.
                let removed = self.subscribers.swap_remove(index);
                drop(removed.outbox);
                debug!("Unsubscribed {}", request.id);
            }
            None => warn!("Unsubscribe for unknown subscriber {}", request.id),
        }
        self.update_count();

        let _ = request.reply.send(());
    }

    async fn dispatch(&mut self, message: Message) -> ControlFlow<()> {
        debug!(
            "Broadcasting message from {} to {} subscribers",
            message.user,
            self.subscribers.len()
        );

        let mut closed = Vec::new();
        for subscriber in &self.subscribers {
            tokio::select! {
                result = subscriber.outbox.send(message.clone()) => {
                    if result.is_err() {
                        closed.push(subscriber.id);
                    }
                }
                _ = self.shutdown.cancelled() => return ControlFlow::Break(()),
            }
        }

        if !closed.is_empty() {
            self.prune(&closed);
        }
        ControlFlow::Continue(())
    }

    /// Drops subscribers whose receiving end went away without unsubscribing
    ///
    /// This happens when a `subscribe` call is abandoned after the loop acked
    /// it, or when a deferred unsubscribe had no runtime to run on.
    fn prune(&mut self, closed: &[SubscriberId]) {
        for id in closed {
            if let Some(index) = self.subscribers.iter().position(|s| s.id == *id) {
                self.subscribers.swap_remove(index);
                debug!("Subscriber {} dropped its outbox, removed", id);
            }
        }
        self.update_count();
    }

    fn update_count(&self) {
        self.subscriber_count
            .store(self.subscribers.len(), Ordering::Release);
    }

    fn shut_down(self) {
        let ControlLoop {
            subscribers,
            subscribe_rx,
            unsubscribe_rx,
            publish_rx,
            subscriber_count,
            state,
            ..
        } = self;

        state.send_replace(HubState::ShuttingDown);

        // Pending requests are dropped with their queues, failing their callers.
        drop(subscribe_rx);
        drop(unsubscribe_rx);
        drop(publish_rx);

        let closed = subscribers.len();
        drop(subscribers);
        subscriber_count.store(0, Ordering::Release);

        info!("Broadcast hub stopped, closed {} outboxes", closed);
        state.send_replace(HubState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn spawn_hub() -> (BroadcastHub, CancellationToken) {
        let shutdown = CancellationToken::new();
        let hub = BroadcastHub::spawn(HubConfig::default(), shutdown.clone());
        (hub, shutdown)
    }

    async fn next(outbox: &mut Outbox) -> Message {
        timeout(WAIT, outbox.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbox closed")
    }

    async fn wait_for_count(hub: &BroadcastHub, expected: usize) {
        timeout(WAIT, async {
            while hub.subscriber_count() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "subscriber count stuck at {}, expected {}",
                hub.subscriber_count(),
                expected
            )
        });
    }

    #[tokio::test]
    async fn test_subscribe_assigns_distinct_ids() {
        let (hub, _shutdown) = spawn_hub();

        let a = hub.subscribe().await.unwrap();
        let b = hub.subscribe().await.unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(hub.state(), HubState::Running);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_once() {
        let (hub, _shutdown) = spawn_hub();
        let mut outboxes = Vec::new();
        for _ in 0..3 {
            outboxes.push(hub.subscribe().await.unwrap());
        }

        hub.publish(Message::new("userA", "hello")).await.unwrap();

        for outbox in &mut outboxes {
            assert_eq!(next(outbox).await, Message::new("userA", "hello"));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        for outbox in &mut outboxes {
            assert!(outbox.try_recv().is_none(), "message delivered twice");
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_past_messages() {
        let (hub, _shutdown) = spawn_hub();
        let mut early = hub.subscribe().await.unwrap();

        hub.publish(Message::new("userA", "before")).await.unwrap();
        assert_eq!(next(&mut early).await.text, "before");

        let mut late = hub.subscribe().await.unwrap();
        hub.publish(Message::new("userA", "after")).await.unwrap();

        assert_eq!(next(&mut late).await.text, "after");
        assert_eq!(next(&mut early).await.text, "after");
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_that_outbox() {
        let (hub, _shutdown) = spawn_hub();
        let first = hub.subscribe().await.unwrap();
        let mut second = hub.subscribe().await.unwrap();
        let mut third = hub.subscribe().await.unwrap();

        hub.unsubscribe(first).await.unwrap();
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(Message::new("userC", "still here")).await.unwrap();
        assert_eq!(next(&mut second).await.text, "still here");
        assert_eq!(next(&mut third).await.text, "still here");
    }

    #[tokio::test]
    async fn test_unsubscribe_while_dispatch_blocked_on_same_outbox() {
        let shutdown = CancellationToken::new();
        let config = HubConfig {
            outbox_capacity: 1,
            ..HubConfig::default()
        };
        let hub = BroadcastHub::spawn(config, shutdown.clone());
        let stalled = hub.subscribe().await.unwrap();
        let mut reader = hub.subscribe().await.unwrap();
        let collector = tokio::spawn(async move {
            let mut texts = Vec::new();
            while texts.len() < 3 {
                match reader.recv().await {
                    Some(message) => texts.push(message.text),
                    None => break,
                }
            }
            texts
        });

        for i in 0..3 {
            hub.publish(Message::new("userA", format!("m{}", i)))
                .await
                .unwrap();
        }

        timeout(WAIT, hub.unsubscribe(stalled))
            .await
            .expect("unsubscribe deadlocked")
            .unwrap();

        let texts = timeout(WAIT, collector).await.unwrap().unwrap();
        assert_eq!(texts, vec!["m0", "m1", "m2"]);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_all_subscribers_observe_same_order() {
        let (hub, _shutdown) = spawn_hub();
        let per_sender = 40;

        let mut collectors = Vec::new();
        for _ in 0..3 {
            let mut outbox = hub.subscribe().await.unwrap();
            collectors.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while seen.len() < per_sender * 2 {
                    match outbox.recv().await {
                        Some(message) => seen.push(message),
                        None => break,
                    }
                }
                seen
            }));
        }

        let mut senders = Vec::new();
        for user in ["userA", "userB"] {
            let hub = hub.clone();
            senders.push(tokio::spawn(async move {
                for i in 0..per_sender {
                    hub.publish(Message::new(user, i.to_string())).await.unwrap();
                }
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }

        let mut observed = Vec::new();
        for collector in collectors {
            observed.push(timeout(WAIT, collector).await.unwrap().unwrap());
        }

        assert_eq!(observed[0].len(), per_sender * 2);
        assert_eq!(observed[0], observed[1]);
        assert_eq!(observed[1], observed[2]);

        for user in ["userA", "userB"] {
            let texts: Vec<String> = observed[0]
                .iter()
                .filter(|m| m.user == user)
                .map(|m| m.text.clone())
                .collect();
            let expected: Vec<String> = (0..per_sender).map(|i| i.to_string()).collect();
            assert_eq!(texts, expected, "per-sender order broken for {}", user);
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_outboxes_and_refuses_operations() {
        let (hub, shutdown) = spawn_hub();
        let mut a = hub.subscribe().await.unwrap();
        let mut b = hub.subscribe().await.unwrap();

        shutdown.cancel();
        timeout(WAIT, hub.stopped()).await.unwrap();

        assert_eq!(hub.state(), HubState::Stopped);
        assert_eq!(timeout(WAIT, a.recv()).await.unwrap(), None);
        assert_eq!(timeout(WAIT, b.recv()).await.unwrap(), None);
        assert_eq!(hub.subscriber_count(), 0);

        assert_eq!(hub.subscribe().await.unwrap_err(), HubError::ShutDown);
        assert_eq!(
            hub.publish(Message::new("userA", "late")).await,
            Err(HubError::ShutDown)
        );
        assert_eq!(hub.unsubscribe(a).await, Err(HubError::ShutDown));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_dispatch() {
        let shutdown = CancellationToken::new();
        let config = HubConfig {
            outbox_capacity: 1,
            ..HubConfig::default()
        };
        let hub = BroadcastHub::spawn(config, shutdown.clone());
        let _stalled = hub.subscribe().await.unwrap();

        for i in 0..3 {
            hub.publish(Message::new("userA", i.to_string())).await.unwrap();
        }

        shutdown.cancel();
        timeout(WAIT, hub.stopped())
            .await
            .expect("hub did not stop while dispatch was blocked");
    }

    #[tokio::test]
    async fn test_dropped_outbox_does_not_stall_dispatch() {
        let (hub, _shutdown) = spawn_hub();
        let gone = hub.subscribe().await.unwrap();
        let mut alive = hub.subscribe().await.unwrap();
        drop(gone);

        hub.publish(Message::new("userB", "ping")).await.unwrap();
        assert_eq!(next(&mut alive).await.text, "ping");
        wait_for_count(&hub, 1).await;

        hub.publish(Message::new("userB", "pong")).await.unwrap();
        assert_eq!(next(&mut alive).await.text, "pong");
    }

    #[tokio::test]
    async fn test_abandoned_subscribe_does_not_leak_registration() {
        let (hub, _shutdown) = spawn_hub();
        let mut alive = hub.subscribe().await.unwrap();

        // Enqueue the request, let the loop register and ack it, then walk
        // away before the ack is read.
        let mut pending = Box::pin(hub.subscribe());
        tokio::select! {
            biased;
            _ = &mut pending => panic!("subscribe finished before the loop ran"),
            _ = std::future::ready(()) => {}
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        drop(pending);

        hub.publish(Message::new("userA", "hello")).await.unwrap();
        assert_eq!(next(&mut alive).await.text, "hello");
        wait_for_count(&hub, 1).await;
    }

    #[test]
    fn test_hub_config_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.outbox_capacity, 16);
        assert_eq!(config.publish_queue, 64);
        assert_eq!(config.request_queue, 16);
    }

    #[test]
    fn test_subscriber_id_display() {
        assert_eq!(SubscriberId(7).to_string(), "#7");
    }
}
