//! `Bridge`: the only surface a UI context can reach.
//!
//! Exposes exactly three operations:
//!
//! | Operation | Envelope | Outcome |
//! |-----------|----------|---------|
//! | [`Bridge::invoke`] | `request` + call id | result, failure, `Timeout` or `Cancelled` |
//! | [`Bridge::send`] | `request`, no call id | nothing; invalid sends are logged and dropped |
//! | [`Bridge::on`] | `subscribe` on first listener | [`Subscription`] handle |
//!
//! The transport itself is never exposed.
//!
//! ## Call lifecycle
//!
//! ```text
//! invoke() ─► Pending ─┬─► Resolved   (success response)
//!                      ├─► Rejected   (failure response)
//!                      ├─► TimedOut   (no response within invoke_timeout)
//!                      └─► Cancelled  (close() or controller shutdown)
//! ```
//!
//! Call ids come from a per-bridge counter and are never reused, so a late
//! response for a timed-out call finds no pending entry and is dropped.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::{
    channel::{ChannelRegistry, Direction},
    config::BridgeConfig,
    error::{Result, TetherError},
    ipc::{
        envelope::{CallId, ContextId, Envelope, EnvelopeKind},
        Link,
    },
};

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

struct PendingCall {
    channel: String,
    reply: oneshot::Sender<Result<Value>>,
}

struct BridgeInner {
    context: ContextId,
    registry: Arc<ChannelRegistry>,
    config: BridgeConfig,
    /// `None` once closed.
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    pending: Mutex<HashMap<CallId, PendingCall>>,
    /// Registration order is preserved per channel.
    listeners: Mutex<HashMap<String, Vec<(u64, Callback)>>>,
    next_call: AtomicU64,
    next_listener: AtomicU64,
    closed: AtomicBool,
}

pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("context", &self.inner.context)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Wrap the UI side of a link. Spawns the inbound pump, so this must be
    /// called from within a Tokio runtime.
    ///
    /// # Errors
    /// `InvalidConfig` if `config` fails validation.
    pub fn new(
        context: ContextId,
        link: Link,
        registry: Arc<ChannelRegistry>,
        config: BridgeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let Link { tx, rx } = link;
        let inner = Arc::new(BridgeInner {
            context,
            registry,
            config,
            outbound: Mutex::new(Some(tx)),
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(0),
            next_listener: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(pump(Arc::clone(&inner), rx));
        Ok(Self { inner })
    }

    /// Connect to a controller over a byte stream (newline-delimited JSON).
    ///
    /// `context` only prefixes call ids; the controller assigns its own id.
    #[cfg(feature = "stream")]
    pub fn connect_stream<R, W>(
        context: ContextId,
        reader: R,
        writer: W,
        registry: Arc<ChannelRegistry>,
        config: BridgeConfig,
    ) -> Result<Self>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let link = crate::ipc::codec::spawn_stream_link(reader, writer);
        Self::new(context, link, registry, config)
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.context
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Call an `Invoke` channel and wait for its result.
    ///
    /// # Errors
    /// - Validation failures from the controller (`UnknownChannel`,
    ///   `ShapeMismatch`).
    /// - `HandlerFailure` carrying the handler's code and message.
    /// - `Timeout` after `invoke_timeout`.
    /// - `Cancelled` if the bridge is closed or the controller shuts down.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let seq = self.inner.next_call.fetch_add(1, Ordering::SeqCst) + 1;
        let call_id = CallId::new(self.inner.context, seq);
        let (reply, rx) = oneshot::channel();

        self.inner.pending.lock().insert(
            call_id.clone(),
            PendingCall {
                channel: name.to_string(),
                reply,
            },
        );
        // Removes the entry on every exit, including when this future is dropped.
        let _pending = PendingGuard {
            inner: &self.inner,
            call_id: &call_id,
        };
        self.inner.post(Envelope::request(name, call_id.clone(), args))?;

        let after = self.inner.config.invoke_timeout;
        match tokio::time::timeout(after, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TetherError::Cancelled("context closed".into())),
            Err(_) => {
                debug!(channel = name, call_id = %call_id, "invoke timed out");
                Err(TetherError::Timeout {
                    channel: name.to_string(),
                    after,
                })
            }
        }
    }

    /// `invoke` with the result deserialized into `T`.
    pub async fn invoke_as<T: DeserializeOwned>(&self, name: &str, args: Vec<Value>) -> Result<T> {
        let value = self.invoke(name, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fire-and-forget message to a `Send` channel.
    ///
    /// Unregistered channels, wrong-direction channels and invalid arguments
    /// are logged and dropped; nothing is raised to the caller.
    pub fn send(&self, name: &str, args: Vec<Value>) {
        if let Err(e) = self
            .inner
            .registry
            .bind_args(name, Direction::Send, args.clone())
        {
            warn!(channel = name, context = %self.inner.context, "send dropped: {e}");
            return;
        }
        if let Err(e) = self.inner.post(Envelope::message(name, args)) {
            warn!(channel = name, "send dropped: {e}");
        }
    }

    /// Register `callback` for events on `name`.
    ///
    /// Each call creates an independent registration, even for the same
    /// callback. Subscribing to a channel that is not a registered event
    /// channel logs a warning and returns an inert subscription.
    pub fn on<F>(&self, name: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if !self.inner.registry.contains(name, Direction::Event) {
            warn!(channel = name, "refusing listener on non-event channel");
            return Subscription::inert(name);
        }
        if self.is_closed() {
            return Subscription::inert(name);
        }

        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        let callback: Callback = Arc::new(callback);
        let first = {
            let mut listeners = self.inner.listeners.lock();
            let entry = listeners.entry(name.to_string()).or_default();
            entry.push((id, callback));
            entry.len() == 1
        };
        if first {
            if let Err(e) = self.inner.post(Envelope::subscribe(name)) {
                debug!(channel = name, "subscribe not sent: {e}");
            }
        }

        Subscription {
            bridge: Arc::downgrade(&self.inner),
            channel: name.to_string(),
            id,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Tear the context down: pending calls reject with `Cancelled`, every
    /// listener is removed, and the controller drops this context.
    /// Idempotent.
    pub fn close(&self) {
        self.inner.shut("context closed");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.inner.shut("context dropped");
    }
}

struct PendingGuard<'a> {
    inner: &'a BridgeInner,
    call_id: &'a CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(self.call_id);
    }
}

impl BridgeInner {
    fn post(&self, envelope: Envelope) -> Result<()> {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(TetherError::Cancelled("context closed".into()));
        };
        tx.send(envelope)
            .map_err(|_| TetherError::Transport("controller link closed".into()))
    }

    fn remove_listener(&self, channel: &str, id: u64) {
        let now_empty = {
            let mut listeners = self.listeners.lock();
            let Some(list) = listeners.get_mut(channel) else {
                return;
            };
            let before = list.len();
            list.retain(|(lid, _)| *lid != id);
            if list.len() == before {
                return;
            }
            let empty = list.is_empty();
            if empty {
                listeners.remove(channel);
            }
            empty
        };
        if now_empty {
            let _ = self.post(Envelope::unsubscribe(channel));
        }
    }

    fn resolve(&self, envelope: Envelope) {
        let Some(call_id) = envelope.call_id else {
            warn!("response without call id dropped");
            return;
        };
        let Some(call) = self.pending.lock().remove(&call_id) else {
            debug!(call_id = %call_id, "late or unknown response dropped");
            return;
        };
        let result = match envelope.error {
            Some(err) => Err(TetherError::from_payload(&call.channel, err)),
            None => Ok(envelope.payload.unwrap_or(Value::Null)),
        };
        let _ = call.reply.send(result);
    }

    fn fire(&self, envelope: Envelope) {
        let callbacks: Vec<Callback> = match self.listeners.lock().get(&envelope.channel) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return,
        };
        let payload = envelope.payload.unwrap_or(Value::Null);
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&payload))).is_err() {
                error!(channel = %envelope.channel, "event listener panicked");
            }
        }
    }

    fn shut(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.lock().take();
        self.listeners.lock().clear();
        let pending: Vec<PendingCall> = self.pending.lock().drain().map(|(_, call)| call).collect();
        for call in pending {
            let _ = call.reply.send(Err(TetherError::Cancelled(reason.to_string())));
        }
        debug!(context = %self.context, reason, "bridge closed");
    }
}

async fn pump(inner: Arc<BridgeInner>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        match envelope.kind {
            EnvelopeKind::Response => inner.resolve(envelope),
            EnvelopeKind::Event => inner.fire(envelope),
            other => warn!(kind = ?other, "controller sent a UI-only envelope"),
        }
    }
    inner.shut("controller closed the context");
}

/// Handle returned by [`Bridge::on`].
///
/// Dropping it leaves the listener registered; call
/// [`Subscription::unsubscribe`] (any number of times) to remove it.
#[derive(Clone)]
pub struct Subscription {
    bridge: Weak<BridgeInner>,
    channel: String,
    id: u64,
    active: Arc<AtomicBool>,
}

impl Subscription {
    fn inert(channel: &str) -> Self {
        Self {
            bridge: Weak::new(),
            channel: channel.to_string(),
            id: u64::MAX,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Remove this listener. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.bridge.upgrade() {
            inner.remove_listener(&self.channel, self.id);
        }
    }

    /// `false` after `unsubscribe`, bridge teardown, or for inert handles.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
            && self
                .bridge
                .upgrade()
                .is_some_and(|inner| !inner.closed.load(Ordering::SeqCst))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelSpec, Shape};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> Arc<ChannelRegistry> {
        let mut reg = ChannelRegistry::new();
        reg.register(ChannelSpec::event("tick", Shape::Any)).expect("tick");
        reg.register(ChannelSpec::send("log-message").param("message", Shape::String))
            .expect("log");
        reg.register(ChannelSpec::invoke("add")).expect("add");
        Arc::new(reg)
    }

    /// A bridge wired to a bare link so tests can play the controller.
    fn bridge() -> (Bridge, Link) {
        let (controller_side, ui_side) = Link::pair();
        let bridge = Bridge::new(ContextId(5), ui_side, registry(), BridgeConfig::default())
            .expect("bridge");
        (bridge, controller_side)
    }

    #[tokio::test]
    async fn first_and_last_listener_announce_interest() {
        let (bridge, mut controller) = bridge();
        let a = bridge.on("tick", |_| {});
        let b = bridge.on("tick", |_| {});

        let sub = controller.rx.recv().await.expect("subscribe");
        assert_eq!(sub.kind, EnvelopeKind::Subscribe);

        a.unsubscribe();
        assert!(controller.rx.try_recv().is_err(), "one listener remains");
        b.unsubscribe();
        let unsub = controller.rx.recv().await.expect("unsubscribe");
        assert_eq!(unsub.kind, EnvelopeKind::Unsubscribe);
    }

    #[tokio::test]
    async fn unsubscribe_twice_is_a_noop() {
        let (bridge, mut controller) = bridge();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = bridge.on("tick", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let _ = controller.rx.recv().await;

        sub.unsubscribe();
        sub.unsubscribe();
        sub.clone().unsubscribe();
        assert!(!sub.is_active());

        controller
            .tx
            .send(Envelope::event("tick", json!({"n": 1})))
            .expect("send");
        tokio::task::yield_now().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn listeners_fire_in_registration_order_and_survive_panics() {
        let (bridge, controller) = bridge();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        bridge.on("tick", move |_| o1.lock().push(1));
        bridge.on("tick", |_| panic!("listener bug"));
        let o3 = Arc::clone(&order);
        bridge.on("tick", move |_| o3.lock().push(3));

        controller
            .tx
            .send(Envelope::event("tick", json!(null)))
            .expect("send");
        for _ in 0..50 {
            if order.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(*order.lock(), vec![1, 3]);
    }

    #[tokio::test]
    async fn send_drops_unregistered_and_invalid_messages() {
        let (bridge, mut controller) = bridge();
        bridge.send("nope", vec![json!("x")]);
        bridge.send("add", vec![]);
        bridge.send("log-message", vec![json!(42)]);
        bridge.send("log-message", vec![json!("ok")]);

        let env = controller.rx.recv().await.expect("one valid send");
        assert_eq!(env.channel, "log-message");
        assert!(env.call_id.is_none());
        assert!(controller.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn on_non_event_channel_is_inert() {
        let (bridge, mut controller) = bridge();
        let sub = bridge.on("add", |_| {});
        assert!(!sub.is_active());
        sub.unsubscribe();
        assert!(controller.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn call_ids_are_unique_and_late_responses_are_dropped() {
        let (controller_side, ui_side) = Link::pair();
        let bridge = Bridge::new(
            ContextId(2),
            ui_side,
            registry(),
            BridgeConfig::with_timeout(std::time::Duration::from_millis(20)),
        )
        .expect("bridge");
        let Link { tx, mut rx } = controller_side;

        let first = bridge.invoke("add", vec![]).await;
        assert!(first.unwrap_err().is_timeout());
        let req1 = rx.recv().await.expect("request 1");

        // Answer the timed-out call; it must not leak into the next one.
        tx.send(Envelope::success("add", req1.call_id.clone().expect("id"), json!(1)))
            .expect("late response");

        let responder = tokio::spawn(async move {
            let req2 = rx.recv().await.expect("request 2");
            let id = req2.call_id.expect("id");
            tx.send(Envelope::success("add", id.clone(), json!(2))).expect("reply");
            id
        });
        let second = bridge.invoke("add", vec![]).await.expect("second resolves");
        let id2 = responder.await.expect("join");

        assert_eq!(second, json!(2));
        assert_ne!(req1.call_id, Some(id2));
    }

    #[tokio::test]
    async fn abandoned_invokes_leave_no_pending_entries() {
        let (bridge, _controller) = bridge();
        for _ in 0..20 {
            let abandoned = tokio::time::timeout(
                std::time::Duration::from_millis(1),
                bridge.invoke("add", vec![]),
            )
            .await;
            assert!(abandoned.is_err());
        }
        assert!(bridge.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn close_cancels_pending_and_clears_listeners() {
        let (controller_side, ui_side) = Link::pair();
        let bridge = Arc::new(
            Bridge::new(ContextId(3), ui_side, registry(), BridgeConfig::default())
                .expect("bridge"),
        );
        let sub = bridge.on("tick", |_| {});

        let b = Arc::clone(&bridge);
        let call = tokio::spawn(async move { b.invoke("add", vec![]).await });
        tokio::task::yield_now().await;

        bridge.close();
        let result = call.await.expect("join");
        assert!(matches!(result, Err(TetherError::Cancelled(_))), "{result:?}");
        assert!(!sub.is_active());
        assert!(matches!(
            bridge.invoke("add", vec![]).await,
            Err(TetherError::Cancelled(_))
        ));
        drop(controller_side);
    }
}
