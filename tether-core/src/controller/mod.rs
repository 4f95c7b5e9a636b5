//! `Controller`, the privileged side of the boundary.
//!
//! ## Lifecycle
//!
//! ```text
//! ChannelRegistry (built at startup)
//!     └─► Controller::new()           registry frozen behind Arc
//!         ├─► handle()/listen()       request handlers + message listeners
//!         ├─► attach()/attach_link()  one pump task per UI context
//!         ├─► broadcast()/unicast()   events out
//!         └─► shutdown()              in-flight calls → Cancelled, links closed
//! ```
//!
//! ## Threading
//!
//! Each request runs in its own task, so a slow handler never blocks other
//! calls and responses may complete in any order. The tables below are
//! behind `parking_lot` locks held only for short, non-async sections; on a
//! `current_thread` runtime this gives the single logical thread the model
//! assumes.

pub mod dispatcher;
pub mod emitter;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::{
    bridge::Bridge,
    channel::ChannelRegistry,
    config::ControllerConfig,
    error::{HandlerError, Result, TetherError},
    ipc::{
        envelope::{CallId, ContextId, Envelope, EnvelopeKind},
        Link,
    },
};

pub use dispatcher::{RequestContext, RequestDispatcher};
pub use emitter::EventEmitter;

/// A request whose handler has not produced a response yet.
struct InFlight {
    channel: String,
    abort: AbortHandle,
}

struct ControllerInner {
    config: ControllerConfig,
    registry: Arc<ChannelRegistry>,
    dispatcher: RequestDispatcher,
    emitter: EventEmitter,
    in_flight: Mutex<HashMap<(ContextId, CallId), InFlight>>,
    next_context: AtomicU64,
    shutting_down: AtomicBool,
}

/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("channels", &self.inner.registry.len())
            .field("contexts", &self.inner.emitter.context_ids().len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Take ownership of the registry; it cannot change after this point.
    ///
    /// # Errors
    /// `InvalidConfig` if `config` fails validation.
    pub fn new(registry: ChannelRegistry, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(registry);
        info!(channels = registry.len(), "controller ready");
        Ok(Self {
            inner: Arc::new(ControllerInner {
                dispatcher: RequestDispatcher::new(Arc::clone(&registry)),
                emitter: EventEmitter::new(Arc::clone(&registry)),
                registry,
                config,
                in_flight: Mutex::new(HashMap::new()),
                next_context: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn registry(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.inner.registry)
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    // ── Registration ─────────────────────────────────────────────────────

    /// See [`RequestDispatcher::handle`].
    pub fn handle<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
    {
        self.inner.dispatcher.handle(name, handler)
    }

    /// See [`RequestDispatcher::handle_typed`].
    pub fn handle_typed<A, R, F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        self.inner.dispatcher.handle_typed(name, handler)
    }

    /// See [`RequestDispatcher::listen`].
    pub fn listen<F>(&self, name: &str, listener: F) -> Result<()>
    where
        F: Fn(RequestContext, Value) + Send + Sync + 'static,
    {
        self.inner.dispatcher.listen(name, listener)
    }

    /// See [`RequestDispatcher::listen_typed`].
    pub fn listen_typed<A, F>(&self, name: &str, listener: F) -> Result<()>
    where
        A: DeserializeOwned + 'static,
        F: Fn(RequestContext, A) + Send + Sync + 'static,
    {
        self.inner.dispatcher.listen_typed(name, listener)
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.inner.dispatcher
    }

    // ── Contexts ─────────────────────────────────────────────────────────

    /// Create an in-process UI context and return its Bridge.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn attach(&self) -> Result<Bridge> {
        let (controller_side, ui_side) = Link::pair();
        let id = self.attach_link(controller_side)?;
        Bridge::new(
            id,
            ui_side,
            self.registry(),
            self.inner.config.bridge.clone(),
        )
    }

    /// Serve one UI context over an existing link.
    ///
    /// # Errors
    /// `Cancelled` once shutdown has begun.
    pub fn attach_link(&self, link: Link) -> Result<ContextId> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(TetherError::Cancelled("controller is shutting down".into()));
        }
        let id = ContextId(self.inner.next_context.fetch_add(1, Ordering::SeqCst));
        let Link { tx, rx } = link;
        self.inner.emitter.register(id, tx);
        tokio::spawn(pump(Arc::clone(&self.inner), id, rx));
        info!(%id, "UI context attached");
        Ok(id)
    }

    /// Serve one UI context over a byte stream (newline-delimited JSON).
    #[cfg(feature = "stream")]
    pub fn attach_stream<R, W>(&self, reader: R, writer: W) -> Result<ContextId>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        self.attach_link(crate::ipc::codec::spawn_stream_link(reader, writer))
    }

    /// Drop a context: it receives no further events or responses.
    /// Handlers already running for it complete on their own.
    pub fn detach(&self, id: ContextId) -> bool {
        self.inner.teardown(id)
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        self.inner.emitter.context_ids()
    }

    pub fn is_subscribed(&self, id: ContextId, channel: &str) -> bool {
        self.inner.emitter.is_subscribed(id, channel)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    // ── Events ───────────────────────────────────────────────────────────

    /// See [`EventEmitter::broadcast`].
    pub fn broadcast(&self, name: &str, payload: Value) -> Result<usize> {
        let delivered = self.inner.emitter.broadcast(name, payload)?;
        if self.inner.config.trace_envelopes {
            debug!(channel = name, delivered, "event broadcast");
        }
        Ok(delivered)
    }

    /// See [`EventEmitter::unicast`].
    pub fn unicast(&self, id: ContextId, name: &str, payload: Value) -> Result<()> {
        self.inner.emitter.unicast(id, name, payload)
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Flush every in-flight call as `Cancelled` and close all contexts.
    ///
    /// Returns the number of calls cancelled. Idempotent.
    pub fn shutdown(&self) -> usize {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let drained: Vec<((ContextId, CallId), InFlight)> =
            self.inner.in_flight.lock().drain().collect();
        let cancelled = drained.len();
        for ((context, call_id), call) in drained {
            call.abort.abort();
            let err = TetherError::Cancelled("controller shutting down".into());
            let _ = self.inner.emitter.deliver(
                context,
                Envelope::failure(call.channel, call_id, err.to_payload()),
            );
        }

        let closed = self.inner.emitter.close_all();
        info!(cancelled, closed, "controller shut down");
        cancelled
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }
}

impl ControllerInner {
    fn teardown(&self, id: ContextId) -> bool {
        let removed = self.emitter.remove(id);
        if removed {
            info!(%id, "UI context detached");
        }
        removed
    }

    fn start_call(self: &Arc<Self>, context: ContextId, channel: String, args: Vec<Value>, call_id: CallId) {
        if self.shutting_down.load(Ordering::SeqCst) {
            let err = TetherError::Cancelled("controller shutting down".into());
            let _ = self
                .emitter
                .deliver(context, Envelope::failure(channel, call_id, err.to_payload()));
            return;
        }

        let key = (context, call_id.clone());
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&key) {
            warn!(%context, call_id = %call_id, "ignoring request with a call id already in flight");
            return;
        }

        let inner = Arc::clone(self);
        let task_channel = channel.clone();
        let task = tokio::spawn(async move {
            let response = inner
                .dispatcher
                .dispatch(context, &task_channel, args, call_id.clone())
                .await;
            // Shutdown may have already answered this call.
            if inner.in_flight.lock().remove(&(context, call_id)).is_some() {
                if inner.config.trace_envelopes {
                    debug!(%context, channel = %task_channel, "response sent");
                }
                if !inner.emitter.deliver(context, response) {
                    debug!(%context, "response dropped: context closed");
                }
            }
        });
        in_flight.insert(
            key,
            InFlight {
                channel,
                abort: task.abort_handle(),
            },
        );
    }

    fn route(self: &Arc<Self>, context: ContextId, envelope: Envelope) {
        if self.config.trace_envelopes {
            debug!(%context, channel = %envelope.channel, kind = ?envelope.kind, "envelope in");
        }
        match envelope.kind {
            EnvelopeKind::Request => {
                let args = envelope.args();
                match envelope.call_id {
                    Some(call_id) => self.start_call(context, envelope.channel, args, call_id),
                    None => self.dispatcher.notify(context, &envelope.channel, args),
                }
            }
            EnvelopeKind::Subscribe => self.emitter.subscribe(context, &envelope.channel),
            EnvelopeKind::Unsubscribe => self.emitter.unsubscribe(context, &envelope.channel),
            EnvelopeKind::Response | EnvelopeKind::Event => {
                warn!(%context, kind = ?envelope.kind, "UI context sent a controller-only envelope");
            }
        }
    }
}

/// Read one context's inbound envelopes until its link closes.
async fn pump(inner: Arc<ControllerInner>, id: ContextId, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        inner.route(id, envelope);
    }
    inner.teardown(id);
}
