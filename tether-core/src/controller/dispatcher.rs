//! Request dispatcher. Runs exactly one handler per call id.
//!
//! ## Call path
//!
//! ```text
//! dispatch(name, args, call_id)
//!     ├─► registry.bind_args      UnknownChannel / ShapeMismatch → failure envelope
//!     ├─► handler lookup          no handler → UnknownChannel
//!     ├─► tokio::spawn(handler)   Err → HandlerFailure, panic → HandlerFailure
//!     └─► registry.validate_result
//! ```
//!
//! The handler always runs in its own task so a panic is reported through
//! `JoinError` instead of unwinding into the dispatcher.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::{
    channel::{ChannelRegistry, Direction},
    error::{codes, HandlerError, Result, TetherError},
    ipc::envelope::{CallId, ContextId, Envelope},
};

pub type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, HandlerError>> + Send>>;

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Who is calling, and on which channel. Passed to every handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub context: ContextId,
    pub channel: String,
    /// `None` for fire-and-forget messages.
    pub call_id: Option<CallId>,
}

/// Controller-side handler for an `Invoke` channel.
///
/// Receives the bound argument object (`{"a": 2, "b": 3}`), already
/// validated against the channel's parameter shapes.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: RequestContext, args: Value) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    fn call(&self, request: RequestContext, args: Value) -> HandlerFuture {
        Box::pin(self(request, args))
    }
}

/// Controller-side consumer of a `Send` channel.
pub trait Listener: Send + Sync + 'static {
    fn notify(&self, request: RequestContext, args: Value);
}

impl<F> Listener for F
where
    F: Fn(RequestContext, Value) + Send + Sync + 'static,
{
    fn notify(&self, request: RequestContext, args: Value) {
        self(request, args)
    }
}

pub struct RequestDispatcher {
    registry: Arc<ChannelRegistry>,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    listeners: RwLock<HashMap<String, Arc<dyn Listener>>>,
}

impl RequestDispatcher {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            handlers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Associate `handler` with the `Invoke` channel `name`.
    ///
    /// # Errors
    /// - `UnknownChannel` if `name` is not a registered `Invoke` channel.
    /// - `DuplicateHandler` if a handler is already present.
    pub fn handle<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
    {
        self.registry.lookup(name, Direction::Invoke)?;
        let mut handlers = self.handlers.write();
        if handlers.contains_key(name) {
            return Err(TetherError::DuplicateHandler {
                channel: name.to_string(),
            });
        }
        handlers.insert(name.to_string(), Arc::new(handler));
        debug!(channel = name, "request handler registered");
        Ok(())
    }

    /// `handle` with serde conversion on both ends.
    ///
    /// Argument deserialization failures are reported as `SHAPE_MISMATCH`.
    pub fn handle_typed<A, R, F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.handle(name, move |request: RequestContext, args: Value| {
            let handler = Arc::clone(&handler);
            async move {
                let args: A = serde_json::from_value(args)
                    .map_err(|e| HandlerError::new(codes::SHAPE_MISMATCH, e.to_string()))?;
                let result = handler(request, args).await?;
                Ok::<Value, HandlerError>(serde_json::to_value(result)?)
            }
        })
    }

    /// Register the consumer of the `Send` channel `name`.
    ///
    /// # Errors
    /// Same as [`RequestDispatcher::handle`], for `Send` channels.
    pub fn listen<F>(&self, name: &str, listener: F) -> Result<()>
    where
        F: Fn(RequestContext, Value) + Send + Sync + 'static,
    {
        self.registry.lookup(name, Direction::Send)?;
        let mut listeners = self.listeners.write();
        if listeners.contains_key(name) {
            return Err(TetherError::DuplicateHandler {
                channel: name.to_string(),
            });
        }
        listeners.insert(name.to_string(), Arc::new(listener));
        debug!(channel = name, "message listener registered");
        Ok(())
    }

    /// `listen` with the bound arguments deserialized into `A`.
    pub fn listen_typed<A, F>(&self, name: &str, listener: F) -> Result<()>
    where
        A: DeserializeOwned + 'static,
        F: Fn(RequestContext, A) + Send + Sync + 'static,
    {
        self.listen(name, move |request: RequestContext, args: Value| {
            match serde_json::from_value::<A>(args) {
                Ok(args) => listener(request, args),
                Err(e) => warn!(channel = %request.channel, "dropping message: {e}"),
            }
        })
    }

    /// Validate and run one request, producing the response envelope.
    ///
    /// Never fails: every outcome, including validation errors and handler
    /// panics, becomes a response carrying `call_id`.
    pub async fn dispatch(
        &self,
        context: ContextId,
        name: &str,
        args: Vec<Value>,
        call_id: CallId,
    ) -> Envelope {
        match self.run(context, name, args, call_id.clone()).await {
            Ok(result) => Envelope::success(name, call_id, result),
            Err(e) => {
                debug!(channel = name, call_id = %call_id, code = e.code(), "request rejected: {e}");
                Envelope::failure(name, call_id, e.to_payload())
            }
        }
    }

    async fn run(
        &self,
        context: ContextId,
        name: &str,
        args: Vec<Value>,
        call_id: CallId,
    ) -> Result<Value> {
        let bound = self.registry.bind_args(name, Direction::Invoke, args)?;

        let Some(handler) = self.handlers.read().get(name).cloned() else {
            warn!(channel = name, "registered channel has no handler");
            return Err(TetherError::UnknownChannel {
                channel: name.to_string(),
            });
        };

        let request = RequestContext {
            context,
            channel: name.to_string(),
            call_id: Some(call_id),
        };
        let task = tokio::spawn(async move { handler.call(request, bound).await });
        // Cancelling this call (shutdown) must cancel the handler too.
        let _abort = AbortOnDrop(task.abort_handle());

        let result = match task.await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(e.into()),
            Err(join_err) if join_err.is_panic() => {
                error!(channel = name, "request handler panicked");
                return Err(TetherError::HandlerFailure {
                    code: codes::HANDLER_FAILURE.to_string(),
                    message: "handler panicked".to_string(),
                });
            }
            Err(_) => return Err(TetherError::Cancelled("handler task aborted".into())),
        };

        if let Err(e) = self.registry.validate_result(name, &result) {
            error!(channel = name, "handler returned a result outside its declared shape: {e}");
            return Err(e);
        }
        Ok(result)
    }

    /// Deliver a fire-and-forget message. Failures are logged, never raised.
    pub fn notify(&self, context: ContextId, name: &str, args: Vec<Value>) {
        let bound = match self.registry.bind_args(name, Direction::Send, args) {
            Ok(bound) => bound,
            Err(e) => {
                warn!(channel = name, %context, "dropping message: {e}");
                return;
            }
        };
        let Some(listener) = self.listeners.read().get(name).cloned() else {
            warn!(channel = name, "dropping message: no listener registered");
            return;
        };

        let request = RequestContext {
            context,
            channel: name.to_string(),
            call_id: None,
        };
        let channel = name.to_string();
        let task = tokio::spawn(async move { listener.notify(request, bound) });
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(channel = %channel, "message listener panicked");
                }
            }
        });
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }
}
