//! Handler adapter: typed handler functions over the erased dispatch the
//! bus works with.
//!
//! The bus keeps one registry of heterogeneous handlers, so it only sees
//! [`Handler`]: build a blank request, report the result type, handle an
//! erased packet. [`TypedHandler`] bridges a plain async function
//! `(Context, RequestPacket<R>) -> Result<R::Result, HandlerError>` to that
//! interface with a single downcast per message.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use sourced_cqrs::bus::{handler, Handler};
//! use sourced_cqrs::{Request, RequestType};
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct GetProduct {
//!     sku: String,
//! }
//!
//! impl Request for GetProduct {
//!     type Result = String;
//!
//!     fn request_type(&self) -> RequestType {
//!         RequestType::action("catalog", "product", "get")
//!     }
//! }
//!
//! let get_product = handler(|_ctx, packet: sourced_cqrs::bus::RequestPacket<GetProduct>| async move {
//!     Ok(format!("product {}", packet.request.sku))
//! });
//!
//! assert_eq!(get_product.new_request().request_type().to_string(), "catalog.product.get");
//! ```

use std::any::{type_name, Any};
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde_json::Value;

use super::context::Context;
use super::message::Message;
use super::packet::{Reply, RequestPacket};
use super::request::{Request, RequestType};
use crate::error::{BusError, HandlerError};

/// A request value with its concrete type erased.
pub trait ErasedRequest: Send + 'static {
    /// The operation this request targets.
    fn request_type(&self) -> RequestType;

    /// Replace this value with the one decoded from `message`.
    fn unmarshal(&mut self, message: &Message) -> Result<(), BusError>;

    /// Hand back the concrete value for downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<R: Request> ErasedRequest for R {
    fn request_type(&self) -> RequestType {
        Request::request_type(self)
    }

    fn unmarshal(&mut self, message: &Message) -> Result<(), BusError> {
        let name = Request::request_type(self).to_string();
        *self = message.unmarshal::<R>(&name)?;
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Boxed erased request, the unit the receive loop works with.
pub type BoxedRequest = Box<dyn ErasedRequest>;

/// Erased request handler as stored in the bus registry.
pub trait Handler: Send + Sync + 'static {
    /// A blank request; its type keys the registry and it is the target
    /// incoming envelopes are unmarshaled into.
    fn new_request(&self) -> BoxedRequest;

    /// Describe the reply this handler produces: the result type name.
    fn new_reply(&self) -> &'static str;

    /// Handle one request. Never panics: failures come back as error replies.
    fn handle(&self, ctx: Context, packet: RequestPacket<BoxedRequest>)
        -> BoxFuture<'static, Reply<Value>>;
}

/// Adapter from a typed async function to [`Handler`].
pub struct TypedHandler<R, F> {
    f: F,
    _request: PhantomData<fn(R)>,
}

impl<R, F, Fut> TypedHandler<R, F>
where
    R: Request + Default,
    F: Fn(Context, RequestPacket<R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R::Result, HandlerError>> + Send + 'static,
{
    /// Wrap a handler function.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _request: PhantomData,
        }
    }
}

/// Wrap a typed handler function as a boxed [`Handler`].
pub fn handler<R, F, Fut>(f: F) -> Box<dyn Handler>
where
    R: Request + Default,
    F: Fn(Context, RequestPacket<R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R::Result, HandlerError>> + Send + 'static,
{
    Box::new(TypedHandler::new(f))
}

impl<R, F, Fut> Handler for TypedHandler<R, F>
where
    R: Request + Default,
    F: Fn(Context, RequestPacket<R>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R::Result, HandlerError>> + Send + 'static,
{
    fn new_request(&self) -> BoxedRequest {
        Box::new(R::default())
    }

    fn new_reply(&self) -> &'static str {
        type_name::<R::Result>()
    }

    fn handle(
        &self,
        ctx: Context,
        packet: RequestPacket<BoxedRequest>,
    ) -> BoxFuture<'static, Reply<Value>> {
        let packet = match downcast::<R>(packet) {
            Ok(packet) => packet,
            Err(reply) => return future::ready(reply).boxed(),
        };
        let correlation_id = packet.correlation_id.clone();

        // the call itself may panic before any future exists
        let call = std::panic::catch_unwind(AssertUnwindSafe(|| (self.f)(ctx, packet)));
        let fut = match call {
            Ok(fut) => fut,
            Err(panic) => {
                return future::ready(panicked_reply::<R>(&correlation_id, panic)).boxed()
            }
        };

        async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(result)) => match serde_json::to_value(result) {
                    Ok(value) => Reply::ok(value),
                    Err(err) => Reply::err(format!("encoding result failed: {err}")),
                },
                Ok(Err(err)) => Reply::err(err.to_string()),
                Err(panic) => panicked_reply::<R>(&correlation_id, panic),
            }
        }
        .boxed()
    }
}

fn panicked_reply<R: Request>(correlation_id: &str, panic: Box<dyn Any + Send>) -> Reply<Value> {
    let detail = panic_detail(panic);
    tracing::warn!(
        correlation_id,
        request = type_name::<R>(),
        error = %detail,
        "handler panicked"
    );
    Reply::err(format!("handler panicked: {detail}"))
}

fn downcast<R: Request>(packet: RequestPacket<BoxedRequest>) -> Result<RequestPacket<R>, Reply<Value>> {
    let RequestPacket {
        correlation_id,
        request_topic,
        reply_topic,
        no_reply,
        message,
        request,
    } = packet;

    let request = request.into_any().downcast::<R>().map_err(|_| {
        Reply::err(format!(
            "handler for {} received a foreign request",
            type_name::<R>()
        ))
    })?;

    Ok(RequestPacket {
        correlation_id,
        request_topic,
        reply_topic,
        no_reply,
        message,
        request: *request,
    })
}

/// Text of a caught panic payload.
pub(crate) fn panic_detail(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
