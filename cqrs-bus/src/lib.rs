//! Orchestrates command dispatch, event publication and query execution
//! over a [`MessageRouter`], an opaque [`HandlerRegistry`], and optional
//! durable queue and event store backends.
//!
//! Grounded on `original_source/bus/bus.go`'s `Bus`: `Dispatch` routes a
//! command either straight through its handler chain (sync) or onto the
//! queue (async); `Publish` appends events to the store first, then fans
//! each one out to its handlers as an independently-queued
//! [`QueuedEvent`]; `Query` always executes inline. Guard failures (an
//! invalid command, a caller missing a required scope) short-circuit
//! before the handler ever runs; handler errors flow back out through
//! whatever middleware wraps the route.

use cqrs_core::{
    Command, CommandResponse, DispatchContext, Dispatchable, EventStore, ExpectedVersion, FrameworkError,
    HandlerRegistry, MessageRegistry, Query, Queue, QueueContext, QueueMessage, QueuedEvent, SerializedEvent,
    StoredEvent,
};
use cqrs_router::{MessageRouter, Middleware, Next, Payload};
use std::any::Any;
use std::sync::Arc;

/// Orchestrates dispatch, publish and query over a router and its backends.
///
/// Cheaply cloneable (every field is an `Arc`), so a `Bus` can be shared
/// across the tasks a [`cqrs_ports`]-style supervisor spawns without
/// wrapping it in another `Arc` itself.
#[derive(Clone)]
pub struct Bus {
    router: Arc<MessageRouter>,
    handlers: Arc<dyn HandlerRegistry>,
    registry: Arc<MessageRegistry>,
    queue: Option<Arc<dyn Queue>>,
    event_store: Option<Arc<dyn EventStore>>,
}

impl Bus {
    #[must_use]
    pub fn new(router: Arc<MessageRouter>, handlers: Arc<dyn HandlerRegistry>, registry: Arc<MessageRegistry>) -> Self {
        Self { router, handlers, registry, queue: None, event_store: None }
    }

    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    #[must_use]
    pub fn with_event_store(mut self, event_store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(event_store);
        self
    }

    /// Dispatch a command.
    ///
    /// If `sync`, runs the command's handler (wrapped in its registered
    /// middleware) and returns its response; any follow-up messages the
    /// handler produced are then routed (commands dispatched async, events
    /// published) before this call returns. If not `sync`, the command is
    /// serialized and published to the queue, and this returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - [`FrameworkError::Validation`] — `command.valid()` failed.
    /// - [`FrameworkError::Forbidden`] — the caller's credentials don't
    ///   satisfy `command.auth()`.
    /// - [`FrameworkError::NoCommandHandler`] — nothing is routed for this
    ///   command's name, or the name routed to isn't registered in the
    ///   handler registry.
    /// - [`FrameworkError::Queue`] — async dispatch was requested but no
    ///   queue is configured, or publishing failed.
    pub async fn dispatch<C: Command>(&self, ctx: DispatchContext, command: C, sync: bool) -> Result<Option<CommandResponse>, FrameworkError> {
        command.valid().map_err(FrameworkError::Validation)?;
        enforce_groups(&ctx, &command.auth())?;

        let name = command.command_name();
        if !sync {
            self.enqueue_command(&ctx, name, &command).await?;
            return Ok(None);
        }

        let route = self
            .router
            .route_command(name)
            .ok_or_else(|| FrameworkError::NoCommandHandler(name.to_string()))?;
        let handler = self
            .handlers
            .command_handler(route.handler())
            .ok_or_else(|| FrameworkError::NoCommandHandler(route.handler().to_string()))?;

        let terminal: Next = Arc::new(move |ctx, payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let (response, follow_ups) = handler.execute(ctx, payload.as_ref()).await?;
                Ok(Box::new((response, follow_ups)) as Payload)
            })
        });
        let chain = build_chain(route.middleware(), terminal);

        let outcome = chain(ctx.clone(), Box::new(command)).await?;
        let (response, follow_ups) = *outcome
            .downcast::<(CommandResponse, Vec<Dispatchable>)>()
            .map_err(|_| FrameworkError::Internal("command outcome type mismatch".to_string()))?;

        self.route_messages(&ctx, follow_ups).await?;
        tracing::debug!(command = name, "command dispatched synchronously");
        Ok(Some(response))
    }

    /// Dispatch a boxed, already-routed command — the path used for
    /// follow-up commands a handler produced, where the concrete type is no
    /// longer known statically.
    async fn dispatch_boxed(&self, ctx: DispatchContext, command: Box<dyn Command>) -> Result<(), FrameworkError> {
        command.valid().map_err(FrameworkError::Validation)?;
        enforce_groups(&ctx, &command.auth())?;

        let name = command.command_name();
        self.enqueue_boxed_command(&ctx, name, command).await
    }

    async fn enqueue_command<C: Command>(&self, ctx: &DispatchContext, name: &'static str, command: &C) -> Result<(), FrameworkError> {
        let payload = self.registry.encode(name, command.as_any())?;
        self.publish_to_queue(ctx, name, payload).await
    }

    async fn enqueue_boxed_command(&self, ctx: &DispatchContext, name: &'static str, command: Box<dyn Command>) -> Result<(), FrameworkError> {
        let payload = self.registry.encode(name, command.as_any())?;
        self.publish_to_queue(ctx, name, payload).await
    }

    async fn publish_to_queue(&self, ctx: &DispatchContext, message_type: &'static str, payload: Vec<u8>) -> Result<(), FrameworkError> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| FrameworkError::Queue("no queue configured for async dispatch".to_string()))?;
        let message = QueueMessage::new(message_type.to_string(), payload, QueueContext::from(ctx));
        queue.publish(vec![message]).await.map_err(|e| FrameworkError::Queue(e.to_string()))
    }

    /// Append events to the event store (if configured) and fan each one
    /// out to its registered handlers as an independently-queued
    /// [`QueuedEvent`].
    ///
    /// Events within one call must share a stream; appended with
    /// [`ExpectedVersion::Any`] since the aggregate that raised them already
    /// enforced its own optimistic concurrency — this call only needs the
    /// store's unique-index guarantee against a second, concurrent writer to
    /// the same stream.
    ///
    /// # Errors
    ///
    /// [`FrameworkError::EventStore`] if the append fails — fan-out does not
    /// happen in that case. [`FrameworkError::Queue`] if handler fan-out
    /// publication fails.
    pub async fn publish(&self, ctx: DispatchContext, events: Vec<StoredEvent>) -> Result<(), FrameworkError> {
        if events.is_empty() {
            return Ok(());
        }

        if let Some(store) = &self.event_store {
            let stream = events[0].stream.clone();
            store.append_events(stream, ExpectedVersion::Any, events.clone()).await?;
        }

        for event in events {
            self.fan_out_event(&ctx, event.event).await?;
        }
        Ok(())
    }

    async fn fan_out_event(&self, ctx: &DispatchContext, event: SerializedEvent) -> Result<(), FrameworkError> {
        let routes = self.router.route_event(&event.event_type);
        if routes.is_empty() {
            return Ok(());
        }

        for route in routes {
            let queued = QueuedEvent::new(event.clone(), route.handler().to_string());
            self.handle_event(ctx, queued).await?;
        }
        Ok(())
    }

    /// Deliver one `(event, handler)` pair: queued if the handler asked to
    /// be async (the default), run inline otherwise.
    async fn handle_event(&self, ctx: &DispatchContext, queued: QueuedEvent) -> Result<(), FrameworkError> {
        let handler = self
            .handlers
            .event_handler(&queued.handler)
            .ok_or_else(|| FrameworkError::Internal(format!("no event handler registered: {}", queued.handler)))?;

        if handler.is_async() {
            let payload = bincode::serialize(&queued).map_err(|e| FrameworkError::Queue(e.to_string()))?;
            self.publish_to_queue(ctx, QueuedEvent::MESSAGE_TYPE, payload).await
        } else {
            let follow_ups = handler.handle(ctx.child(), &queued.event).await?;
            self.route_messages(ctx, follow_ups).await
        }
    }

    /// Run a query inline, always synchronously.
    ///
    /// `result` is the caller-owned destination value; the handler fills it
    /// in place and the filled value is handed back.
    ///
    /// # Errors
    ///
    /// Same guard/routing errors as [`Self::dispatch`], plus
    /// [`FrameworkError::InvalidQueryResult`] if the handler wrote a result
    /// of the wrong type (a registration bug, not a caller error).
    pub async fn query<Q, R>(&self, ctx: DispatchContext, query: Q, result: R) -> Result<R, FrameworkError>
    where
        Q: Query,
        R: Send + Sync + 'static,
    {
        query.valid().map_err(FrameworkError::Validation)?;
        enforce_groups(&ctx, &query.auth())?;

        let name = query.query_name();
        let route = self
            .router
            .route_query(name)
            .ok_or_else(|| FrameworkError::NoQueryHandler(name.to_string()))?;
        let handler = self
            .handlers
            .query_handler(route.handler())
            .ok_or_else(|| FrameworkError::NoQueryHandler(route.handler().to_string()))?;

        let invocation = QueryInvocation { query: Box::new(query), result: Box::new(result) };

        let terminal: Next = Arc::new(move |ctx, payload| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let mut invocation = payload
                    .downcast::<QueryInvocation>()
                    .map_err(|_| FrameworkError::Internal("query payload type mismatch".to_string()))?;
                handler.execute(ctx, invocation.query.as_any(), invocation.result.as_mut()).await?;
                Ok(invocation as Payload)
            })
        });
        let chain = build_chain(route.middleware(), terminal);
        let outcome = chain(ctx, Box::new(invocation)).await?;

        let invocation = outcome
            .downcast::<QueryInvocation>()
            .map_err(|_| FrameworkError::Internal("query outcome type mismatch".to_string()))?;
        let result = invocation.result.downcast::<R>().map_err(|_| FrameworkError::InvalidQueryResult)?;
        Ok(*result)
    }

    async fn route_messages(&self, ctx: &DispatchContext, messages: Vec<Dispatchable>) -> Result<(), FrameworkError> {
        for message in messages {
            match message {
                Dispatchable::Command(command) => {
                    self.dispatch_boxed(ctx.child(), command).await?;
                }
                Dispatchable::Event(event) => {
                    self.fan_out_event(ctx, event).await?;
                }
                Dispatchable::QueuedEvent(queued) => {
                    self.handle_event(ctx, queued).await?;
                }
                Dispatchable::Query(_) => {
                    return Err(FrameworkError::Internal("a handler produced a query as a follow-up message".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// The payload a query's middleware chain threads through: the query itself
/// plus the destination the terminal stage writes its result into.
///
/// Travels through the chain by ownership like any other [`Payload`] — the
/// caller-supplied result value goes in boxed, the handler mutates it in
/// place through a `&mut dyn Any` borrow that only lives for the terminal
/// call, and [`Bus::query`] downcasts it back out of the chain's return
/// value once the whole thing completes.
struct QueryInvocation {
    query: Box<dyn Query>,
    result: Box<dyn Any + Send + Sync>,
}

fn build_chain(middleware: &[Arc<dyn Middleware>], terminal: Next) -> Next {
    let mut next = terminal;
    for mw in middleware.iter().rev() {
        let mw = Arc::clone(mw);
        let inner = Arc::clone(&next);
        next = Arc::new(move |ctx, payload| mw.call(ctx, payload, Arc::clone(&inner)));
    }
    next
}

fn enforce_groups(ctx: &DispatchContext, groups: &[Vec<&'static str>]) -> Result<(), FrameworkError> {
    let slices: Vec<&[&'static str]> = groups.iter().map(Vec::as_slice).collect();
    cqrs_core::credentials::enforce(ctx.credentials(), &slices)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cqrs_core::QueueError;
    use cqrs_router::{MiddlewareResult, RouterBuilder};
    use futures::future::BoxFuture;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct PlaceOrder {
        order_id: String,
    }

    impl Command for PlaceOrder {
        fn command_name(&self) -> &'static str {
            "PlaceOrder"
        }

        fn valid(&self) -> Result<(), String> {
            if self.order_id.is_empty() {
                Err("order_id must not be empty".to_string())
            } else {
                Ok(())
            }
        }
    }

    struct PlaceOrderHandler;

    impl cqrs_core::CommandHandler for PlaceOrderHandler {
        fn execute(
            &self,
            _ctx: DispatchContext,
            command: &dyn Any,
        ) -> BoxFuture<'_, Result<(CommandResponse, Vec<Dispatchable>), FrameworkError>> {
            let order_id = command.downcast_ref::<PlaceOrder>().expect("handler wired to wrong command").order_id.clone();
            Box::pin(async move { Ok((CommandResponse::new(Some(order_id)), Vec::new())) })
        }
    }

    struct GetOrderCount;

    impl cqrs_core::QueryHandler for GetOrderCount {
        fn execute(&self, _ctx: DispatchContext, _query: &dyn Any, result: &mut dyn Any) -> BoxFuture<'_, Result<(), FrameworkError>> {
            Box::pin(async move {
                *result.downcast_mut::<u32>().expect("result wired to wrong type") = 7;
                Ok(())
            })
        }
    }

    struct GetOrderCountQuery;

    impl Query for GetOrderCountQuery {
        fn query_name(&self) -> &'static str {
            "GetOrderCount"
        }
    }

    struct Registry {
        commands: HashMap<&'static str, Arc<dyn cqrs_core::CommandHandler>>,
        queries: HashMap<&'static str, Arc<dyn cqrs_core::QueryHandler>>,
    }

    impl HandlerRegistry for Registry {
        fn command_handler(&self, name: &str) -> Option<Arc<dyn cqrs_core::CommandHandler>> {
            self.commands.get(name).cloned()
        }
        fn query_handler(&self, name: &str) -> Option<Arc<dyn cqrs_core::QueryHandler>> {
            self.queries.get(name).cloned()
        }
        fn event_handler(&self, _name: &str) -> Option<Arc<dyn cqrs_core::EventHandler>> {
            None
        }
    }

    fn bus() -> Bus {
        let router = RouterBuilder::new()
            .command("PlaceOrder", "place_order")
            .query("GetOrderCount", "get_order_count")
            .build()
            .expect("router should build");

        let mut commands: HashMap<&'static str, Arc<dyn cqrs_core::CommandHandler>> = HashMap::new();
        commands.insert("place_order", Arc::new(PlaceOrderHandler));
        let mut queries: HashMap<&'static str, Arc<dyn cqrs_core::QueryHandler>> = HashMap::new();
        queries.insert("get_order_count", Arc::new(GetOrderCount));

        Bus::new(Arc::new(router), Arc::new(Registry { commands, queries }), Arc::new(MessageRegistry::new()))
    }

    #[tokio::test]
    async fn dispatch_sync_runs_handler_and_returns_response() {
        let response = bus()
            .dispatch(DispatchContext::new(), PlaceOrder { order_id: "order-1".to_string() }, true)
            .await
            .expect("dispatch should succeed")
            .expect("sync dispatch returns a response");
        assert_eq!(response.id.as_deref(), Some("order-1"));
    }

    #[tokio::test]
    async fn dispatch_rejects_invalid_command_before_routing() {
        let result = bus().dispatch(DispatchContext::new(), PlaceOrder { order_id: String::new() }, true).await;
        assert!(matches!(result, Err(FrameworkError::Validation(_))));
    }

    #[tokio::test]
    async fn dispatch_unknown_command_fails_lookup() {
        struct Unknown;
        impl Command for Unknown {
            fn command_name(&self) -> &'static str {
                "Unknown"
            }
        }
        let result = bus().dispatch(DispatchContext::new(), Unknown, true).await;
        assert!(matches!(result, Err(FrameworkError::NoCommandHandler(_))));
    }

    #[tokio::test]
    async fn dispatch_async_without_queue_fails() {
        let result = bus().dispatch(DispatchContext::new(), PlaceOrder { order_id: "order-1".to_string() }, false).await;
        assert!(matches!(result, Err(FrameworkError::Queue(_))));
    }

    #[tokio::test]
    async fn query_fills_in_caller_supplied_result() {
        let result = bus().query(DispatchContext::new(), GetOrderCountQuery, 0_u32).await.expect("query should succeed");
        assert_eq!(result, 7);
    }

    struct RecordingQueue {
        published: StdMutex<Vec<String>>,
    }

    impl Queue for RecordingQueue {
        fn publish(&self, messages: Vec<QueueMessage>) -> BoxFuture<'_, Result<(), QueueError>> {
            Box::pin(async move {
                let mut published = self.published.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                published.extend(messages.into_iter().map(|m| m.message_type));
                Ok(())
            })
        }
        fn subscribe(&self, _handler: cqrs_core::queue::QueueHandler) -> BoxFuture<'_, Result<(), QueueError>> {
            Box::pin(async { Ok(()) })
        }
        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn encode_place_order(value: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let cmd = value.downcast_ref::<PlaceOrder>().ok_or("not a PlaceOrder")?;
        Ok(bincode::serialize(&cmd.order_id)?)
    }

    fn decode_place_order(bytes: &[u8]) -> Result<Box<dyn Any + Send + Sync>, Box<dyn std::error::Error + Send + Sync>> {
        let order_id: String = bincode::deserialize(bytes)?;
        Ok(Box::new(PlaceOrder { order_id }))
    }

    #[tokio::test]
    async fn dispatch_async_with_queue_publishes_and_returns_none() {
        let registry = Arc::new(MessageRegistry::new());
        registry.register("PlaceOrder", decode_place_order).expect("register should succeed");
        registry.register_encoder("PlaceOrder", encode_place_order).expect("register should succeed");

        let queue = Arc::new(RecordingQueue { published: StdMutex::new(Vec::new()) });
        let router = RouterBuilder::new().command("PlaceOrder", "place_order").build().expect("router should build");
        let mut commands: HashMap<&'static str, Arc<dyn cqrs_core::CommandHandler>> = HashMap::new();
        commands.insert("place_order", Arc::new(PlaceOrderHandler));
        let handlers = Arc::new(Registry { commands, queries: HashMap::new() });

        let bus = Bus::new(Arc::new(router), handlers, registry).with_queue(queue.clone());
        let response = bus.dispatch(DispatchContext::new(), PlaceOrder { order_id: "order-1".to_string() }, false).await.expect("dispatch should succeed");
        assert!(response.is_none());
        assert_eq!(*queue.published.lock().unwrap(), vec!["PlaceOrder".to_string()]);
    }

    struct Tag(&'static str, Arc<StdMutex<Vec<&'static str>>>);

    impl Middleware for Tag {
        fn name(&self) -> &'static str {
            self.0
        }
        fn call(&self, ctx: DispatchContext, payload: Payload, next: Next) -> BoxFuture<'static, MiddlewareResult> {
            self.1.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(self.0);
            next(ctx, payload)
        }
    }

    #[tokio::test]
    async fn dispatch_runs_route_middleware_outermost_first() {
        let trace = Arc::new(StdMutex::new(Vec::new()));
        let router = RouterBuilder::new()
            .use_middleware(Tag("outer", trace.clone()))
            .with(Tag("inner", trace.clone()), |b| b.command("PlaceOrder", "place_order"))
            .build()
            .expect("router should build");
        let mut commands: HashMap<&'static str, Arc<dyn cqrs_core::CommandHandler>> = HashMap::new();
        commands.insert("place_order", Arc::new(PlaceOrderHandler));
        let handlers = Arc::new(Registry { commands, queries: HashMap::new() });
        let bus = Bus::new(Arc::new(router), handlers, Arc::new(MessageRegistry::new()));

        bus.dispatch(DispatchContext::new(), PlaceOrder { order_id: "order-1".to_string() }, true).await.expect("dispatch should succeed");
        assert_eq!(*trace.lock().unwrap(), vec!["outer", "inner"]);
    }
}
