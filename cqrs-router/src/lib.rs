//! Scoped builder for routing tables and the flat, memoized tables a bus
//! resolves routes against.
//!
//! Registration happens through a tree of scopes (mirroring
//! `original_source/bus/router.go`'s flat `CommandRules`/`EventRules`/
//! `QueryRules` maps, generalized to nested middleware scoping): a
//! [`RouterBuilder`] accumulates commands, queries, events and middleware,
//! and [`RouterBuilder::build`] walks the tree once to materialize flat
//! [`MessageRouter`] tables. After that, resolution is a single hash lookup —
//! the tree only matters while building.

use cqrs_core::DispatchContext;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A type-erased command, query or event payload as it flows through a
/// middleware chain.
pub type Payload = Box<dyn Any + Send + Sync>;

/// The result a middleware or handler produces: the (possibly transformed)
/// payload, or a framework error.
pub type MiddlewareResult = Result<Payload, cqrs_core::FrameworkError>;

/// The rest of the chain, wrapped so a [`Middleware`] can call through to it.
pub type Next = Arc<dyn Fn(DispatchContext, Payload) -> BoxFuture<'static, MiddlewareResult> + Send + Sync>;

/// A single link in a route's middleware chain.
///
/// Middleware wraps the handler (and any middleware further in): it may
/// inspect or transform the payload before calling `next`, inspect or
/// transform the result after, or short-circuit without calling `next` at
/// all (e.g. a validation guard rejecting the request).
pub trait Middleware: Send + Sync {
    /// A stable name, used in logs and for ordering diagnostics.
    fn name(&self) -> &'static str;

    fn call(&self, ctx: DispatchContext, payload: Payload, next: Next) -> BoxFuture<'static, MiddlewareResult>;
}

/// Errors raised while building a [`MessageRouter`] from a [`RouterBuilder`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// The same command name was registered more than once in the tree.
    #[error("command {0} is registered more than once")]
    DuplicateCommand(&'static str),

    /// The same query name was registered more than once in the tree.
    #[error("query {0} is registered more than once")]
    DuplicateQuery(&'static str),

    /// A registration supplied an empty handler name.
    #[error("handler name cannot be empty")]
    EmptyHandlerName,
}

/// A resolved route: the handler to invoke and the middleware chain
/// (outermost first) that wraps it.
#[derive(Clone)]
pub struct RouteEntry {
    handler: &'static str,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl RouteEntry {
    #[must_use]
    pub fn handler(&self) -> &'static str {
        self.handler
    }

    #[must_use]
    pub fn middleware(&self) -> &[Arc<dyn Middleware>] {
        &self.middleware
    }
}

#[derive(Default)]
struct ScopeNode {
    middleware: Vec<Arc<dyn Middleware>>,
    commands: Vec<(&'static str, &'static str)>,
    queries: Vec<(&'static str, &'static str)>,
    events: Vec<(&'static str, &'static str)>,
    children: Vec<ScopeNode>,
}

/// Builds a [`MessageRouter`] through scoped registration calls.
///
/// `Use`/`With`/`Group` from the reference router map onto, respectively,
/// [`RouterBuilder::use_middleware`] (applies to this scope and everything
/// registered under it), [`RouterBuilder::with`] (an inline child scope
/// whose middleware doesn't leak to siblings), and [`RouterBuilder::group`]
/// (an isolated child scope with no inherited middleware of its own beyond
/// what the parent already accumulated).
#[derive(Default)]
pub struct RouterBuilder {
    node: ScopeNode,
}

impl RouterBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a 1:1 command route.
    #[must_use]
    pub fn command(mut self, name: &'static str, handler: &'static str) -> Self {
        self.node.commands.push((name, handler));
        self
    }

    /// Register a 1:1 query route.
    #[must_use]
    pub fn query(mut self, name: &'static str, handler: &'static str) -> Self {
        self.node.queries.push((name, handler));
        self
    }

    /// Register an event with the handlers that should fan out when it's
    /// published (`Event(msg).Handled(h1, h2, …)`).
    #[must_use]
    pub fn event(mut self, name: &'static str, handlers: &[&'static str]) -> Self {
        for handler in handlers {
            self.node.events.push((name, handler));
        }
        self
    }

    /// Register a handler against the events it listens to
    /// (`Handler(h).Listens(e1, e2)`) — the mirror of [`Self::event`],
    /// lowering to the same internal table.
    #[must_use]
    pub fn handler_listens(mut self, handler: &'static str, events: &[&'static str]) -> Self {
        for event in events {
            self.node.events.push((event, handler));
        }
        self
    }

    /// Apply middleware to every route registered in this scope, including
    /// routes registered later in the same scope.
    #[must_use]
    pub fn use_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.node.middleware.push(Arc::new(middleware));
        self
    }

    /// Build an inline child scope wrapped with additional middleware; the
    /// middleware applies only within `build_child`, not to siblings
    /// registered outside it.
    #[must_use]
    pub fn with(mut self, middleware: impl Middleware + 'static, build_child: impl FnOnce(Self) -> Self) -> Self {
        let mut child = Self::new();
        child.node.middleware.push(Arc::new(middleware));
        let child = build_child(child);
        self.node.children.push(child.node);
        self
    }

    /// Build an isolated child scope: its registrations compose into the
    /// final tables the same as any other scope, but it inherits no
    /// middleware of its own beyond what this scope has already
    /// accumulated.
    #[must_use]
    pub fn group(mut self, build_child: impl FnOnce(Self) -> Self) -> Self {
        let child = build_child(Self::new());
        self.node.children.push(child.node);
        self
    }

    /// Walk the scope tree once, checking the `SelfTest` invariants and
    /// materializing flat, O(1)-lookup routing tables.
    ///
    /// # Errors
    ///
    /// [`RouterError::DuplicateCommand`] / [`RouterError::DuplicateQuery`] if
    /// the same name is registered more than once anywhere in the tree, or
    /// [`RouterError::EmptyHandlerName`] if a registration names an empty
    /// handler.
    pub fn build(self) -> Result<MessageRouter, RouterError> {
        let mut commands = HashMap::new();
        let mut queries = HashMap::new();
        let mut events: HashMap<&'static str, Vec<RouteEntry>> = HashMap::new();
        walk(self.node, &[], &mut commands, &mut queries, &mut events)?;
        Ok(MessageRouter { commands, queries, events })
    }
}

fn walk(
    node: ScopeNode,
    inherited: &[Arc<dyn Middleware>],
    commands: &mut HashMap<&'static str, RouteEntry>,
    queries: &mut HashMap<&'static str, RouteEntry>,
    events: &mut HashMap<&'static str, Vec<RouteEntry>>,
) -> Result<(), RouterError> {
    let mut middleware = inherited.to_vec();
    middleware.extend(node.middleware.iter().cloned());

    for (name, handler) in &node.commands {
        if handler.is_empty() {
            return Err(RouterError::EmptyHandlerName);
        }
        if commands.contains_key(name) {
            return Err(RouterError::DuplicateCommand(name));
        }
        commands.insert(name, RouteEntry { handler, middleware: middleware.clone() });
    }

    for (name, handler) in &node.queries {
        if handler.is_empty() {
            return Err(RouterError::EmptyHandlerName);
        }
        if queries.contains_key(name) {
            return Err(RouterError::DuplicateQuery(name));
        }
        queries.insert(name, RouteEntry { handler, middleware: middleware.clone() });
    }

    for (event, handler) in &node.events {
        if handler.is_empty() {
            return Err(RouterError::EmptyHandlerName);
        }
        let handlers = events.entry(event).or_default();
        if !handlers.iter().any(|entry| entry.handler == *handler) {
            handlers.push(RouteEntry { handler, middleware: middleware.clone() });
        }
    }

    for child in node.children {
        walk(child, &middleware, commands, queries, events)?;
    }
    Ok(())
}

/// The flat, memoized routing tables resolved from a [`RouterBuilder`].
///
/// Cheap to clone-share (an `Arc<MessageRouter>` is the usual way a bus
/// holds one); resolution is a single hash lookup.
#[derive(Default)]
pub struct MessageRouter {
    commands: HashMap<&'static str, RouteEntry>,
    queries: HashMap<&'static str, RouteEntry>,
    events: HashMap<&'static str, Vec<RouteEntry>>,
}

impl MessageRouter {
    #[must_use]
    pub fn route_command(&self, name: &str) -> Option<&RouteEntry> {
        self.commands.get(name)
    }

    #[must_use]
    pub fn route_query(&self, name: &str) -> Option<&RouteEntry> {
        self.queries.get(name)
    }

    /// Every handler fanned out to for the named event; empty if none are
    /// registered (events may have 0..N handlers).
    #[must_use]
    pub fn route_event(&self, name: &str) -> &[RouteEntry] {
        self.events.get(name).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn name(&self) -> &'static str {
            self.0
        }

        fn call(&self, ctx: DispatchContext, payload: Payload, next: Next) -> BoxFuture<'static, MiddlewareResult> {
            next(ctx, payload)
        }
    }

    fn names(entries: &[Arc<dyn Middleware>]) -> Vec<&'static str> {
        entries.iter().map(|m| m.name()).collect()
    }

    #[test]
    fn routes_a_command_to_its_handler() {
        let router = RouterBuilder::new()
            .command("PlaceOrder", "place_order_handler")
            .build()
            .expect("build should succeed");

        let entry = router.route_command("PlaceOrder").expect("route should resolve");
        assert_eq!(entry.handler(), "place_order_handler");
        assert!(entry.middleware().is_empty());
    }

    #[test]
    fn duplicate_command_registration_is_rejected() {
        let err = RouterBuilder::new()
            .command("PlaceOrder", "one")
            .command("PlaceOrder", "two")
            .build()
            .unwrap_err();
        assert_eq!(err, RouterError::DuplicateCommand("PlaceOrder"));
    }

    #[test]
    fn duplicate_command_across_siblings_is_rejected() {
        let err = RouterBuilder::new()
            .group(|b| b.command("PlaceOrder", "one"))
            .group(|b| b.command("PlaceOrder", "two"))
            .build()
            .unwrap_err();
        assert_eq!(err, RouterError::DuplicateCommand("PlaceOrder"));
    }

    #[test]
    fn event_fans_out_to_multiple_handlers() {
        let router = RouterBuilder::new()
            .event("OrderPlaced", &["notify_warehouse", "notify_billing"])
            .build()
            .expect("build should succeed");

        let handlers: Vec<_> = router.route_event("OrderPlaced").iter().map(RouteEntry::handler).collect();
        assert_eq!(handlers, vec!["notify_warehouse", "notify_billing"]);
    }

    #[test]
    fn unregistered_event_has_no_handlers() {
        let router = RouterBuilder::new().build().expect("build should succeed");
        assert!(router.route_event("Nothing").is_empty());
    }

    #[test]
    fn handler_listens_is_equivalent_to_event_handled() {
        let router = RouterBuilder::new()
            .handler_listens("notify_warehouse", &["OrderPlaced", "OrderCancelled"])
            .build()
            .expect("build should succeed");

        assert_eq!(router.route_event("OrderPlaced").len(), 1);
        assert_eq!(router.route_event("OrderCancelled").len(), 1);
    }

    #[test]
    fn duplicate_event_handler_is_deduplicated_not_rejected() {
        let router = RouterBuilder::new()
            .event("OrderPlaced", &["notify_warehouse"])
            .event("OrderPlaced", &["notify_warehouse", "notify_billing"])
            .build()
            .expect("build should succeed");

        let handlers: Vec<_> = router.route_event("OrderPlaced").iter().map(RouteEntry::handler).collect();
        assert_eq!(handlers, vec!["notify_warehouse", "notify_billing"]);
    }

    #[test]
    fn outer_middleware_wraps_before_inner() {
        let router = RouterBuilder::new()
            .use_middleware(Tag("outer"))
            .with(Tag("inner"), |b| b.command("PlaceOrder", "handler"))
            .build()
            .expect("build should succeed");

        let entry = router.route_command("PlaceOrder").expect("route should resolve");
        assert_eq!(names(entry.middleware()), vec!["outer", "inner"]);
    }

    #[test]
    fn with_middleware_does_not_leak_to_siblings() {
        let router = RouterBuilder::new()
            .with(Tag("scoped"), |b| b.command("PlaceOrder", "handler"))
            .command("CancelOrder", "handler")
            .build()
            .expect("build should succeed");

        assert!(names(router.route_command("CancelOrder").expect("route should resolve").middleware()).is_empty());
        assert_eq!(names(router.route_command("PlaceOrder").expect("route should resolve").middleware()), vec!["scoped"]);
    }

    #[test]
    fn group_inherits_parent_middleware_but_adds_none_of_its_own() {
        let router = RouterBuilder::new()
            .use_middleware(Tag("outer"))
            .group(|b| b.command("PlaceOrder", "handler"))
            .build()
            .expect("build should succeed");

        let entry = router.route_command("PlaceOrder").expect("route should resolve");
        assert_eq!(names(entry.middleware()), vec!["outer"]);
    }

    #[test]
    fn empty_handler_name_is_rejected() {
        let err = RouterBuilder::new().command("PlaceOrder", "").build().unwrap_err();
        assert_eq!(err, RouterError::EmptyHandlerName);
    }
}
