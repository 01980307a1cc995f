//! Type and Channel Tables
//!
//! Registered action processors and channel definitions, with fallbacks for
//! unknown types and channels. Callbacks are boxed async closures so user
//! code stays plain `async` functions; every registration requires an
//! `access` authorizer, everything else is optional.
//!
//! Processor resolution order: exact type, first matching regular
//! expression (registration order), then the "other" fallback.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use regex::Regex;

use crate::server::context::Context;
use crate::server::pattern::{ChannelMatcher, ChannelPattern};
use crate::shared::{Action, Meta};

/// Authorizer callback: may the producer do this?
pub type AccessFn =
    Arc<dyn Fn(Context, Action, Meta) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Business-logic callback run after fan-out
pub type ProcessFn =
    Arc<dyn Fn(Context, Action, Meta) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Additional addressing computed at add time
pub type ResendFn =
    Arc<dyn Fn(Context, Action, Meta) -> BoxFuture<'static, anyhow::Result<Resend>> + Send + Sync>;

/// Cleanup callback; runs regardless of outcome
pub type FinallyFn =
    Arc<dyn Fn(Context, Action, Meta) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Per-subscriber action filter
pub type FilterFn =
    Arc<dyn Fn(Context, Action, Meta) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Builds the subscription filter during subscribe
pub type FilterFactoryFn = Arc<
    dyn Fn(Context, Action, Meta) -> BoxFuture<'static, anyhow::Result<ChannelFilter>>
        + Send
        + Sync,
>;

/// Loads the initial channel state for a new subscriber
pub type LoadFn = Arc<
    dyn Fn(Context, Action, Meta) -> BoxFuture<'static, anyhow::Result<Vec<Action>>> + Send + Sync,
>;

/// Extra fan-out addressing returned by a `resend` callback
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resend {
    /// Target node ids
    pub nodes: Vec<String>,
    /// Target client ids
    pub clients: Vec<String>,
    /// Target user ids
    pub users: Vec<String>,
    /// Target channels
    pub channels: Vec<String>,
}

impl Resend {
    /// Addressing with a single channel
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channels: vec![channel.into()],
            ..Self::default()
        }
    }

    /// Whether no addressing was returned
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.clients.is_empty()
            && self.users.is_empty()
            && self.channels.is_empty()
    }
}

/// Filter stored per subscriber: everything, or a per-action callback
#[derive(Clone)]
pub enum ChannelFilter {
    /// Deliver every action on the channel
    All,
    /// Deliver actions the callback accepts
    Custom(FilterFn),
}

/// Callbacks bound to an action type
#[derive(Clone)]
pub struct ActionCallbacks {
    /// Authorizer; required
    pub access: AccessFn,
    /// Extra addressing at add time
    pub resend: Option<ResendFn>,
    /// Business logic
    pub process: Option<ProcessFn>,
    /// Always-run cleanup
    pub finally: Option<FinallyFn>,
}

impl ActionCallbacks {
    /// Create callbacks from the required authorizer
    pub fn new<F, Fut>(access: F) -> Self
    where
        F: Fn(Context, Action, Meta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self {
            access: Arc::new(move |ctx, action, meta| Box::pin(access(ctx, action, meta))),
            resend: None,
            process: None,
            finally: None,
        }
    }

    /// Attach a resend callback
    pub fn with_resend<F, Fut>(mut self, resend: F) -> Self
    where
        F: Fn(Context, Action, Meta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resend>> + Send + 'static,
    {
        self.resend = Some(Arc::new(move |ctx, action, meta| {
            Box::pin(resend(ctx, action, meta))
        }));
        self
    }

    /// Attach a process callback
    pub fn with_process<F, Fut>(mut self, process: F) -> Self
    where
        F: Fn(Context, Action, Meta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.process = Some(Arc::new(move |ctx, action, meta| {
            Box::pin(process(ctx, action, meta))
        }));
        self
    }

    /// Attach an always-run cleanup callback
    pub fn with_finally<F, Fut>(mut self, finally: F) -> Self
    where
        F: Fn(Context, Action, Meta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.finally = Some(Arc::new(move |ctx, action, meta| {
            Box::pin(finally(ctx, action, meta))
        }));
        self
    }
}

/// Callbacks bound to a channel definition
#[derive(Clone)]
pub struct ChannelCallbacks {
    /// Authorizer; required
    pub access: AccessFn,
    /// Builds the subscription filter; `All` when absent
    pub filter: Option<FilterFactoryFn>,
    /// Loads initial state sent back to the new subscriber
    pub load: Option<LoadFn>,
    /// Always-run cleanup
    pub finally: Option<FinallyFn>,
}

impl ChannelCallbacks {
    /// Create callbacks from the required authorizer
    pub fn new<F, Fut>(access: F) -> Self
    where
        F: Fn(Context, Action, Meta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self {
            access: Arc::new(move |ctx, action, meta| Box::pin(access(ctx, action, meta))),
            filter: None,
            load: None,
            finally: None,
        }
    }

    /// Attach a filter factory
    pub fn with_filter<F, Fut>(mut self, filter: F) -> Self
    where
        F: Fn(Context, Action, Meta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ChannelFilter>> + Send + 'static,
    {
        self.filter = Some(Arc::new(move |ctx, action, meta| {
            Box::pin(filter(ctx, action, meta))
        }));
        self
    }

    /// Attach an initial-state loader
    pub fn with_load<F, Fut>(mut self, load: F) -> Self
    where
        F: Fn(Context, Action, Meta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<Action>>> + Send + 'static,
    {
        self.load = Some(Arc::new(move |ctx, action, meta| {
            Box::pin(load(ctx, action, meta))
        }));
        self
    }

    /// Attach an always-run cleanup callback
    pub fn with_finally<F, Fut>(mut self, finally: F) -> Self
    where
        F: Fn(Context, Action, Meta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.finally = Some(Arc::new(move |ctx, action, meta| {
            Box::pin(finally(ctx, action, meta))
        }));
        self
    }
}

/// Registered action processors
#[derive(Default)]
pub struct TypeRegistry {
    exact: Mutex<HashMap<String, Arc<ActionCallbacks>>>,
    regexes: Mutex<Vec<(Regex, Arc<ActionCallbacks>)>>,
    other: Mutex<Option<Arc<ActionCallbacks>>>,
}

impl TypeRegistry {
    /// Register callbacks for an exact type.
    ///
    /// Registering the same type twice is a programming error.
    pub fn register(&self, type_name: &str, callbacks: ActionCallbacks) {
        let mut exact = self.exact.lock().unwrap();
        if exact
            .insert(type_name.to_string(), Arc::new(callbacks))
            .is_some()
        {
            panic!("action type {type_name} was already registered");
        }
    }

    /// Register callbacks for every type matching a regular expression
    pub fn register_regex(&self, regex: Regex, callbacks: ActionCallbacks) {
        self.regexes
            .lock()
            .unwrap()
            .push((regex, Arc::new(callbacks)));
    }

    /// Register the fallback for unregistered types
    pub fn register_other(&self, callbacks: ActionCallbacks) {
        *self.other.lock().unwrap() = Some(Arc::new(callbacks));
    }

    /// Resolve a processor: exact, then regex in registration order, then
    /// the fallback
    pub fn resolve(&self, type_name: &str) -> Option<Arc<ActionCallbacks>> {
        self.resolve_registered(type_name)
            .or_else(|| self.other.lock().unwrap().clone())
    }

    /// Resolve without the fallback. Used for the useless-action check and
    /// the preadd processed shortcut.
    pub fn resolve_registered(&self, type_name: &str) -> Option<Arc<ActionCallbacks>> {
        if let Some(callbacks) = self.exact.lock().unwrap().get(type_name) {
            return Some(callbacks.clone());
        }
        self.regexes
            .lock()
            .unwrap()
            .iter()
            .find(|(regex, _)| regex.is_match(type_name))
            .map(|(_, callbacks)| callbacks.clone())
    }

    /// Whether any processor (including the fallback) could take this type
    pub fn covers(&self, type_name: &str) -> bool {
        self.other.lock().unwrap().is_some() || self.resolve_registered(type_name).is_some()
    }
}

/// Registered channel definitions
#[derive(Default)]
pub struct ChannelRegistry {
    matchers: Mutex<Vec<(ChannelMatcher, Arc<ChannelCallbacks>)>>,
    other: Mutex<Option<Arc<ChannelCallbacks>>>,
}

impl ChannelRegistry {
    /// Register callbacks under a `user/:id`-style pattern
    pub fn register(&self, pattern: ChannelPattern, callbacks: ChannelCallbacks) {
        self.matchers
            .lock()
            .unwrap()
            .push((ChannelMatcher::Pattern(pattern), Arc::new(callbacks)));
    }

    /// Register callbacks under a regular expression
    pub fn register_regex(&self, regex: Regex, callbacks: ChannelCallbacks) {
        self.matchers
            .lock()
            .unwrap()
            .push((ChannelMatcher::Regex(regex), Arc::new(callbacks)));
    }

    /// Register the terminal catch-all
    pub fn register_other(&self, callbacks: ChannelCallbacks) {
        *self.other.lock().unwrap() = Some(Arc::new(callbacks));
    }

    /// Resolve a channel name. First registered match wins; the catch-all
    /// matches with empty params.
    pub fn resolve(
        &self,
        channel: &str,
    ) -> Option<(Arc<ChannelCallbacks>, HashMap<String, String>)> {
        for (matcher, callbacks) in self.matchers.lock().unwrap().iter() {
            if let Some(params) = matcher.matches(channel) {
                return Some((callbacks.clone(), params));
            }
        }
        self.other
            .lock()
            .unwrap()
            .clone()
            .map(|callbacks| (callbacks, HashMap::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_all() -> ActionCallbacks {
        ActionCallbacks::new(|_, _, _| async { Ok(true) })
    }

    #[test]
    fn test_exact_beats_regex() {
        let registry = TypeRegistry::default();
        registry.register("posts/add", allow_all().with_process(|_, _, _| async { Ok(()) }));
        registry.register_regex(Regex::new("^posts/").unwrap(), allow_all());

        let resolved = registry.resolve("posts/add").unwrap();
        assert!(resolved.process.is_some());

        let resolved = registry.resolve("posts/remove").unwrap();
        assert!(resolved.process.is_none());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_double_exact_registration_panics() {
        let registry = TypeRegistry::default();
        registry.register("posts/add", allow_all());
        registry.register("posts/add", allow_all());
    }

    #[test]
    fn test_fallback_is_last() {
        let registry = TypeRegistry::default();
        assert!(registry.resolve("anything").is_none());
        assert!(!registry.covers("anything"));

        registry.register_other(allow_all());
        assert!(registry.resolve("anything").is_some());
        assert!(registry.resolve_registered("anything").is_none());
        assert!(registry.covers("anything"));
    }

    #[test]
    fn test_channel_first_match_wins() {
        let registry = ChannelRegistry::default();
        registry.register(
            ChannelPattern::parse("user/:id").unwrap(),
            ChannelCallbacks::new(|_, _, _| async { Ok(true) }),
        );
        registry.register(
            ChannelPattern::parse("user/admin").unwrap(),
            ChannelCallbacks::new(|_, _, _| async { Ok(false) }),
        );

        let (_, params) = registry.resolve("user/admin").unwrap();
        assert_eq!(params["id"], "admin");
        assert!(registry.resolve("posts").is_none());
    }
}
