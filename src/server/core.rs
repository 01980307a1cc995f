//! Server Core
//!
//! Construction and wiring of the server node: option validation, the log
//! with its preadd hook, the dispatcher task that serializes log events,
//! processor/channel registration, connection intake, the backend proxy
//! hookup, and graceful destruction.
//!
//! # Initialization Steps
//!
//! 1. Validate options (fatal on anything invalid)
//! 2. Build the log over the configured store and clock
//! 3. Install the preadd hook stamping `server`, `status`, `subprotocol`
//! 4. Spawn the dispatcher task feeding the action pipeline
//! 5. When a backend is configured, register it as authenticator and as
//!    the fallback for unknown types and channels

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use ipnet::IpNet;
use regex::Regex;
use semver::{Version, VersionReq};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::log::{Log, LogEvent, MemoryStore, SystemTime};
use crate::proxy::{BackendProxy, ProxyError, Verdict};
use crate::server::client::ServerClient;
use crate::server::context::Context;
use crate::server::events::{EventBus, ServerEvent};
use crate::server::options::{Env, OptionsError, ServerOptions, TlsMaterial};
use crate::server::pattern::ChannelPattern;
use crate::server::peer::{PeerEventReceiver, SyncPeer};
use crate::server::pipeline;
use crate::server::state::Registry;
use crate::server::types::{
    ActionCallbacks, ChannelCallbacks, ChannelRegistry, TypeRegistry,
};
use crate::shared::{Action, Meta, ParsedId, ProcessError};

/// Handshake data handed to the authenticator
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// User id parsed from the node id, when present
    pub user_id: Option<String>,
    /// Credentials from the handshake frame
    pub credentials: Option<Value>,
    /// Transport headers
    pub headers: Map<String, Value>,
    /// Full remote node id
    pub node_id: String,
    /// Remote address
    pub remote_ip: IpAddr,
}

/// Authenticator callback
pub type AuthenticatorFn =
    Arc<dyn Fn(AuthRequest) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Builds sync peers out of accepted transport streams.
///
/// The wire codec lives outside this crate; installations plug it in here.
pub trait PeerAcceptor: Send + Sync {
    /// Wrap one accepted stream. Returning `None` drops the connection.
    fn accept(
        &self,
        stream: tokio::net::TcpStream,
        remote: SocketAddr,
    ) -> Option<(Arc<dyn SyncPeer>, PeerEventReceiver)>;
}

/// Unrecoverable startup error; the process should exit with code 1
#[derive(Debug, Error)]
pub enum FatalError {
    /// A listener could not be bound
    #[error("Cannot bind {address} ({kind})")]
    Bind {
        /// The address that failed
        address: String,
        /// Stable error kind: `EADDRINUSE`, `EACCES` or `EIO`
        kind: &'static str,
    },

    /// `listen` was called with no way to authenticate anybody
    #[error("No authenticator was registered and no backend is configured")]
    NoAuthenticator,
}

/// Addresses a listening server is bound to
#[derive(Debug, Clone, Copy)]
pub struct ListenInfo {
    /// Main sync listener
    pub addr: SocketAddr,
    /// Control endpoint
    pub control: SocketAddr,
}

/// Shared state behind a [`Server`]
pub struct ServerCore {
    /// This server's node id (`server:<rand>`)
    pub node_id: String,
    /// The action log
    pub log: Log,
    /// Connection, identity and subscription indexes
    pub registry: Registry,
    /// Registered action processors
    pub types: Arc<TypeRegistry>,
    /// Registered channel definitions
    pub channels: ChannelRegistry,
    /// Event bus and report stream
    pub events: EventBus,
    /// Runtime environment
    pub env: Env,

    pub(crate) subprotocol: Option<Version>,
    pub(crate) supports: Option<VersionReq>,
    pub(crate) control_mask: IpNet,
    pub(crate) control_secret: Option<String>,
    pub(crate) tls: Option<TlsMaterial>,
    pub(crate) timeout: Duration,
    pub(crate) ping: Duration,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) control_host: String,
    pub(crate) control_port: u16,
    pub(crate) backend: Option<String>,

    authenticator: Mutex<Option<AuthenticatorFn>>,
    peer_acceptor: Mutex<Option<Arc<dyn PeerAcceptor>>>,
    listener: Mutex<Option<std::net::TcpListener>>,
    destroying: AtomicBool,
    processing: AtomicUsize,
    processing_done: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerCore {
    /// Per-action context for callbacks
    pub(crate) fn context(self: &Arc<Self>, node_id: &str, subprotocol: Option<String>) -> Context {
        Context::new(self.clone(), node_id, subprotocol, HashMap::new())
    }

    /// Context with channel matcher params
    pub(crate) fn context_with_params(
        self: &Arc<Self>,
        node_id: &str,
        subprotocol: Option<String>,
        params: HashMap<String, String>,
    ) -> Context {
        Context::new(self.clone(), node_id, subprotocol, params)
    }

    pub(crate) fn authenticator(&self) -> Option<AuthenticatorFn> {
        self.authenticator.lock().unwrap().clone()
    }

    pub(crate) fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::SeqCst)
    }

    /// Whether debug frames may go out
    pub fn is_development(&self) -> bool {
        self.env == Env::Development
    }

    /// Connection silence timeout, for sync peer construction
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ping interval, for sync peer construction
    pub fn ping(&self) -> Duration {
        self.ping
    }

    /// Resolved TLS material for the wire listener, when configured
    pub fn tls(&self) -> Option<&TlsMaterial> {
        self.tls.as_ref()
    }

    /// Configured backend URL, when the server runs in proxy mode
    pub fn backend_url(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    pub(crate) fn begin_processing(&self) {
        self.processing.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_processing(&self) {
        if self.processing.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.processing_done.notify_one();
        }
    }

    fn peer_acceptor(&self) -> Option<Arc<dyn PeerAcceptor>> {
        self.peer_acceptor.lock().unwrap().clone()
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    /// Register one accepted connection and start driving its events
    pub(crate) fn attach(
        core: &Arc<Self>,
        peer: Arc<dyn SyncPeer>,
        events: PeerEventReceiver,
        remote_ip: IpAddr,
    ) -> Arc<ServerClient> {
        let client = ServerClient::new(core.clone(), peer, remote_ip);
        core.registry.add_connected(client.clone());
        core.events.emit(ServerEvent::Connected {
            client_key: client.key.clone(),
        });
        client.clone().spawn(events);
        client
    }
}

/// The server node
pub struct Server {
    core: Arc<ServerCore>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("node_id", &self.core.node_id)
            .finish()
    }
}

impl Server {
    /// Build a server from options.
    ///
    /// Invalid options are fatal; a configured backend without a control
    /// secret is refused here (`LOGUX_NO_CONTROL_SECRET`).
    pub fn new(mut options: ServerOptions) -> Result<Self, OptionsError> {
        let parsed = options.validate()?;
        let env = options.env.unwrap_or_else(Env::from_env);
        let suffix = options
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());
        let node_id = format!("server:{suffix}");

        let store = options
            .store
            .take()
            .unwrap_or_else(|| Box::new(MemoryStore::new()));
        let time = options.time.take().unwrap_or_else(|| Box::new(SystemTime));
        let (log, log_events) = Log::new(store, time, node_id.clone());

        let types = Arc::new(TypeRegistry::default());
        let proxy = match (&options.backend, &options.control_secret) {
            (Some(url), Some(secret)) => {
                Some(Arc::new(BackendProxy::new(url.clone(), secret.clone())))
            }
            _ => None,
        };

        let core = Arc::new(ServerCore {
            node_id: node_id.clone(),
            log,
            registry: Registry::default(),
            types: types.clone(),
            channels: ChannelRegistry::default(),
            events: EventBus::default(),
            env,
            subprotocol: parsed.subprotocol,
            supports: parsed.supports,
            control_mask: parsed.control_mask,
            control_secret: options.control_secret.clone(),
            tls: parsed.tls,
            timeout: options.timeout,
            ping: options.ping,
            host: options.host.clone(),
            port: options.port,
            control_host: options.control_host.clone(),
            control_port: options.control_port,
            backend: options.backend.clone(),
            authenticator: Mutex::new(None),
            peer_acceptor: Mutex::new(None),
            listener: Mutex::new(options.listener.take()),
            destroying: AtomicBool::new(false),
            processing: AtomicUsize::new(0),
            processing_done: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let hook_node = node_id;
        let hook_types = types;
        let hook_subprotocol = core.subprotocol.as_ref().map(|v| v.to_string());
        core.log.set_preadd(Box::new(move |action, meta| {
            meta.normalize_addressing();
            if meta.server.is_none() {
                meta.server = Some(hook_node.clone());
            }
            let status_was_absent = meta.status.is_none();
            if status_was_absent && !action.is_control() {
                meta.status = Some(crate::shared::ActionStatus::Waiting);
            }
            if let Some(origin) = ParsedId::parse(&meta.id) {
                if origin.node_id == hook_node {
                    if meta.subprotocol.is_none() {
                        meta.subprotocol = hook_subprotocol.clone();
                    }
                    // Nothing will ever pick the action up, so skip the
                    // processing stage entirely.
                    if status_was_absent
                        && !action.is_control()
                        && !hook_types.covers(&action.type_name)
                    {
                        meta.status = Some(crate::shared::ActionStatus::Processed);
                    }
                }
            }
        }));

        let dispatcher_core = core.clone();
        let mut log_events = log_events;
        core.track(tokio::spawn(async move {
            while let Some(event) = log_events.recv().await {
                match event {
                    LogEvent::Add { action, meta } => {
                        tokio::spawn(pipeline::handle_add(
                            dispatcher_core.clone(),
                            action,
                            meta,
                        ));
                    }
                    LogEvent::Clean { action, meta } => {
                        dispatcher_core
                            .events
                            .emit(ServerEvent::Clean { action, meta });
                    }
                }
            }
        }));

        let server = Self { core };
        if let Some(proxy) = proxy {
            server.wire_backend(proxy);
        }
        Ok(server)
    }

    /// Delegate authentication, unknown types and unknown channels to the
    /// configured HTTP backend
    fn wire_backend(&self, proxy: Arc<BackendProxy>) {
        let auth_proxy = proxy.clone();
        self.auth(move |request: AuthRequest| {
            let proxy = auth_proxy.clone();
            async move {
                let auth_id = uuid::Uuid::new_v4().to_string();
                proxy
                    .send_auth(
                        request.user_id.as_deref(),
                        request.credentials.as_ref(),
                        &auth_id,
                    )
                    .await
                    .map_err(Into::into)
            }
        });

        let access_proxy = proxy.clone();
        let process_proxy = proxy.clone();
        self.other_type(
            ActionCallbacks::new(move |_ctx, action, meta| {
                let proxy = access_proxy.clone();
                async move {
                    match proxy.send_action(&action, &meta).await? {
                        Verdict::Approved => Ok(true),
                        Verdict::Forbidden => Ok(false),
                        Verdict::UnknownAction => Err(ProxyError::UnknownAction.into()),
                        Verdict::UnknownChannel => Err(ProxyError::UnknownChannel.into()),
                    }
                }
            })
            .with_process(move |_ctx, _action, meta| {
                let proxy = process_proxy.clone();
                async move { proxy.wait_processed(&meta.id).await.map_err(Into::into) }
            }),
        );

        let channel_proxy = proxy.clone();
        let channel_wait = proxy;
        self.other_channel(
            ChannelCallbacks::new(move |_ctx, action, meta| {
                let proxy = channel_proxy.clone();
                async move {
                    match proxy.send_action(&action, &meta).await? {
                        Verdict::Approved => Ok(true),
                        Verdict::Forbidden => Ok(false),
                        Verdict::UnknownAction => Err(ProxyError::UnknownAction.into()),
                        Verdict::UnknownChannel => Err(ProxyError::UnknownChannel.into()),
                    }
                }
            })
            .with_load(move |_ctx, _action, meta| {
                let proxy = channel_wait.clone();
                async move {
                    proxy.wait_processed(&meta.id).await?;
                    Ok(Vec::new())
                }
            }),
        );
    }

    /// Register the authenticator
    pub fn auth<F, Fut>(&self, authenticator: F)
    where
        F: Fn(AuthRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        *self.core.authenticator.lock().unwrap() =
            Some(Arc::new(move |request| Box::pin(authenticator(request))));
    }

    /// Register callbacks for an exact action type.
    ///
    /// Registering the same type twice is a programming error and panics.
    pub fn add_type(&self, type_name: &str, callbacks: ActionCallbacks) {
        self.core.types.register(type_name, callbacks);
    }

    /// Register callbacks for every action type matching a regex
    pub fn add_regex_type(&self, regex: Regex, callbacks: ActionCallbacks) {
        self.core.types.register_regex(regex, callbacks);
    }

    /// Register the fallback for unregistered action types
    pub fn other_type(&self, callbacks: ActionCallbacks) {
        self.core.types.register_other(callbacks);
    }

    /// Register a channel under a `user/:id`-style pattern
    pub fn channel(&self, pattern: &str, callbacks: ChannelCallbacks) -> Result<(), OptionsError> {
        let parsed =
            ChannelPattern::parse(pattern).ok_or_else(|| OptionsError::BadChannelPattern {
                pattern: pattern.to_string(),
            })?;
        self.core.channels.register(parsed, callbacks);
        Ok(())
    }

    /// Register a channel under a regular expression
    pub fn channel_regex(&self, regex: Regex, callbacks: ChannelCallbacks) {
        self.core.channels.register_regex(regex, callbacks);
    }

    /// Register the terminal catch-all channel
    pub fn other_channel(&self, callbacks: ChannelCallbacks) {
        self.core.channels.register_other(callbacks);
    }

    /// Install the wire adapter used by `listen`
    pub fn set_peer_acceptor(&self, acceptor: Arc<dyn PeerAcceptor>) {
        *self.core.peer_acceptor.lock().unwrap() = Some(acceptor);
    }

    /// Hand the server one already-established peer.
    ///
    /// This is the intake `listen` uses internally; embedded setups and
    /// tests call it directly.
    pub fn add_connection(
        &self,
        peer: Arc<dyn SyncPeer>,
        events: PeerEventReceiver,
        remote_ip: IpAddr,
    ) -> Arc<ServerClient> {
        ServerCore::attach(&self.core, peer, events, remote_ip)
    }

    /// Bind the main and control listeners and start accepting.
    ///
    /// Returns as soon as both listeners are up; accepting runs in
    /// background tasks until `destroy`.
    pub async fn listen(&self) -> Result<ListenInfo, FatalError> {
        if self.core.authenticator().is_none() {
            return Err(FatalError::NoAuthenticator);
        }

        let control_address = format!("{}:{}", self.core.control_host, self.core.control_port);
        let control_listener = tokio::net::TcpListener::bind(&control_address)
            .await
            .map_err(|error| bind_error(control_address, &error))?;
        let control_addr = control_listener
            .local_addr()
            .map_err(|error| bind_error("control".into(), &error))?;
        let router = crate::control::router(self.core.clone());
        self.core.track(tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(error) = axum::serve(control_listener, service).await {
                tracing::error!("[Control] Server stopped: {}", error);
            }
        }));

        let injected = self.core.listener.lock().unwrap().take();
        let listener = match injected {
            Some(std_listener) => {
                std_listener
                    .set_nonblocking(true)
                    .map_err(|error| bind_error("injected listener".into(), &error))?;
                tokio::net::TcpListener::from_std(std_listener)
                    .map_err(|error| bind_error("injected listener".into(), &error))?
            }
            None => {
                let address = format!("{}:{}", self.core.host, self.core.port);
                tokio::net::TcpListener::bind(&address)
                    .await
                    .map_err(|error| bind_error(address, &error))?
            }
        };
        let addr = listener
            .local_addr()
            .map_err(|error| bind_error("listener".into(), &error))?;

        let accept_core = self.core.clone();
        self.core.track(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let Some(acceptor) = accept_core.peer_acceptor() else {
                            tracing::warn!(
                                "[Server] No wire adapter installed; dropping connection from {}",
                                remote
                            );
                            continue;
                        };
                        if let Some((peer, events)) = acceptor.accept(stream, remote) {
                            ServerCore::attach(&accept_core, peer, events, remote.ip());
                        }
                    }
                    Err(error) => {
                        tracing::error!("[Server] Accept failed: {}", error);
                    }
                }
            }
        }));

        tracing::info!("[Server] Listening on {} (control on {})", addr, control_addr);
        Ok(ListenInfo {
            addr,
            control: control_addr,
        })
    }

    /// Add an action and wait for its terminal outcome.
    ///
    /// Resolves with the stored meta once the matching `processed` event
    /// fires; rejects when a matching `error` fires first.
    pub async fn process(&self, action: Action, meta: Meta) -> Result<Meta, ProcessError> {
        let mut events = self.core.events.subscribe();
        let Some(stored) = self.core.log.add(action, meta) else {
            return Err(ProcessError::Duplicate);
        };
        loop {
            match events.recv().await {
                Ok(ServerEvent::Processed { id, .. }) if id == stored.id => {
                    return Ok(stored);
                }
                Ok(ServerEvent::Error {
                    id: Some(id),
                    message,
                }) if id == stored.id => {
                    return Err(ProcessError::Failed { message });
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("[Server] Event receiver lagged, skipped {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ProcessError::Destroyed);
                }
            }
        }
    }

    /// Shut down: stop accepting, disconnect every client, and resolve
    /// once all in-flight `process` callbacks have settled
    pub async fn destroy(&self) {
        self.core.destroying.store(true, Ordering::SeqCst);
        for task in self.core.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for client in self.core.registry.connected() {
            client.destroy();
        }
        loop {
            if self.core.processing.load(Ordering::SeqCst) == 0 {
                break;
            }
            self.core.processing_done.notified().await;
        }
    }

    /// This server's node id
    pub fn node_id(&self) -> &str {
        &self.core.node_id
    }

    /// The action log
    pub fn log(&self) -> &Log {
        &self.core.log
    }

    /// The event bus
    pub fn events(&self) -> &EventBus {
        &self.core.events
    }

    /// Connection and subscription indexes
    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    /// Subscribe to the report stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.core.events.subscribe()
    }
}

fn bind_error(address: String, error: &std::io::Error) -> FatalError {
    let kind = match error.kind() {
        std::io::ErrorKind::AddrInUse => "EADDRINUSE",
        std::io::ErrorKind::PermissionDenied => "EACCES",
        _ => "EIO",
    };
    FatalError::Bind { address, kind }
}
