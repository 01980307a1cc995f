//! Action Pipeline
//!
//! Everything that happens to a log entry after insertion: the add
//! dispatch, resend addressing, fan-out to other connections, processor
//! invocation, and the terminal bookkeeping (`logux/processed`,
//! `logux/undo`, status changes).
//!
//! # Dispatch Flow
//!
//! 1. `logux/subscribe` / `logux/unsubscribe` go to the channel engine
//! 2. A matching processor's `resend` may widen the addressing
//! 3. Fan-out delivers the action to every other interested connection
//! 4. Actions still `waiting` are processed (or flagged unknown)
//!
//! Processor exceptions never escape: they become status `error`, a
//! `logux/undo` with reason `"error"` and an `error` event, and the
//! connection stays open.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::proxy::ProxyError;
use crate::server::client::ServerClient;
use crate::server::context::Context;
use crate::server::core::ServerCore;
use crate::server::events::ServerEvent;
use crate::server::types::{ActionCallbacks, ChannelFilter, Resend};
use crate::shared::{
    Action, ActionStatus, Meta, MetaPatch, ParsedId, SUBSCRIBE_TYPE, UNSUBSCRIBE_TYPE,
};

/// Handle one added log entry. Runs in its own task per entry.
pub(crate) async fn handle_add(core: Arc<ServerCore>, action: Action, mut meta: Meta) {
    let start = Instant::now();
    core.events.emit(ServerEvent::Add {
        action: action.clone(),
        meta: meta.clone(),
    });
    if core.is_destroying() {
        return;
    }

    match action.type_name.as_str() {
        SUBSCRIBE_TYPE => {
            if meta.server.as_deref() == Some(core.node_id.as_str()) {
                crate::server::channels::subscribe(&core, action, meta, start).await;
            }
            return;
        }
        UNSUBSCRIBE_TYPE => {
            if meta.server.as_deref() == Some(core.node_id.as_str()) {
                crate::server::channels::unsubscribe(&core, action, meta).await;
            }
            return;
        }
        _ => {}
    }

    let processor = core.types.resolve(&action.type_name);
    let origin = ParsedId::parse(&meta.id);

    // Resend runs with the status still `waiting`, so the widened
    // addressing is in place before fan-out.
    if let (Some(processor), Some(origin)) = (&processor, &origin) {
        if let Some(resend) = processor.resend.clone() {
            if meta.status == Some(ActionStatus::Waiting) {
                let ctx = core.context(&origin.node_id, meta.subprotocol.clone());
                match resend(ctx, action.clone(), meta.clone()).await {
                    Ok(extra) if !extra.is_empty() => {
                        let patch = merge_addressing(&meta, extra);
                        core.log.change_meta(&meta.id, &patch);
                        meta.apply(&patch);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        core.log
                            .change_meta(&meta.id, &MetaPatch::status(ActionStatus::Error));
                        undo(&core, &action, &meta, "error");
                        core.events.emit(ServerEvent::Error {
                            id: Some(meta.id.clone()),
                            message: error.to_string(),
                        });
                        return;
                    }
                }
            }
        }
    }

    if meta.status == Some(ActionStatus::Processed)
        && core.types.resolve_registered(&action.type_name).is_none()
        && !meta.has_addressing()
    {
        core.events.emit(ServerEvent::Useless {
            action: action.clone(),
            meta: meta.clone(),
        });
    }

    send_action(&core, &action, &meta).await;

    if meta.status == Some(ActionStatus::Waiting) {
        match processor {
            None => unknown_type(&core, &action, &meta).await,
            Some(processor) => {
                let node_id = origin
                    .map(|o| o.node_id)
                    .unwrap_or_else(|| core.node_id.clone());
                let ctx = core.context(&node_id, meta.subprotocol.clone());
                if processor.process.is_some() {
                    process_action(&core, processor, ctx, action, meta, start).await;
                } else {
                    core.events.emit(ServerEvent::Processed {
                        id: meta.id.clone(),
                        latency: Duration::ZERO,
                    });
                    mark_as_processed(&core, &meta);
                }
            }
        }
    } else {
        core.events.emit(ServerEvent::Processed {
            id: meta.id.clone(),
            latency: Duration::ZERO,
        });
    }
}

/// Run a processor's `process` callback with in-flight accounting
pub(crate) async fn process_action(
    core: &Arc<ServerCore>,
    processor: Arc<ActionCallbacks>,
    ctx: Context,
    action: Action,
    meta: Meta,
    start: Instant,
) {
    let Some(process) = processor.process.clone() else {
        return;
    };
    core.begin_processing();

    match process(ctx.clone(), action.clone(), meta.clone()).await {
        Ok(()) => {
            core.events.emit(ServerEvent::Processed {
                id: meta.id.clone(),
                latency: start.elapsed(),
            });
            mark_as_processed(core, &meta);
        }
        Err(error) => {
            core.log
                .change_meta(&meta.id, &MetaPatch::status(ActionStatus::Error));
            undo(core, &action, &meta, "error");
            core.events.emit(ServerEvent::Error {
                id: Some(meta.id.clone()),
                message: error.to_string(),
            });
            debug_frame(core, &meta.id, &format!("Error processing action: {error}"));
        }
    }

    if let Some(finally) = processor.finally.clone() {
        if let Err(error) = finally(ctx, action, meta.clone()).await {
            core.events.emit(ServerEvent::Error {
                id: Some(meta.id.clone()),
                message: error.to_string(),
            });
        }
    }

    core.end_processing();
}

/// Deliver an action to every interested connection except its origin.
///
/// Targets are the union of node, client, user and channel addressing,
/// deduplicated so a connection receives at most one copy. Channel filters
/// run lazily and at most once per subscriber per invocation.
pub(crate) async fn send_action(core: &Arc<ServerCore>, action: &Action, meta: &Meta) {
    let origin_client = ParsedId::parse(&meta.id).map(|parsed| parsed.client_id);
    let mut seen: HashSet<String> = HashSet::new();
    let mut targets: Vec<Arc<ServerClient>> = Vec::new();

    for node_id in &meta.nodes {
        if let Some(client) = core.registry.client_by_node(node_id) {
            consider(&mut seen, &mut targets, origin_client.as_deref(), client);
        }
    }
    for client_id in &meta.clients {
        if let Some(client) = core.registry.client_by_client_id(client_id) {
            consider(&mut seen, &mut targets, origin_client.as_deref(), client);
        }
    }
    for user_id in &meta.users {
        for client in core.registry.clients_by_user(user_id) {
            consider(&mut seen, &mut targets, origin_client.as_deref(), client);
        }
    }

    let mut filter_memo: HashMap<String, bool> = HashMap::new();
    for channel in &meta.channels {
        for (node_id, filter) in core.registry.channel_subscribers(channel) {
            let Some(client) = core.registry.client_by_node(&node_id) else {
                continue;
            };
            if origin_client.as_deref() == client.client_id().as_deref()
                || seen.contains(&client.key)
            {
                continue;
            }
            let pass = match filter {
                ChannelFilter::All => true,
                ChannelFilter::Custom(filter) => match filter_memo.get(&node_id) {
                    Some(verdict) => *verdict,
                    None => {
                        let ctx = core.context(&node_id, client.subprotocol());
                        let verdict = match filter(ctx, action.clone(), meta.clone()).await {
                            Ok(verdict) => verdict,
                            Err(error) => {
                                core.events.emit(ServerEvent::Error {
                                    id: Some(meta.id.clone()),
                                    message: error.to_string(),
                                });
                                false
                            }
                        };
                        filter_memo.insert(node_id.clone(), verdict);
                        verdict
                    }
                },
            };
            if pass {
                seen.insert(client.key.clone());
                targets.push(client);
            }
        }
    }

    for client in targets {
        client.send(action, meta);
    }
}

fn consider(
    seen: &mut HashSet<String>,
    targets: &mut Vec<Arc<ServerClient>>,
    origin_client: Option<&str>,
    client: Arc<ServerClient>,
) {
    if origin_client.is_some() && client.client_id().as_deref() == origin_client {
        return;
    }
    if seen.insert(client.key.clone()) {
        targets.push(client);
    }
}

/// Terminal bookkeeping for a successfully handled action: flip the status
/// and confirm to the producing client.
pub(crate) fn mark_as_processed(core: &Arc<ServerCore>, meta: &Meta) {
    if meta.status != Some(ActionStatus::Processed) {
        core.log
            .change_meta(&meta.id, &MetaPatch::status(ActionStatus::Processed));
    }
    if let Some(parsed) = ParsedId::parse(&meta.id) {
        if !parsed.is_server() {
            let confirmation = Meta {
                clients: vec![parsed.client_id],
                status: Some(ActionStatus::Processed),
                ..Meta::default()
            };
            core.log.add(Action::processed(&meta.id), confirmation);
        }
    }
}

/// Append a `logux/undo` reverting the given action on its producer
pub(crate) fn undo(core: &Arc<ServerCore>, action: &Action, meta: &Meta, reason: &str) {
    let undo_action = Action::undo(&meta.id, reason, Some(action));
    let mut undo_meta = Meta {
        status: Some(ActionStatus::Processed),
        ..Meta::default()
    };
    if let Some(parsed) = ParsedId::parse(&meta.id) {
        if !parsed.is_server() {
            undo_meta.clients.push(parsed.client_id);
        }
    }
    core.log.add(undo_action, undo_meta);
}

/// Internal handler for actions nobody registered a type for
async fn unknown_type(core: &Arc<ServerCore>, action: &Action, meta: &Meta) {
    core.log
        .change_meta(&meta.id, &MetaPatch::status(ActionStatus::Error));
    core.events.emit(ServerEvent::UnknownType {
        id: meta.id.clone(),
        type_name: action.type_name.clone(),
    });
    let Some(parsed) = ParsedId::parse(&meta.id) else {
        return;
    };
    if !parsed.is_server() {
        undo(core, action, meta, "unknownType");
    }
    debug_frame(
        core,
        &meta.id,
        &format!("Action with unknown type {}", action.type_name),
    );
}

/// Send a development debug frame to the client that produced an action
pub(crate) fn debug_frame(core: &Arc<ServerCore>, id: &str, message: &str) {
    if !core.is_development() {
        return;
    }
    let Some(parsed) = ParsedId::parse(id) else {
        return;
    };
    if let Some(client) = core.registry.client_by_client_id(&parsed.client_id) {
        client.send_debug(message);
    }
}

/// Union resend addressing into a change-meta patch
fn merge_addressing(meta: &Meta, extra: Resend) -> MetaPatch {
    fn merged(current: &[String], extra: Vec<String>) -> Option<Vec<String>> {
        if extra.is_empty() {
            return None;
        }
        let mut out = current.to_vec();
        for value in extra {
            if !out.contains(&value) {
                out.push(value);
            }
        }
        Some(out)
    }
    MetaPatch {
        nodes: merged(&meta.nodes, extra.nodes),
        clients: merged(&meta.clients, extra.clients),
        users: merged(&meta.users, extra.users),
        channels: merged(&meta.channels, extra.channels),
        ..MetaPatch::default()
    }
}

/// Map a backend verdict error onto the intake outcome, if it is one
pub(crate) fn proxy_verdict(error: &anyhow::Error) -> Option<&ProxyError> {
    error.downcast_ref::<ProxyError>()
}
