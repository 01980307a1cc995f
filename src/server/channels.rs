//! Channel Engine
//!
//! Handles `logux/subscribe` and `logux/unsubscribe` once they reach the
//! add dispatch: matcher scan, access check, filter creation, initial
//! load, and subscriber-set maintenance.
//!
//! The sequence for a subscribe is access → filter → load → confirm, with
//! `finally` always running at the end, and a rollback of the subscriber
//! entry when a later step fails after registration.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::proxy::ProxyError;
use crate::server::core::ServerCore;
use crate::server::events::ServerEvent;
use crate::server::pipeline::{debug_frame, mark_as_processed, proxy_verdict, undo};
use crate::server::types::ChannelFilter;
use crate::shared::{Action, Meta, ParsedId};

/// Signal an explicitly wrong channel from inside a channel `access`
/// callback: return `Err(WrongChannel.into())`.
#[derive(Debug, Error)]
#[error("wrong channel")]
pub struct WrongChannel;

/// Handle a `logux/subscribe` request
pub(crate) async fn subscribe(core: &Arc<ServerCore>, action: Action, meta: Meta, start: Instant) {
    let Some(channel) = action.channel().map(str::to_string) else {
        wrong_channel(core, &action, &meta);
        return;
    };
    let Some((callbacks, params)) = core.channels.resolve(&channel) else {
        wrong_channel(core, &action, &meta);
        return;
    };
    let Some(origin) = ParsedId::parse(&meta.id) else {
        return;
    };
    let ctx = core.context_with_params(&origin.node_id, meta.subprotocol.clone(), params);

    match (callbacks.access)(ctx.clone(), action.clone(), meta.clone()).await {
        Err(error) => {
            subscribe_failed(core, &action, &meta, &channel, &origin.node_id, false, error);
        }
        Ok(false) => deny_action(core, &action, &meta),
        Ok(true) => {
            // The authorizing client may have disconnected while access ran.
            if core.registry.client_by_node(&origin.node_id).is_none() {
                core.events.emit(ServerEvent::SubscriptionCancelled {
                    channel: channel.clone(),
                    node_id: origin.node_id.clone(),
                });
            } else {
                let filter = match callbacks.filter.clone() {
                    None => Ok(ChannelFilter::All),
                    Some(factory) => factory(ctx.clone(), action.clone(), meta.clone()).await,
                };
                match filter {
                    Err(error) => {
                        subscribe_failed(
                            core,
                            &action,
                            &meta,
                            &channel,
                            &origin.node_id,
                            false,
                            error,
                        );
                    }
                    Ok(filter) => {
                        let first_subscriber =
                            core.registry.set_subscriber(&channel, &origin.node_id, filter);
                        if first_subscriber {
                            core.events.emit(ServerEvent::Subscribing {
                                channel: channel.clone(),
                                node_id: origin.node_id.clone(),
                            });
                        }

                        let mut load_error = None;
                        if let Some(load) = callbacks.load.clone() {
                            match load(ctx.clone(), action.clone(), meta.clone()).await {
                                Ok(initial) => {
                                    for initial_action in initial {
                                        ctx.send_back(initial_action);
                                    }
                                }
                                Err(error) => load_error = Some(error),
                            }
                        }

                        match load_error {
                            Some(error) => {
                                subscribe_failed(
                                    core,
                                    &action,
                                    &meta,
                                    &channel,
                                    &origin.node_id,
                                    true,
                                    error,
                                );
                            }
                            None => {
                                core.events.emit(ServerEvent::Subscribed {
                                    channel: channel.clone(),
                                    node_id: origin.node_id.clone(),
                                    latency: start.elapsed(),
                                });
                                core.events.emit(ServerEvent::Processed {
                                    id: meta.id.clone(),
                                    latency: start.elapsed(),
                                });
                                mark_as_processed(core, &meta);
                            }
                        }
                    }
                }
            }
        }
    }

    if let Some(finally) = callbacks.finally.clone() {
        if let Err(error) = finally(ctx, action, meta.clone()).await {
            core.events.emit(ServerEvent::Error {
                id: Some(meta.id),
                message: error.to_string(),
            });
        }
    }
}

/// Handle a `logux/unsubscribe` request
pub(crate) async fn unsubscribe(core: &Arc<ServerCore>, action: Action, meta: Meta) {
    let Some(channel) = action.channel().map(str::to_string) else {
        wrong_channel(core, &action, &meta);
        return;
    };
    let Some(origin) = ParsedId::parse(&meta.id) else {
        return;
    };
    core.registry.remove_subscriber(&channel, &origin.node_id);
    core.events.emit(ServerEvent::Unsubscribed {
        channel,
        node_id: origin.node_id,
    });
    core.events.emit(ServerEvent::Processed {
        id: meta.id.clone(),
        latency: std::time::Duration::ZERO,
    });
    mark_as_processed(core, &meta);
}

/// A subscribe step threw: sort explicit wrong-channel signals from real
/// errors, report, and roll back the subscriber entry when it was already
/// registered
fn subscribe_failed(
    core: &Arc<ServerCore>,
    action: &Action,
    meta: &Meta,
    channel: &str,
    node_id: &str,
    registered: bool,
    error: anyhow::Error,
) {
    let explicit_wrong_channel = error.downcast_ref::<WrongChannel>().is_some()
        || matches!(proxy_verdict(&error), Some(ProxyError::UnknownChannel));
    if explicit_wrong_channel {
        wrong_channel(core, action, meta);
        return;
    }

    core.events.emit(ServerEvent::Error {
        id: Some(meta.id.clone()),
        message: error.to_string(),
    });
    undo(core, action, meta, "error");
    debug_frame(core, &meta.id, &format!("Error subscribing: {error}"));
    if registered && core.registry.remove_subscriber(channel, node_id) {
        core.events.emit(ServerEvent::Unsubscribed {
            channel: channel.to_string(),
            node_id: node_id.to_string(),
        });
    }
}

/// An authorizer said no: report, revert on the producer, never an error
pub(crate) fn deny_action(core: &Arc<ServerCore>, action: &Action, meta: &Meta) {
    core.events.emit(ServerEvent::Denied {
        id: meta.id.clone(),
    });
    undo(core, action, meta, "denied");
    debug_frame(core, &meta.id, "Action was denied");
}

/// The channel was missing, not a string, or matched by nobody
pub(crate) fn wrong_channel(core: &Arc<ServerCore>, action: &Action, meta: &Meta) {
    core.events.emit(ServerEvent::WrongChannel {
        id: meta.id.clone(),
        channel: action.channel().map(str::to_string),
    });
    undo(core, action, meta, "wrongChannel");
    debug_frame(
        core,
        &meta.id,
        &format!(
            "Wrong channel name {}",
            action.channel().unwrap_or("<not a string>")
        ),
    );
}
