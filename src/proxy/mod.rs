//! Backend Proxy Module
//!
//! When a backend URL is configured, authentication, access checks and
//! processing are delegated to it over HTTP POST. The response body is a
//! streamed JSON array of answer commands: for an action command, first an
//! access verdict (`approved`, `forbidden`, `unknownAction`,
//! `unknownChannel` or `error`), eventually followed by the terminal
//! process answer (`processed` or `error`).
//!
//! The verdict resolves the access phase inline; the terminal answer
//! completes a pending entry keyed by the action id, which the process
//! phase picks up later.

/// Command and answer shapes plus the incremental stream parser
pub mod protocol;

use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::shared::{Action, Meta};

pub use protocol::{Answer, CommandStream, ProxyError, Verdict, BACKEND_PROTOCOL_VERSION};

type PendingResult = Result<(), ProxyError>;

/// HTTP client for the configured backend
pub struct BackendProxy {
    url: String,
    secret: String,
    client: reqwest::Client,
    pending_tx: Mutex<HashMap<String, oneshot::Sender<PendingResult>>>,
    pending_rx: Mutex<HashMap<String, oneshot::Receiver<PendingResult>>>,
}

impl BackendProxy {
    /// Create a proxy for one backend URL and shared secret
    pub fn new(url: String, secret: String) -> Self {
        Self {
            url,
            secret,
            client: reqwest::Client::new(),
            pending_tx: Mutex::new(HashMap::new()),
            pending_rx: Mutex::new(HashMap::new()),
        }
    }

    async fn post(&self, command: Value) -> Result<reqwest::Response, ProxyError> {
        let body = json!({
            "version": BACKEND_PROTOCOL_VERSION,
            "secret": self.secret,
            "commands": [command],
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|error| ProxyError::Transport {
                message: error.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ProxyError::Http {
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    /// Ask the backend to authenticate a user.
    ///
    /// Resolves on the first `authenticated` or `denied` answer for this
    /// auth id; an `error` answer rejects with the extracted stack.
    pub async fn send_auth(
        &self,
        user_id: Option<&str>,
        credentials: Option<&Value>,
        auth_id: &str,
    ) -> Result<bool, ProxyError> {
        let command = json!(["auth", user_id, credentials, auth_id]);
        let response = self.post(command).await?;
        let mut stream = Box::pin(response.bytes_stream());
        let mut parser = CommandStream::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| ProxyError::Transport {
                message: error.to_string(),
            })?;
            let text = std::str::from_utf8(&chunk).map_err(|_| ProxyError::WrongAnswer)?;
            for command in parser.push(text)? {
                match Answer::parse(&command)? {
                    Answer::Authenticated(id) if id == auth_id => return Ok(true),
                    Answer::Denied(id) if id == auth_id => return Ok(false),
                    Answer::Error(stack) => return Err(ProxyError::Backend { stack }),
                    _ => {}
                }
            }
        }
        Err(ProxyError::WrongAnswer)
    }

    /// Send an action for access checking and processing.
    ///
    /// Returns the access verdict as soon as it arrives; for approved
    /// actions a background task keeps draining the stream until the
    /// terminal answer completes the pending entry for `meta.id`.
    pub async fn send_action(&self, action: &Action, meta: &Meta) -> Result<Verdict, ProxyError> {
        let id = meta.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending_tx.lock().unwrap().insert(id.clone(), tx);
        self.pending_rx.lock().unwrap().insert(id.clone(), rx);

        let command = json!(["action", action, meta]);
        let response = match self.post(command).await {
            Ok(response) => response,
            Err(error) => {
                self.forget(&id);
                return Err(error);
            }
        };
        let mut stream = Box::pin(response.bytes_stream());
        let mut parser = CommandStream::new();
        let mut verdict: Option<Verdict> = None;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    self.forget(&id);
                    return Err(ProxyError::Transport {
                        message: error.to_string(),
                    });
                }
            };
            let Ok(text) = std::str::from_utf8(&chunk) else {
                self.forget(&id);
                return Err(ProxyError::WrongAnswer);
            };
            let commands = match parser.push(text) {
                Ok(commands) => commands,
                Err(error) => {
                    self.forget(&id);
                    return Err(error);
                }
            };
            for command in commands {
                match Answer::parse(&command) {
                    Ok(Answer::Approved(aid)) if aid == id => verdict = Some(Verdict::Approved),
                    Ok(Answer::Forbidden(aid)) if aid == id => verdict = Some(Verdict::Forbidden),
                    Ok(Answer::UnknownAction(aid)) if aid == id => {
                        verdict = Some(Verdict::UnknownAction);
                    }
                    Ok(Answer::UnknownChannel(aid)) if aid == id => {
                        verdict = Some(Verdict::UnknownChannel);
                    }
                    Ok(Answer::Processed(aid)) if aid == id => {
                        self.complete(&id, Ok(()));
                    }
                    Ok(Answer::Error(stack)) => {
                        self.complete(&id, Err(ProxyError::Backend { stack: stack.clone() }));
                        self.forget(&id);
                        return Err(ProxyError::Backend { stack });
                    }
                    Ok(_) => {}
                    Err(error) => {
                        self.forget(&id);
                        return Err(error);
                    }
                }
            }
            if let Some(verdict) = verdict {
                if verdict == Verdict::Approved {
                    self.drain(stream, parser, id);
                } else {
                    self.forget(&id);
                }
                return Ok(verdict);
            }
        }

        self.forget(&id);
        Err(ProxyError::WrongAnswer)
    }

    /// Wait for the terminal process answer of an approved action
    pub async fn wait_processed(&self, id: &str) -> Result<(), ProxyError> {
        let receiver = self.pending_rx.lock().unwrap().remove(id);
        let Some(receiver) = receiver else {
            return Err(ProxyError::WrongAnswer);
        };
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::WrongAnswer),
        }
    }

    /// Keep reading the stream after the verdict, completing the pending
    /// entry when the terminal answer arrives
    fn drain(
        &self,
        mut stream: std::pin::Pin<
            Box<dyn futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>,
        >,
        mut parser: CommandStream,
        id: String,
    ) {
        let pending = self.take_sender(&id);
        tokio::spawn(async move {
            let mut pending = pending;
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                let Ok(text) = std::str::from_utf8(&chunk) else { break };
                let Ok(commands) = parser.push(text) else { break };
                for command in commands {
                    match Answer::parse(&command) {
                        Ok(Answer::Processed(aid)) if aid == id => {
                            if let Some(tx) = pending.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        Ok(Answer::Error(stack)) => {
                            if let Some(tx) = pending.take() {
                                let _ = tx.send(Err(ProxyError::Backend { stack }));
                            }
                        }
                        _ => {}
                    }
                }
            }
            if let Some(tx) = pending.take() {
                let _ = tx.send(Err(ProxyError::WrongAnswer));
            }
        });
    }

    fn take_sender(&self, id: &str) -> Option<oneshot::Sender<PendingResult>> {
        self.pending_tx.lock().unwrap().remove(id)
    }

    fn complete(&self, id: &str, result: PendingResult) {
        if let Some(tx) = self.take_sender(id) {
            let _ = tx.send(result);
        }
    }

    fn forget(&self, id: &str) {
        self.pending_tx.lock().unwrap().remove(id);
        self.pending_rx.lock().unwrap().remove(id);
    }
}
