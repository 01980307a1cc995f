//! Backend Command Protocol
//!
//! The server talks to its HTTP backend with JSON bodies of the shape
//! `{version, secret, commands: [...]}`; the backend answers with a JSON
//! array of commands streamed over the response body. Answers are parsed
//! incrementally, command by command, as chunks arrive; the distinction
//! between access verdicts and terminal process answers is encoded in the
//! command name.

use serde_json::Value;
use thiserror::Error;

/// Version of the command protocol spoken with the backend
pub const BACKEND_PROTOCOL_VERSION: u32 = 4;

/// Backend transport and protocol failures
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Non-2xx response
    #[error("Backend responded with HTTP {status}")]
    Http {
        /// Response status code
        status: u16,
    },

    /// The body was not a well-formed command stream
    #[error("Backend wrong answer")]
    WrongAnswer,

    /// The backend reported an error with a stack
    #[error("Backend error: {stack}")]
    Backend {
        /// Stack or message extracted from the answer
        stack: String,
    },

    /// The backend does not know this action type
    #[error("Action type is unknown to the backend")]
    UnknownAction,

    /// The backend does not know this channel
    #[error("Channel is unknown to the backend")]
    UnknownChannel,

    /// The HTTP request itself failed
    #[error("Backend request failed: {message}")]
    Transport {
        /// Underlying error detail
        message: String,
    },
}

/// Access-phase verdict for an action command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The backend authorizes the action
    Approved,
    /// The backend denies the action
    Forbidden,
    /// The backend has no handler for this action type
    UnknownAction,
    /// The backend has no handler for this channel
    UnknownChannel,
}

/// One parsed backend answer
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// Auth command resolved positively
    Authenticated(String),
    /// Auth command resolved negatively
    Denied(String),
    /// Access verdict: authorized
    Approved(String),
    /// Access verdict: denied
    Forbidden(String),
    /// Access verdict: no handler for the type
    UnknownAction(String),
    /// Access verdict: no handler for the channel
    UnknownChannel(String),
    /// Process phase finished
    Processed(String),
    /// The backend failed; carries the extracted stack
    Error(String),
}

impl Answer {
    /// Parse one answer command
    pub fn parse(value: &Value) -> Result<Self, ProxyError> {
        let parts = value.as_array().ok_or(ProxyError::WrongAnswer)?;
        let name = parts
            .first()
            .and_then(Value::as_str)
            .ok_or(ProxyError::WrongAnswer)?;
        let argument = parts
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match name {
            "authenticated" => Ok(Self::Authenticated(argument)),
            "denied" => Ok(Self::Denied(argument)),
            "approved" => Ok(Self::Approved(argument)),
            "forbidden" => Ok(Self::Forbidden(argument)),
            "unknownAction" => Ok(Self::UnknownAction(argument)),
            "unknownChannel" => Ok(Self::UnknownChannel(argument)),
            "processed" => Ok(Self::Processed(argument)),
            "error" => Ok(Self::Error(argument)),
            _ => Err(ProxyError::WrongAnswer),
        }
    }
}

/// Incremental parser over a streamed JSON array of commands.
///
/// Chunks are buffered; every `push` yields the commands that became
/// complete. Separating commas and the closing bracket are consumed as
/// they appear, so chunk boundaries may fall anywhere.
#[derive(Default)]
pub struct CommandStream {
    buffer: String,
    started: bool,
    finished: bool,
}

impl CommandStream {
    /// Create an empty parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one body chunk, returning the newly complete commands
    pub fn push(&mut self, chunk: &str) -> Result<Vec<Value>, ProxyError> {
        if self.finished {
            return if chunk.trim().is_empty() {
                Ok(Vec::new())
            } else {
                Err(ProxyError::WrongAnswer)
            };
        }
        self.buffer.push_str(chunk);
        let mut complete = Vec::new();

        loop {
            let trimmed = self
                .buffer
                .trim_start_matches(|c: char| c.is_whitespace() || c == ',');
            let offset = self.buffer.len() - trimmed.len();
            if offset > 0 {
                self.buffer.drain(..offset);
            }

            if !self.started {
                if self.buffer.is_empty() {
                    break;
                }
                if !self.buffer.starts_with('[') {
                    return Err(ProxyError::WrongAnswer);
                }
                self.buffer.drain(..1);
                self.started = true;
                continue;
            }

            if self.buffer.is_empty() {
                break;
            }
            if self.buffer.starts_with(']') {
                self.finished = true;
                self.buffer.clear();
                break;
            }

            let mut values = serde_json::Deserializer::from_str(&self.buffer).into_iter::<Value>();
            match values.next() {
                Some(Ok(value)) => {
                    let consumed = values.byte_offset();
                    self.buffer.drain(..consumed);
                    complete.push(value);
                }
                Some(Err(error)) if error.is_eof() => break,
                _ => return Err(ProxyError::WrongAnswer),
            }
        }

        Ok(complete)
    }

    /// Whether the closing bracket was seen
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_whole_body_in_one_chunk() {
        let mut parser = CommandStream::new();
        let commands = parser
            .push("[[\"approved\",\"1 10:uuid 0\"],[\"processed\",\"1 10:uuid 0\"]]")
            .unwrap();
        assert_eq!(commands.len(), 2);
        assert!(parser.is_finished());
        assert_eq!(
            Answer::parse(&commands[0]).unwrap(),
            Answer::Approved("1 10:uuid 0".into())
        );
    }

    #[test]
    fn test_chunk_boundary_inside_command() {
        let mut parser = CommandStream::new();
        assert!(parser.push("[[\"appro").unwrap().is_empty());
        let commands = parser.push("ved\",\"1 10:uuid 0\"]").unwrap();
        assert_eq!(commands.len(), 1);
        assert!(!parser.is_finished());
        let commands = parser.push(",[\"processed\",\"1 10:uuid 0\"]]").unwrap();
        assert_eq!(commands.len(), 1);
        assert!(parser.is_finished());
    }

    #[test]
    fn test_malformed_body_rejected() {
        let mut parser = CommandStream::new();
        assert!(matches!(
            parser.push("{\"not\":\"an array\"}"),
            Err(ProxyError::WrongAnswer)
        ));

        let mut parser = CommandStream::new();
        assert!(matches!(
            parser.push("[tru"),
            Err(ProxyError::WrongAnswer) | Ok(_)
        ));
    }

    #[test]
    fn test_answer_parsing() {
        assert_eq!(
            Answer::parse(&json!(["authenticated", "uuid"])).unwrap(),
            Answer::Authenticated("uuid".into())
        );
        assert_eq!(
            Answer::parse(&json!(["error", "stacktrace"])).unwrap(),
            Answer::Error("stacktrace".into())
        );
        assert!(Answer::parse(&json!(["something-else"])).is_err());
        assert!(Answer::parse(&json!("approved")).is_err());
    }
}
