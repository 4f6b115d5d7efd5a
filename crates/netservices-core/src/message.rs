//! Wire message model.
//!
//! Both messages travel as JSON arrays whose first element is a type tag:
//!
//! ```text
//! Call   -> [0, id, path[], args[]]
//! Result -> [1 | 2, id, payload]      // 1 = Failure, 2 = Success
//! ```

use crate::error::RemoteError;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

pub const CALL_TAG: u8 = 0;
pub const FAILURE_TAG: u8 = 1;
pub const SUCCESS_TAG: u8 = 2;

/// A request to invoke the method at `path` with `args`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallMessage {
    pub id: String,
    pub path: Vec<String>,
    pub args: Vec<Value>,
}

impl CallMessage {
    pub fn new(id: impl Into<String>, path: Vec<String>, args: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            path,
            args,
        }
    }

    /// The dot-joined path, as matched against allow-lists.
    pub fn joined_path(&self) -> String {
        self.path.join(".")
    }
}

/// Outcome carried by a `ResultMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Failure,
    Success,
}

impl ResultKind {
    pub fn tag(self) -> u8 {
        match self {
            ResultKind::Failure => FAILURE_TAG,
            ResultKind::Success => SUCCESS_TAG,
        }
    }
}

/// The answer to exactly one `CallMessage`, matched by id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMessage {
    pub kind: ResultKind,
    pub id: String,
    pub payload: Value,
}

impl ResultMessage {
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: ResultKind::Success,
            id: id.into(),
            payload,
        }
    }

    pub fn failure(id: impl Into<String>, error: &RemoteError) -> Self {
        Self {
            kind: ResultKind::Failure,
            id: id.into(),
            payload: error.to_payload(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ResultKind::Success
    }
}

/// Any message exchanged over a link.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call(CallMessage),
    Result(ResultMessage),
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Message::Call(call) => &call.id,
            Message::Result(result) => &result.id,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Message::Call(_) => CALL_TAG,
            Message::Result(result) => result.kind.tag(),
        }
    }
}

impl From<CallMessage> for Message {
    fn from(call: CallMessage) -> Self {
        Message::Call(call)
    }
}

impl From<ResultMessage> for Message {
    fn from(result: ResultMessage) -> Self {
        Message::Result(result)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Message::Call(call) => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element(&CALL_TAG)?;
                seq.serialize_element(&call.id)?;
                seq.serialize_element(&call.path)?;
                seq.serialize_element(&call.args)?;
                seq.end()
            }
            Message::Result(result) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(&result.kind.tag())?;
                seq.serialize_element(&result.id)?;
                seq.serialize_element(&result.payload)?;
                seq.end()
            }
        }
    }
}

struct MessageVisitor;

impl<'de> Visitor<'de> for MessageVisitor {
    type Value = Message;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a [tag, id, ...] message array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Message, A::Error> {
        let tag: u64 = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let id: String = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;

        match tag {
            0 => {
                let path: Vec<String> = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let args: Vec<Value> = seq.next_element()?.unwrap_or_default();
                Ok(Message::Call(CallMessage { id, path, args }))
            }
            1 | 2 => {
                let payload: Value = seq.next_element()?.unwrap_or(Value::Null);
                let kind = if tag == 1 {
                    ResultKind::Failure
                } else {
                    ResultKind::Success
                };
                Ok(Message::Result(ResultMessage { kind, id, payload }))
            }
            other => Err(de::Error::custom(format!(
                "The message type {} is not implemented.",
                other
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(MessageVisitor)
    }
}
