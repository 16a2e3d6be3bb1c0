//! Wire messages exchanged between members
//!
//! This is the cross-member contract: method names with positional typed
//! arguments, and per-member replies carrying either a value or an error.
//! Variants are only ever appended so older members keep decoding newer
//! traffic they know about.

use crate::group::view::{MemberId, View, ViewId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed argument or return value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    F64(f64),
    Str(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::F64(_) => "f64",
            Value::Str(_) => "str",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::F64(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Failure of a member's local handler, reported back to the caller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ApplicationError(pub String);

/// A replicated method invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub method: String,
    pub args: Vec<Value>,
}

impl RpcCall {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    pub fn expect_arity(&self, arity: usize) -> Result<(), ApplicationError> {
        if self.args.len() != arity {
            return Err(ApplicationError(format!(
                "{} expects {} argument(s), got {}",
                self.method,
                arity,
                self.args.len()
            )));
        }
        Ok(())
    }

    pub fn str_arg(&self, index: usize) -> Result<&str, ApplicationError> {
        let arg = self.arg(index)?;
        arg.as_str()
            .ok_or_else(|| self.type_mismatch(index, "str", arg))
    }

    pub fn f64_arg(&self, index: usize) -> Result<f64, ApplicationError> {
        let arg = self.arg(index)?;
        arg.as_f64()
            .ok_or_else(|| self.type_mismatch(index, "f64", arg))
    }

    fn arg(&self, index: usize) -> Result<&Value, ApplicationError> {
        self.args.get(index).ok_or_else(|| {
            ApplicationError(format!("{}: missing argument {}", self.method, index))
        })
    }

    fn type_mismatch(&self, index: usize, expected: &str, got: &Value) -> ApplicationError {
        ApplicationError(format!(
            "{}: argument {} must be {}, got {}",
            self.method,
            index,
            expected,
            got.type_name()
        ))
    }
}

impl fmt::Display for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.method)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

/// Lock protocol messages (see `lock::service`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LockMessage {
    Acquire {
        name: String,
        request_id: u64,
    },
    Release {
        name: String,
        token: u64,
    },
    Cancel {
        name: String,
        request_id: u64,
    },
    Granted {
        name: String,
        request_id: u64,
        token: u64,
    },
    /// Sent to a new coordinator: locks held, requests pending, highest token seen
    Reconcile {
        view: ViewId,
        held: Vec<(String, u64)>,
        pending: Vec<(String, u64)>,
        max_token: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Liveness, plus the view the sender has installed. Sent on every
    /// tick and right after a view install.
    Heartbeat {
        view: ViewId,
    },
    JoinRequest {
        cluster: String,
    },
    JoinRedirect {
        coordinator: MemberId,
    },
    JoinRejected {
        reason: String,
    },
    LeaveRequest,
    InstallView(View),
    Call {
        seq: u64,
        call_id: u64,
        reply: bool,
        call: RpcCall,
    },
    Reply {
        call_id: u64,
        outcome: Result<Value, String>,
    },
    StateRequest {
        request_id: u64,
    },
    StateResponse {
        request_id: u64,
        payload: Result<Vec<u8>, String>,
    },
    Lock(LockMessage),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Heartbeat { .. } => "heartbeat",
            Message::JoinRequest { .. } => "join-request",
            Message::JoinRedirect { .. } => "join-redirect",
            Message::JoinRejected { .. } => "join-rejected",
            Message::LeaveRequest => "leave-request",
            Message::InstallView(_) => "install-view",
            Message::Call { .. } => "call",
            Message::Reply { .. } => "reply",
            Message::StateRequest { .. } => "state-request",
            Message::StateResponse { .. } => "state-response",
            Message::Lock(_) => "lock",
        }
    }
}

/// A message together with its sender
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: MemberId,
    pub message: Message,
}

impl Envelope {
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
