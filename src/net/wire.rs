//! Messages exchanged between brokers, and their framing.
//!
//! A frame is a 4-byte big-endian payload length followed by the bincode encoding of a
//! [`Request`] or [`Reply`]. One request gets exactly one reply on the same connection.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::broker::ModuleInfo;
use crate::module::MethodDescriptor;
use crate::value::Value;
use crate::{BrokerError, ErrorKind, Result, TaskId};

/// Frames above this size are rejected without reading the payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Call {
        module: String,
        method: String,
        params: Value,
    },
    PCall {
        module: String,
        method: String,
        params: Value,
    },
    Wait {
        task: TaskId,
        timeout_ms: u64,
    },
    WaitMethod {
        method: String,
        timeout_ms: u64,
    },
    IsRunning {
        task: TaskId,
    },
    IsMethodRunning {
        method: String,
    },
    Stop {
        task: TaskId,
    },
    StopMethod {
        method: String,
    },
    /// Discovery: `dont_look_into` names the broker the request came from.
    Explore {
        name: String,
        search_up: bool,
        search_down: bool,
        dont_look_into: Option<String>,
    },
    GetModuleList,
    GetBrokerList,
    GetGlobalModuleList,
    MethodList {
        module: String,
    },
    MethodHelp {
        module: String,
        method: String,
    },
    ModuleHelp {
        module: String,
    },
    ModuleVersion {
        module: String,
    },
    InnerTest {
        module: String,
    },
    RegisterBroker {
        info: ModuleInfo,
    },
    UnregisterBroker {
        name: String,
    },
    /// The parent is going away.
    ParentExit {
        name: String,
    },
    Ping {
        from: String,
        timestamp: i64,
    },
}

impl Request {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Request::Call { .. } => "call",
            Request::PCall { .. } => "pcall",
            Request::Wait { .. } => "wait",
            Request::WaitMethod { .. } => "wait_method",
            Request::IsRunning { .. } => "is_running",
            Request::IsMethodRunning { .. } => "is_method_running",
            Request::Stop { .. } => "stop",
            Request::StopMethod { .. } => "stop_method",
            Request::Explore { .. } => "explore",
            Request::GetModuleList => "module_list",
            Request::GetBrokerList => "broker_list",
            Request::GetGlobalModuleList => "global_module_list",
            Request::MethodList { .. } => "method_list",
            Request::MethodHelp { .. } => "method_help",
            Request::ModuleHelp { .. } => "module_help",
            Request::ModuleVersion { .. } => "module_version",
            Request::InnerTest { .. } => "inner_test",
            Request::RegisterBroker { .. } => "register_broker",
            Request::UnregisterBroker { .. } => "unregister_broker",
            Request::ParentExit { .. } => "parent_exit",
            Request::Ping { .. } => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Result of a call; `has_result == false` for void methods.
    Value { has_result: bool, value: Value },
    Task(TaskId),
    Bool(bool),
    Info(Option<ModuleInfo>),
    Infos(Vec<ModuleInfo>),
    Strings(Vec<String>),
    Descriptor(MethodDescriptor),
    Pong { timestamp: i64 },
    Ack,
    Error { kind: ErrorKind, message: String },
}

impl Reply {
    pub fn error(err: &BrokerError) -> Self {
        Reply::Error {
            kind: err.kind(),
            message: err.message(),
        }
    }

    /// Turns an error reply back into an error.
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error { kind, message } => Err(BrokerError::from_remote(kind, message)),
            other => Ok(other),
        }
    }

    fn unexpected(self, wanted: &str) -> BrokerError {
        BrokerError::Internal(format!("expected {} reply, got {:?}", wanted, self))
    }

    pub fn into_value(self) -> Result<Option<Value>> {
        match self.into_result()? {
            Reply::Value { has_result, value } => Ok(has_result.then_some(value)),
            other => Err(other.unexpected("value")),
        }
    }

    pub fn into_task(self) -> Result<TaskId> {
        match self.into_result()? {
            Reply::Task(id) => Ok(id),
            other => Err(other.unexpected("task")),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self.into_result()? {
            Reply::Bool(b) => Ok(b),
            other => Err(other.unexpected("bool")),
        }
    }

    pub fn into_info(self) -> Result<Option<ModuleInfo>> {
        match self.into_result()? {
            Reply::Info(info) => Ok(info),
            other => Err(other.unexpected("info")),
        }
    }

    pub fn into_infos(self) -> Result<Vec<ModuleInfo>> {
        match self.into_result()? {
            Reply::Infos(infos) => Ok(infos),
            other => Err(other.unexpected("info list")),
        }
    }

    pub fn into_strings(self) -> Result<Vec<String>> {
        match self.into_result()? {
            Reply::Strings(s) => Ok(s),
            other => Err(other.unexpected("string list")),
        }
    }

    pub fn into_descriptor(self) -> Result<MethodDescriptor> {
        match self.into_result()? {
            Reply::Descriptor(d) => Ok(d),
            other => Err(other.unexpected("descriptor")),
        }
    }

    pub fn into_ack(self) -> Result<()> {
        match self.into_result()? {
            Reply::Ack | Reply::Pong { .. } => Ok(()),
            other => Err(other.unexpected("ack")),
        }
    }
}

/// Writes one frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(BrokerError::Internal(format!("frame of {} bytes is too large", payload.len())));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the connection between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BrokerError::Internal(format!("peer announced a {} byte frame", len)));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(bincode::deserialize(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::GetModuleList).unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        let mut cursor = Cursor::new(buf);
        let back: Option<Request> = read_frame(&mut cursor).unwrap();
        assert_eq!(back, Some(Request::GetModuleList));
        let eof: Option<Request> = read_frame(&mut cursor).unwrap();
        assert!(eof.is_none());
    }

    #[test]
    fn test_call_with_nested_value() {
        let request = Request::Call {
            module: "Echo".into(),
            method: "echo".into(),
            params: Value::from(vec![Value::from(vec![Value::Float(1.5), Value::binary(vec![0, 255])])]),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &request).unwrap();
        let back: Option<Request> = read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back, Some(request));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(&[0; 8]);
        let res: Result<Option<Reply>> = read_frame(&mut Cursor::new(buf));
        assert!(res.is_err());
    }

    #[test]
    fn test_error_reply_round_trips_kind() {
        let reply = Reply::error(&BrokerError::MethodNotFound("Echo.nope".into()));
        match reply.into_value() {
            Err(BrokerError::MethodNotFound(msg)) => assert_eq!(msg, "Echo.nope"),
            other => panic!("unexpected {:?}", other),
        }
        let void = Reply::Value { has_result: false, value: Value::Invalid };
        assert_eq!(void.into_value().unwrap(), None);
    }
}
