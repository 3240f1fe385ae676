//! Messages crossing the control-context / execution-context boundary.

use crate::config::SplOptions;
use crate::error::{Error, ErrorKind};
use crate::extension::ExtensionDescriptor;
use crate::value::Value;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

macro_rules! builtins {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Operations the dispatcher implements itself.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Builtin {
            $($variant),*
        }

        impl Builtin {
            const TABLE: &'static [(&'static str, Builtin)] = &[$(($name, Builtin::$variant)),*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Builtin::$variant => $name),*
                }
            }
        }
    };
}

builtins! {
    Version => "version",
    Open => "db",
    Attach => "db.attach",
    Detach => "db.detach",
    Exec => "db.exec",
    Read => "db.read",
    Load => "db.load",
    Save => "db.save",
    Close => "db.close",
    FsMount => "fs.mount",
    FsUnmount => "fs.unmount",
    FsFile => "fs.file",
    FsDir => "fs.dir",
    FsUnlink => "fs.unlink",
    FsMkdir => "fs.mkdir",
    ResFirst => "res.first",
    ResFlat => "res.flat",
    ResRows => "res.rows",
    ResCols => "res.cols",
    ResObjs => "res.objs",
    ResSync => "res.sync",
    ResFree => "res.free",
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Builtin> {
        Self::TABLE
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, builtin)| *builtin)
    }
}

/// A resolved operation name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Builtin(Builtin),
    Extension(String),
}

impl Operation {
    pub fn parse(name: &str) -> Self {
        match Builtin::lookup(name) {
            Some(builtin) => Operation::Builtin(builtin),
            None => Operation::Extension(name.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Operation::Builtin(builtin) => builtin.name(),
            Operation::Extension(name) => name,
        }
    }

    /// `db.*` and `res.*` operations address an existing connection.
    pub fn targets_connection(&self) -> bool {
        let name = self.name();
        name.starts_with("db.") || name.starts_with("res.")
    }
}

impl From<Builtin> for Operation {
    fn from(builtin: Builtin) -> Self {
        Operation::Builtin(builtin)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Operation::parse(&name))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<u64>,
    pub operation: Operation,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl Command {
    pub fn new(operation: impl Into<Operation>, target_id: Option<u64>, arguments: Vec<Value>) -> Self {
        Self {
            target_id,
            operation: operation.into(),
            arguments,
        }
    }
}

/// A single command or an ordered batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operations {
    Batch(Vec<Command>),
    Single(Command),
}

impl Operations {
    pub fn into_vec(self) -> Vec<Command> {
        match self {
            Operations::Batch(commands) => commands,
            Operations::Single(command) => vec![command],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Operations::Batch(commands) => commands.len(),
            Operations::Single(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_id: u64,
    pub operations: Operations,
}

impl Request {
    pub fn batch(request_id: u64, commands: Vec<Command>) -> Self {
        Self {
            request_id,
            operations: Operations::Batch(commands),
        }
    }
}

/// Stand-in for a live resource that never crosses the boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marker {
    Db,
    Spl,
}

impl Marker {
    pub fn as_str(self) -> &'static str {
        match self {
            Marker::Db => "db",
            Marker::Spl => "spl",
        }
    }

    /// The marker as the plain `{ "this": ... }` value it is on the wire.
    pub fn into_value(self) -> Value {
        Value::map([("this", self.as_str())])
    }
}

/// The value produced by the last command of a batch.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    This(Marker),
    Value(Value),
}

impl Reply {
    pub fn from_value(value: Value) -> Self {
        if let Value::Map(entries) = &value {
            if entries.len() == 1 {
                match entries.get("this").and_then(Value::as_str) {
                    Some("db") => return Reply::This(Marker::Db),
                    Some("spl") => return Reply::This(Marker::Spl),
                    _ => {}
                }
            }
        }
        Reply::Value(value)
    }

    pub fn into_value(self) -> Value {
        match self {
            Reply::This(marker) => marker.into_value(),
            Reply::Value(value) => value,
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

impl Serialize for Reply {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Reply::This(marker) => marker.into_value().serialize(serializer),
            Reply::Value(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Reply {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Reply::from_value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: u64,
    pub result: Option<Reply>,
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    /// Buffers handed over by ownership rather than copied.
    #[serde(skip)]
    pub transfer: Vec<Bytes>,
}

impl Response {
    pub fn success(request_id: u64, result: Reply, transfer: Vec<Bytes>) -> Self {
        Self {
            request_id,
            result: Some(result),
            error: String::new(),
            kind: None,
            transfer,
        }
    }

    pub fn failure(request_id: u64, err: &Error) -> Self {
        Self {
            request_id,
            result: None,
            error: err.to_string(),
            kind: Some(err.kind()),
            transfer: Vec::new(),
        }
    }

    /// Initialization acknowledgement.
    pub fn ready() -> Self {
        Self {
            request_id: 0,
            result: None,
            error: String::new(),
            kind: None,
            transfer: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// First message of every session; configures the engine and extensions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    #[serde(default)]
    pub options: SplOptions,
    #[serde(default)]
    pub extensions: Vec<ExtensionDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}
