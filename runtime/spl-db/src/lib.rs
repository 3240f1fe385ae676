//! Execution-context side of spl: the engine connection registry, the
//! parameter/column marshaler and the batch dispatcher.

mod config;
mod dispatch;
mod error;
mod extension;
mod geometry;
mod marshal;
mod protocol;
mod registry;
mod result;
mod sqlite;
mod value;
mod vfs;

pub use config::{GeoJsonOptions, SplOptions};
pub use dispatch::{Crashed, Engine, ExecutionContext};
pub use error::{Error, ErrorKind, Result};
pub use extension::{
    AppliesTo, Extension, ExtensionDescriptor, ExtensionLibrary, ExtensionModule, LaterFuture,
    Step, Target,
};
pub use geometry::{Geometry, GeoJsonBuffer};
pub use protocol::{
    Builtin, Command, InitMessage, Marker, Operation, Operations, Reply, Request, Response,
};
pub use registry::Registry;
pub use result::ResultView;
pub use sqlite::{ConnectionState, EngineConnection, Source};
pub use value::Value;
pub use vfs::{MountFile, Vfs};
