//! Control-context side of spl: deferred command chains that batch engine
//! operations into single round trips to an execution context.
//!
//! ```no_run
//! # async fn demo() -> spl_client::Result<()> {
//! use spl_client::{Spl, SplConfig, Source};
//!
//! let spl = Spl::spawn(SplConfig::new()).await?;
//! let db = spl.db(Source::Memory);
//! let rows = db
//!     .read("create table t (v); insert into t values (1), (2)")
//!     .exec("select v from t where v > ?", [1])
//!     .get()
//!     .rows()
//!     .await?;
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! ```

mod chain;
mod db;
mod error;
mod pending;
mod spl;
mod transport;

pub use chain::{Deferred, Settled};
pub use db::{Db, Get, Params};
pub use error::{Error, Result};
pub use pending::PendingRequests;
pub use spl::{Fs, Spl, SplConfig};
pub use transport::{ThreadTransport, Transport};

pub use spl_db::{
    AppliesTo, ErrorKind, Extension, ExtensionDescriptor, ExtensionLibrary, ExtensionModule,
    GeoJsonOptions, MountFile, ResultView, Source, SplOptions, Step, Target, Value,
};
