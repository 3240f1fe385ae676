//! Host-registered extension functions, resolved from the descriptors sent
//! at initialization.

use crate::dispatch::Engine;
use crate::error::{Error, Result};
use crate::protocol::Reply;
use crate::sqlite::EngineConnection;
use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliesTo {
    Db,
    Spl,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDescriptor {
    pub applies_to: AppliesTo,
    /// Name of the module in the host's [`ExtensionLibrary`].
    pub exported_url: String,
    /// Operation name to exported symbol.
    pub function_names: IndexMap<String, String>,
}

impl ExtensionDescriptor {
    pub fn new(applies_to: AppliesTo, exported_url: impl Into<String>) -> Self {
        Self {
            applies_to,
            exported_url: exported_url.into(),
            function_names: IndexMap::new(),
        }
    }

    pub fn function(mut self, name: impl Into<String>, symbol: impl Into<String>) -> Self {
        self.function_names.insert(name.into(), symbol.into());
        self
    }
}

/// What an extension operates on.
pub enum Target<'a> {
    Db(&'a mut EngineConnection),
    Spl(&'a mut Engine),
}

pub type LaterFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'static>>;

/// Outcome of an extension call.
pub enum Step {
    Done(Reply),
    /// Awaited by the dispatcher before the batch continues.
    Later(LaterFuture),
}

impl Step {
    pub fn value(value: impl Into<Value>) -> Self {
        Step::Done(Reply::Value(value.into()))
    }

    pub fn later<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        Step::Later(Box::pin(future))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Done(reply) => f.debug_tuple("Done").field(reply).finish(),
            Step::Later(_) => f.write_str("Later(..)"),
        }
    }
}

pub trait Extension: Send + Sync {
    fn call(&self, target: Target<'_>, args: Vec<Value>) -> Result<Step>;
}

impl<F> Extension for F
where
    F: Fn(Target<'_>, Vec<Value>) -> Result<Step> + Send + Sync,
{
    fn call(&self, target: Target<'_>, args: Vec<Value>) -> Result<Step> {
        self(target, args)
    }
}

/// Exported symbols of one extension module.
#[derive(Clone, Default)]
pub struct ExtensionModule {
    symbols: HashMap<String, Arc<dyn Extension>>,
}

impl ExtensionModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(mut self, symbol: impl Into<String>, extension: impl Extension + 'static) -> Self {
        self.symbols.insert(symbol.into(), Arc::new(extension));
        self
    }

    fn symbol(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.symbols.get(name).cloned()
    }
}

/// Modules the host makes available, keyed by the url descriptors refer to.
#[derive(Clone, Default)]
pub struct ExtensionLibrary {
    modules: HashMap<String, ExtensionModule>,
}

impl ExtensionLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, url: impl Into<String>, module: ExtensionModule) -> Self {
        self.modules.insert(url.into(), module);
        self
    }

    /// Builds the operation table: `db` descriptors register `db.<name>`,
    /// `spl` descriptors register `<name>`.
    pub fn resolve(
        &self,
        descriptors: &[ExtensionDescriptor],
    ) -> Result<HashMap<String, Arc<dyn Extension>>> {
        let mut table = HashMap::new();
        for descriptor in descriptors {
            let module = self.modules.get(&descriptor.exported_url).ok_or_else(|| {
                Error::Extension(format!(
                    "Extension module '{}' not found",
                    descriptor.exported_url
                ))
            })?;
            for (name, symbol) in &descriptor.function_names {
                let extension = module.symbol(symbol).ok_or_else(|| {
                    Error::Extension(format!(
                        "Extension module '{}' does not export '{symbol}'",
                        descriptor.exported_url
                    ))
                })?;
                let operation = match descriptor.applies_to {
                    AppliesTo::Db => format!("db.{name}"),
                    AppliesTo::Spl => name.clone(),
                };
                table.insert(operation, extension);
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: Target<'_>, _: Vec<Value>) -> Result<Step> {
        Ok(Step::value(Value::Null))
    }

    #[test]
    fn descriptors_register_prefixed_names() {
        let library = ExtensionLibrary::new().register(
            "topology",
            ExtensionModule::new().export("tp", noop).export("init", noop),
        );
        let table = library
            .resolve(&[
                ExtensionDescriptor::new(AppliesTo::Db, "topology").function("topo", "tp"),
                ExtensionDescriptor::new(AppliesTo::Spl, "topology").function("setup", "init"),
            ])
            .expect("resolve");
        let mut names: Vec<_> = table.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["db.topo", "setup"]);
    }

    #[test]
    fn missing_modules_and_symbols_fail() {
        let library = ExtensionLibrary::new().register("m", ExtensionModule::new().export("a", noop));
        let missing_module = library
            .resolve(&[ExtensionDescriptor::new(AppliesTo::Spl, "nope").function("x", "a")])
            .err()
            .expect("module");
        assert!(missing_module.to_string().contains("'nope' not found"));
        let missing_symbol = library
            .resolve(&[ExtensionDescriptor::new(AppliesTo::Spl, "m").function("x", "b")])
            .err()
            .expect("symbol");
        assert!(missing_symbol.to_string().contains("does not export 'b'"));
    }

    #[test]
    fn descriptors_use_camel_case_fields() {
        let descriptor: ExtensionDescriptor = serde_json::from_str(
            r#"{"appliesTo":"db","exportedUrl":"m","functionNames":{"f":"g"}}"#,
        )
        .expect("descriptor");
        assert_eq!(descriptor.applies_to, AppliesTo::Db);
        assert_eq!(descriptor.function_names["f"], "g");
    }
}
