//! Plugin factories by name.

use super::handle::FrameworkHandle;
use super::interface::Plugin;
use crate::error::{Result, SchedulerError};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Builds a plugin from its (optional) JSON args.
pub type PluginFactory =
    Arc<dyn Fn(Option<&serde_json::Value>, &FrameworkHandle) -> Result<Arc<dyn Plugin>> + Send + Sync>;

/// Name to factory map.
#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, PluginFactory>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("plugins", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if the name is taken.
    pub fn register(&mut self, name: &str, factory: PluginFactory) -> Result<()> {
        if self.factories.contains_key(name) {
            return Err(SchedulerError::Config(format!(
                "a plugin named {name} already exists"
            )));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    /// Remove a factory.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] if the name is unknown.
    pub fn unregister(&mut self, name: &str) -> Result<()> {
        self.factories
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::Config(format!("no plugin named {name} exists")))
    }

    /// Add every factory of `other`, typically out-of-tree plugins.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] on the first duplicate name.
    pub fn merge(&mut self, other: Self) -> Result<()> {
        for (name, factory) in other.factories {
            self.register(&name, factory)?;
        }
        Ok(())
    }

    /// Look up a factory.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PluginFactory> {
        self.factories.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.factories.keys().map(String::as_str)
    }
}

impl<'a> FromIterator<(&'a str, PluginFactory)> for Registry {
    fn from_iter<I: IntoIterator<Item = (&'a str, PluginFactory)>>(iter: I) -> Self {
        Self {
            factories: iter.into_iter().map(|(n, f)| (n.to_string(), f)).collect(),
        }
    }
}

/// Decode plugin args, falling back to the type's default when absent.
///
/// # Errors
///
/// Returns [`SchedulerError::Config`] if the JSON does not match `T`.
pub fn decode_args<T: DeserializeOwned + Default>(
    plugin: &str,
    args: Option<&serde_json::Value>,
) -> Result<T> {
    match args {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(value) => T::deserialize(value)
            .map_err(|e| SchedulerError::Config(format!("decoding args for plugin {plugin}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    struct Noop;

    impl Plugin for Noop {
        fn name(&self) -> &str {
            "Noop"
        }
    }

    fn noop_factory() -> PluginFactory {
        Arc::new(|_, _| Ok(Arc::new(Noop) as Arc<dyn Plugin>))
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut r = Registry::new();
        r.register("Noop", noop_factory()).unwrap();
        assert!(r.register("Noop", noop_factory()).is_err());

        let mut other = Registry::new();
        other.register("Other", noop_factory()).unwrap();
        r.merge(other).unwrap();
        assert_eq!(r.names().collect::<Vec<_>>(), ["Noop", "Other"]);

        let mut dup = Registry::new();
        dup.register("Other", noop_factory()).unwrap();
        assert!(r.merge(dup).is_err());

        r.unregister("Noop").unwrap();
        assert!(r.unregister("Noop").is_err());
    }

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase", default)]
    struct Args {
        hard_weight: i32,
    }

    #[test]
    fn args_default_when_missing() {
        assert_eq!(decode_args::<Args>("X", None).unwrap(), Args::default());
        let v = serde_json::json!({"hardWeight": 3});
        assert_eq!(decode_args::<Args>("X", Some(&v)).unwrap().hard_weight, 3);
        let bad = serde_json::json!({"hardWeight": "x"});
        assert!(decode_args::<Args>("X", Some(&bad)).is_err());
    }
}
