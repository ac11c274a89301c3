//! Collaborators the command protocol hands work to.
//!
//! The protocol layer only knows these traits. The daemon wires in
//! [`CatalogConfiguration`] and [`ScriptLifecycle`]; tests substitute their
//! own.

mod catalog;
mod lifecycle;

use std::fmt;

use hagent_wire::protocol::{Component, LifecycleAction};
use hagent_wire::{PlainChannel, SecureChannel};
use serde::Deserialize;

pub use catalog::{builtin_params, CatalogConfiguration};
pub use lifecycle::ScriptLifecycle;

/// Lifecycle operations on a managed component.
pub trait ComponentLifecycle: Send + Sync {
    /// Run `action` and describe the outcome as status text for the client.
    fn component_action(&self, component: Component, action: LifecycleAction, args: &[&str])
        -> String;
}

/// Where a recognised parameter lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLookup {
    pub canonical_name: String,
    pub config_file: String,
}

/// Parameter handling for managed components.
pub trait Configuration: Send + Sync {
    fn is_installed(&self, component: Component) -> bool;

    /// Map a client-supplied name (canonical or alias) to the canonical one.
    fn lookup_canonical_param(&self, component: Component, raw_name: &str) -> Option<ParamLookup>;

    fn validate(&self, component: Component, name: &str, value: &str) -> Result<(), InvalidValue>;

    /// Persist an already validated value and describe the outcome.
    fn apply_config(&self, component: Component, name: &str, value: &str, file: &str) -> String;
}

/// Why a parameter value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidValue {
    Empty,
    NotAnInteger,
    OutOfRange { min: i64, max: i64 },
    NotABoolean,
    NotAbsolutePath,
    ContainsLineBreak,
}

impl fmt::Display for InvalidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidValue::Empty => f.write_str("value must not be empty"),
            InvalidValue::NotAnInteger => f.write_str("expected an integer"),
            InvalidValue::OutOfRange { min, max } => {
                write!(f, "must be between {min} and {max}")
            }
            InvalidValue::NotABoolean => f.write_str("expected true or false"),
            InvalidValue::NotAbsolutePath => f.write_str("expected an absolute path"),
            InvalidValue::ContainsLineBreak => f.write_str("value must be a single line"),
        }
    }
}

/// Value type of a catalogue parameter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParamKind {
    Int { min: i64, max: i64 },
    Bool,
    Text,
    Path,
}

impl ParamKind {
    pub fn check(&self, value: &str) -> Result<(), InvalidValue> {
        if value.contains(['\n', '\r']) {
            return Err(InvalidValue::ContainsLineBreak);
        }
        let value = value.trim();
        if value.is_empty() {
            return Err(InvalidValue::Empty);
        }
        match self {
            ParamKind::Int { min, max } => {
                let parsed: i64 = value.parse().map_err(|_| InvalidValue::NotAnInteger)?;
                if parsed < *min || parsed > *max {
                    return Err(InvalidValue::OutOfRange {
                        min: *min,
                        max: *max,
                    });
                }
                Ok(())
            }
            ParamKind::Bool => match value.to_ascii_lowercase().as_str() {
                "true" | "false" | "yes" | "no" | "on" | "off" | "1" | "0" => Ok(()),
                _ => Err(InvalidValue::NotABoolean),
            },
            ParamKind::Text => Ok(()),
            ParamKind::Path => {
                if value.starts_with('/') {
                    Ok(())
                } else {
                    Err(InvalidValue::NotAbsolutePath)
                }
            }
        }
    }
}

/// One configurable parameter of a component.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub file: String,
    pub kind: ParamKind,
}

impl ParamSpec {
    pub fn matches(&self, raw_name: &str) -> bool {
        let raw = raw_name.trim();
        self.name.eq_ignore_ascii_case(raw) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(raw))
    }
}

/// Builds the channel each worker negotiates before serving commands.
pub type ChannelFactory = Box<dyn Fn() -> Box<dyn SecureChannel> + Send + Sync>;

/// Everything a worker needs besides its connection.
pub struct Services {
    pub lifecycle: Box<dyn ComponentLifecycle>,
    pub configuration: Box<dyn Configuration>,
    pub channel: ChannelFactory,
}

impl Services {
    pub fn new(
        lifecycle: impl ComponentLifecycle + 'static,
        configuration: impl Configuration + 'static,
    ) -> Self {
        Self {
            lifecycle: Box::new(lifecycle),
            configuration: Box::new(configuration),
            channel: Box::new(|| Box::new(PlainChannel)),
        }
    }

    pub fn with_channel(mut self, channel: ChannelFactory) -> Self {
        self.channel = channel;
        self
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_kind_checks_range() {
        let kind = ParamKind::Int { min: 1, max: 512 };
        assert_eq!(kind.check("3"), Ok(()));
        assert_eq!(kind.check(" 512 "), Ok(()));
        assert_eq!(kind.check("0"), Err(InvalidValue::OutOfRange { min: 1, max: 512 }));
        assert_eq!(kind.check("three"), Err(InvalidValue::NotAnInteger));
        assert_eq!(kind.check(""), Err(InvalidValue::Empty));
    }

    #[test]
    fn other_kinds() {
        assert_eq!(ParamKind::Bool.check("On"), Ok(()));
        assert_eq!(ParamKind::Bool.check("maybe"), Err(InvalidValue::NotABoolean));
        assert_eq!(ParamKind::Path.check("/data/zk"), Ok(()));
        assert_eq!(ParamKind::Path.check("data"), Err(InvalidValue::NotAbsolutePath));
        assert_eq!(ParamKind::Text.check("a\nb"), Err(InvalidValue::ContainsLineBreak));
    }

    #[test]
    fn param_matches_name_and_aliases() {
        let spec = ParamSpec {
            name: "dfs.replication".into(),
            aliases: vec!["hdfs.replication".into()],
            file: "hdfs-site.xml".into(),
            kind: ParamKind::Int { min: 1, max: 512 },
        };
        assert!(spec.matches("DFS.Replication"));
        assert!(spec.matches("hdfs.replication"));
        assert!(!spec.matches("dfs.blocksize"));
    }
}
