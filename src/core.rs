use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A type-erased, thread-safe container.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for unit names.
pub(crate) type ArcStr = Arc<str>;

/// Identifier of a unit, assigned monotonically at creation.
///
/// Modules and tasks share one id space, so an id alone is enough to find a
/// unit regardless of whether it has a name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct UnitId(pub(crate) u64);

impl UnitId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Debug for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UnitId({})", self.0)
    }
}

impl Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a unit.
///
/// ```text
/// Inited -> Fetching -> Fetched -> Executing -> Executed
///              |           |           |
///              +-----------+-----------+-----> Error
/// ```
///
/// `Executed` and `Error` are terminal. A unit whose source is already present
/// when it becomes known (a task, or a module defined before anyone asked for
/// it) starts its life in `Fetched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum State {
    Inited,
    Fetching,
    Fetched,
    Executing,
    Executed,
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Executed | State::Error)
    }

    pub(crate) fn can_become(self, next: State) -> bool {
        use State::*;

        matches!(
            (self, next),
            (Inited, Fetching)
                | (Inited, Fetched)
                | (Fetching, Fetched)
                | (Fetched, Executing)
                | (Executing, Executed)
                | (Inited | Fetching | Fetched | Executing, Error)
        )
    }
}

/// The value produced by a unit once it has executed.
///
/// A unit may legitimately produce nothing, in which case consumers receive
/// [`Argument::Undefined`](crate::Argument::Undefined) at its position.
#[derive(Clone, Default)]
pub struct Exports(Option<Dynamic>);

impl Exports {
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self(Some(Arc::new(value)))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn from_dynamic(value: Dynamic) -> Self {
        Self(Some(value))
    }

    pub fn value(&self) -> Option<&Dynamic> {
        self.0.as_ref()
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_ref().and_then(|value| value.downcast_ref::<T>())
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

impl Debug for Exports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(_) => write!(f, "Exports(..)"),
            None => write!(f, "Exports(undefined)"),
        }
    }
}

/// Resolver configuration.
///
/// Options can be written by hand or read from JSON:
///
/// ```rust
/// let options = tsunagi::Options::from_json(r#"{ "aliases": { "jq": "jquery" } }"#).unwrap();
/// assert_eq!(options.sentinel, "require");
/// assert_eq!(options.canonical("jq"), "jquery");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
    /// Dependency name that injects the dynamic resolution capability at its
    /// position instead of naming a real module.
    pub sentinel: String,
    /// Alternative names mapped onto canonical module names.
    pub aliases: BTreeMap<String, String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sentinel: String::from("require"),
            aliases: BTreeMap::new(),
        }
    }
}

impl Options {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Rejects aliases that rename the sentinel or map onto it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self
            .aliases
            .iter()
            .find(|(from, to)| **from == self.sentinel || **to == self.sentinel)
        {
            Some((from, to)) => Err(ConfigError::ReservedAlias {
                from: from.clone(),
                to: to.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Maps a requested name onto the name the registry knows it by. Aliases
    /// touching the sentinel are ignored.
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        if name == self.sentinel {
            return name;
        }

        match self.aliases.get(name) {
            Some(target) if *target != self.sentinel => target.as_str(),
            _ => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_forward_only() {
        assert!(State::Inited.can_become(State::Fetching));
        assert!(State::Fetching.can_become(State::Fetched));
        assert!(State::Fetched.can_become(State::Executing));
        assert!(State::Executing.can_become(State::Executed));

        assert!(!State::Fetched.can_become(State::Fetching));
        assert!(!State::Executing.can_become(State::Executing));
        assert!(!State::Executed.can_become(State::Executing));
        assert!(!State::Executed.can_become(State::Error));
        assert!(!State::Error.can_become(State::Fetched));
    }

    #[test]
    fn test_error_reachable_before_completion() {
        for state in [State::Inited, State::Fetching, State::Fetched] {
            assert!(state.can_become(State::Error), "{state:?}");
        }
    }

    #[test]
    fn test_exports_downcast() {
        let exports = Exports::new(42_u32);
        assert_eq!(exports.get::<u32>(), Some(&42));
        assert_eq!(exports.get::<i64>(), None);
        assert!(Exports::none().get::<u32>().is_none());
        assert!(Exports::default().is_none());
    }

    #[test]
    fn test_options_defaults() {
        let options = Options::from_json("{}").unwrap();
        assert_eq!(options.sentinel, "require");
        assert!(options.aliases.is_empty());
    }

    #[test]
    fn test_options_aliases() {
        let options =
            Options::from_json(r#"{"sentinel":"load","aliases":{"jq":"jquery"}}"#).unwrap();

        assert_eq!(options.sentinel, "load");
        assert_eq!(options.canonical("jq"), "jquery");
        assert_eq!(options.canonical("jquery"), "jquery");
    }

    #[test]
    fn test_options_reject_sentinel_aliases() {
        assert!(matches!(
            Options::from_json(r#"{"aliases":{"r":"require"}}"#),
            Err(ConfigError::ReservedAlias { .. })
        ));
        assert!(matches!(
            Options::from_json(r#"{"aliases":{"require":"loader"}}"#),
            Err(ConfigError::ReservedAlias { .. })
        ));
        assert!(matches!(
            Options::from_json(r#"{"sentinel":"load","aliases":{"require":"loader"}}"#),
            Ok(_)
        ));
    }

    #[test]
    fn test_canonical_ignores_sentinel_aliases() {
        let options = Options {
            aliases: BTreeMap::from([
                ("r".to_string(), "require".to_string()),
                ("require".to_string(), "loader".to_string()),
            ]),
            ..Options::default()
        };

        assert!(options.validate().is_err());
        assert_eq!(options.canonical("r"), "r");
        assert_eq!(options.canonical("require"), "require");
    }

    #[test]
    fn test_options_malformed() {
        assert!(matches!(
            Options::from_json(r#"{"aliases": []}"#),
            Err(ConfigError::Options(_))
        ));
    }
}
