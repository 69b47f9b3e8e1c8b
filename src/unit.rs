use std::cell::OnceCell;
use std::fmt::Display;

use crate::args::Arguments;
use crate::core::{ArcStr, Exports, State, UnitId};
use crate::error::{ConfigError, ResolveError};

pub(crate) type ReadyFn = Box<dyn FnOnce(Arguments) -> anyhow::Result<Exports> + Send>;
pub(crate) type ErrorFn = Box<dyn FnOnce(&ResolveError) + Send>;

/// The shape of a resolution request.
///
/// The same builder describes a static module declaration (with a name) and a
/// dynamic request (without one). Nothing is checked until the definition is
/// submitted, at which point malformed shapes are rejected with a
/// [`ConfigError`].
///
/// ```rust
/// use tsunagi::{Definition, Exports};
///
/// let definition = Definition::named("greeter")
///     .depends_on(["require", "strings"])
///     .on_ready(|args| {
///         let greeting = args.get::<String>(1).cloned().unwrap_or_default();
///         Ok(Exports::new(greeting))
///     });
/// ```
#[derive(Default)]
pub struct Definition {
    pub(crate) name: Option<ArcStr>,
    pub(crate) dependencies: Vec<ArcStr>,
    pub(crate) on_ready: Option<ReadyFn>,
    pub(crate) on_error: Option<ErrorFn>,
}

impl Definition {
    /// An anonymous definition, named after the location it was fetched from.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl AsRef<str>) -> Self {
        Self {
            name: Some(name.as_ref().into()),
            ..Self::default()
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.dependencies = dependencies
            .into_iter()
            .map(|name| ArcStr::from(name.as_ref()))
            .collect();
        self
    }

    pub fn on_ready<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Arguments) -> anyhow::Result<Exports> + Send + 'static,
    {
        self.on_ready = Some(Box::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&ResolveError) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Shortcut for a success callback that ignores its arguments and
    /// produces `value`.
    pub fn value<T>(self, value: T) -> Self
    where
        T: std::any::Any + Send + Sync,
    {
        self.on_ready(move |_| Ok(Exports::new(value)))
    }

    pub(crate) fn validate(&self, sentinel: &str) -> Result<(), ConfigError> {
        if self.on_ready.is_none() {
            return Err(ConfigError::MissingCallback);
        }

        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if name.as_ref() == sentinel {
                return Err(ConfigError::ReservedName(name.to_string()));
            }
        }

        match self.dependencies.iter().position(|d| d.trim().is_empty()) {
            Some(position) => Err(ConfigError::EmptyDependency { position }),
            None => Ok(()),
        }
    }

    pub(crate) fn validate_request(&self, sentinel: &str) -> Result<(), ConfigError> {
        if let Some(name) = &self.name {
            return Err(ConfigError::NamedRequest(name.to_string()));
        }
        self.validate(sentinel)
    }
}

impl std::fmt::Debug for Definition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Definition")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Kind {
    Module { name: ArcStr },
    Task,
}

/// A resolvable unit, either a named module or a one-off task.
pub(crate) struct Unit {
    pub id: UnitId,
    pub kind: Kind,
    pub dependencies: Vec<ArcStr>,
    pub state: State,
    pub pending: usize,
    /// Whether a definition has been attached; a module that is still being
    /// fetched has none yet.
    pub defined: bool,
    pub requires_self_reference: bool,
    pub on_ready: Option<ReadyFn>,
    pub on_error: Option<ErrorFn>,
    pub produced: OnceCell<Exports>,
    pub failure: Option<ResolveError>,
}

impl Unit {
    pub fn new(id: UnitId, kind: Kind, state: State) -> Self {
        Self {
            id,
            kind,
            dependencies: Vec::new(),
            state,
            pending: 0,
            defined: false,
            requires_self_reference: false,
            on_ready: None,
            on_error: None,
            produced: OnceCell::new(),
            failure: None,
        }
    }

    pub fn name(&self) -> Option<&ArcStr> {
        match &self.kind {
            Kind::Module { name } => Some(name),
            Kind::Task => None,
        }
    }

    /// Attaches the body of a definition; the name has already been used to
    /// find this unit.
    pub fn attach(&mut self, definition: Definition, dependencies: Vec<ArcStr>) {
        self.dependencies = dependencies;
        self.on_ready = definition.on_ready;
        self.on_error = definition.on_error;
        self.defined = true;
    }

    /// Moves the unit to `next` if the lifecycle allows it.
    pub fn transition(&mut self, next: State) -> bool {
        if !self.state.can_become(next) {
            tracing::debug!("{self}: refusing transition {:?} -> {:?}", self.state, next);
            return false;
        }

        tracing::debug!("{self}: {:?} -> {:?}", self.state, next);
        self.state = next;
        true
    }

    /// Marks one awaited dependency as ready. Returns `true` exactly once, on
    /// the call that brings the count to zero while the unit is still waiting
    /// to execute.
    pub fn settle_one(&mut self) -> bool {
        if self.pending == 0 {
            return false;
        }

        self.pending -= 1;
        self.pending == 0 && self.state == State::Fetched
    }

    pub fn exports(&self) -> Option<&Exports> {
        self.produced.get()
    }
}

impl Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Module { name } => write!(f, "module '{name}'"),
            Kind::Task => write!(f, "task {}", self.id),
        }
    }
}
