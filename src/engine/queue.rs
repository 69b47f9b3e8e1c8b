use std::sync::mpsc::Sender;

use crate::args::Arguments;
use crate::core::{ArcStr, Exports, UnitId};
use crate::engine::aggregate::Member;
use crate::error::{ConfigError, ResolveError};
use crate::unit::Definition;

/// Messages delivered to a resolver by its collaborators.
pub(crate) enum Event {
    Fetched {
        name: ArcStr,
        outcome: anyhow::Result<Option<Definition>>,
    },
    Request(Definition),
}

/// Work deferred to a later turn of the resolver.
pub(crate) enum Job {
    Event(Event),
    /// Analyse the dependencies of a freshly created task.
    Start(UnitId),
    /// `dependency` executed, `waiter` has one less thing to wait for.
    Notify { waiter: UnitId, dependency: UnitId },
    /// `dependency` failed, so `waiter` never will run.
    Reject {
        waiter: UnitId,
        dependency: UnitId,
        cause: ResolveError,
    },
    /// A named unit reached a terminal state; update completion groups.
    Settle { name: ArcStr, member: Member },
    /// Re-check completion groups without any state change.
    Evaluate,
}

/// Single-use handle through which a [`Fetcher`](crate::Fetcher) reports the
/// outcome of fetching one module.
///
/// Every method consumes the handle, so an outcome can be reported only once.
/// A handle that is dropped without reporting anything counts as a failed
/// fetch, so a lost handle never leaves its dependents waiting.
pub struct Completion {
    name: ArcStr,
    sender: Option<Sender<Event>>,
}

impl Completion {
    pub(crate) fn new(name: ArcStr, sender: Sender<Event>) -> Self {
        Self {
            name,
            sender: Some(sender),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The source arrived and declared a module. An anonymous definition takes
    /// the fetched name.
    ///
    /// A malformed definition is reported back to the caller, and the fetch
    /// counts as failed.
    pub fn define(self, definition: Definition) -> Result<(), ConfigError> {
        // The sentinel is resolver configuration; the resolver validates the
        // name against it when the definition arrives.
        if let Err(error) = definition.validate("") {
            let message = error.to_string();
            self.finish(Err(anyhow::anyhow!(message)));
            return Err(error);
        }

        self.finish(Ok(Some(definition)));
        Ok(())
    }

    /// The source arrived but did not declare anything.
    pub fn succeed(self) {
        self.finish(Ok(None));
    }

    pub fn fail(self, error: impl Into<anyhow::Error>) {
        self.finish(Err(error.into()));
    }

    fn finish(mut self, outcome: anyhow::Result<Option<Definition>>) {
        if let Some(sender) = self.sender.take() {
            let name = self.name.clone();
            if sender.send(Event::Fetched { name, outcome }).is_err() {
                tracing::debug!("resolver dropped before fetch of '{}' finished", self.name);
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            tracing::warn!("fetch of '{}' was abandoned", self.name);
            let outcome = Err(anyhow::anyhow!("fetch of '{}' was abandoned", self.name));
            let _ = sender.send(Event::Fetched {
                name: self.name.clone(),
                outcome,
            });
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("name", &self.name).finish()
    }
}

/// The dynamic resolution capability.
///
/// It is injected in place of the sentinel dependency name and lets a running
/// callback issue further requests. Requests are validated immediately and
/// picked up by the resolver on its next turn.
#[derive(Clone)]
pub struct Require {
    sentinel: ArcStr,
    sender: Sender<Event>,
}

impl Require {
    pub(crate) fn new(sentinel: ArcStr, sender: Sender<Event>) -> Self {
        Self { sentinel, sender }
    }

    pub fn require<I, S, F>(&self, dependencies: I, on_ready: F) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnOnce(Arguments) -> anyhow::Result<Exports> + Send + 'static,
    {
        self.request(Definition::new().depends_on(dependencies).on_ready(on_ready))
    }

    pub fn request(&self, definition: Definition) -> Result<(), ConfigError> {
        definition.validate_request(&self.sentinel)?;

        if self.sender.send(Event::Request(definition)).is_err() {
            tracing::debug!("resolver dropped, request discarded");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Require {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Require")
            .field("sentinel", &self.sentinel)
            .finish_non_exhaustive()
    }
}
