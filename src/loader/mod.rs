//! Fetchers turn module names into delivered source.
//!
//! The resolver never looks at how source is obtained. It hands every module
//! it needs to a [`Fetcher`] together with a [`Completion`], and waits for the
//! completion to report back.

mod pool;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::engine::Completion;
use crate::unit::Definition;

pub use pool::PoolFetcher;

/// Retrieves the source of a module.
///
/// An implementation must eventually consume `completion` exactly once, from
/// any thread, with the outcome of fetching `name`. Fetches may finish in any
/// order.
pub trait Fetcher {
    fn fetch(&mut self, name: &str, completion: Completion);
}

impl<F> Fetcher for F
where
    F: FnMut(&str, Completion),
{
    fn fetch(&mut self, name: &str, completion: Completion) {
        self(name, completion)
    }
}

#[derive(Default)]
struct Manual {
    requested: Vec<String>,
    pending: HashMap<String, Completion>,
}

/// Fetcher that holds on to every completion until the host reports an
/// outcome for it by name.
///
/// Clones share their state, so a clone kept outside of the resolver can
/// drive the fetches the resolver started.
#[derive(Clone, Default)]
pub struct ManualFetcher {
    inner: Arc<Mutex<Manual>>,
}

impl ManualFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Manual> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every name ever handed to this fetcher, in request order.
    pub fn requested(&self) -> Vec<String> {
        self.lock().requested.clone()
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.lock().pending.contains_key(name)
    }

    /// Names still waiting for an outcome, sorted.
    pub fn pending(&self) -> Vec<String> {
        let mut pending: Vec<_> = self.lock().pending.keys().cloned().collect();
        pending.sort();
        pending
    }

    /// Takes the completion for `name` so it can be reported on elsewhere.
    pub fn take(&self, name: &str) -> Option<Completion> {
        self.lock().pending.remove(name)
    }

    /// Delivers source for `name` that declares `definition`. Returns `false`
    /// if no fetch of `name` is outstanding.
    pub fn define(&self, name: &str, definition: Definition) -> bool {
        let Some(completion) = self.take(name) else {
            return false;
        };

        if let Err(error) = completion.define(definition) {
            tracing::warn!("source of '{name}' is malformed: {error}");
        }
        true
    }

    /// Delivers source for `name` that does not declare anything.
    pub fn succeed(&self, name: &str) -> bool {
        match self.take(name) {
            Some(completion) => {
                completion.succeed();
                true
            }
            None => false,
        }
    }

    pub fn fail(&self, name: &str, error: impl Into<anyhow::Error>) -> bool {
        match self.take(name) {
            Some(completion) => {
                completion.fail(error);
                true
            }
            None => false,
        }
    }
}

impl Fetcher for ManualFetcher {
    fn fetch(&mut self, name: &str, completion: Completion) {
        let mut manual = self.lock();
        manual.requested.push(name.to_string());
        manual.pending.insert(name.to_string(), completion);
    }
}

impl std::fmt::Debug for ManualFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let manual = self.lock();
        f.debug_struct("ManualFetcher")
            .field("requested", &manual.requested)
            .field("pending", &manual.pending.len())
            .finish()
    }
}
