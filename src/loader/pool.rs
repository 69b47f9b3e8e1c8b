use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::engine::Completion;
use crate::loader::Fetcher;
use crate::unit::Definition;

type SourceFn = dyn Fn(&str) -> anyhow::Result<Option<Definition>> + Send + Sync;

/// Fetcher that evaluates a source function on the rayon thread pool.
///
/// The source function plays the part of loading and evaluating a script: it
/// returns the definition the script declares, `None` for a script that
/// declares nothing, or an error if the script could not be loaded.
#[derive(Clone)]
pub struct PoolFetcher {
    source: Arc<SourceFn>,
}

impl PoolFetcher {
    pub fn new<F>(source: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<Option<Definition>> + Send + Sync + 'static,
    {
        Self {
            source: Arc::new(source),
        }
    }
}

impl Fetcher for PoolFetcher {
    fn fetch(&mut self, name: &str, completion: Completion) {
        let source = self.source.clone();
        let name = name.to_string();

        rayon::spawn(move || {
            let span = tracing::debug_span!("fetch", module = %name);
            let _enter = span.enter();

            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| source(&name))) {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        format!("Source panicked: {s}")
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        format!("Source panicked: {s}")
                    } else {
                        "Source panicked with unknown payload".to_string()
                    };
                    Err(anyhow::anyhow!(msg))
                }
            };

            match outcome {
                Ok(Some(definition)) => {
                    if let Err(error) = completion.define(definition) {
                        tracing::warn!("source of '{name}' is malformed: {error}");
                    }
                }
                Ok(None) => completion.succeed(),
                Err(error) => completion.fail(error),
            }
        });
    }
}

impl std::fmt::Debug for PoolFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolFetcher").finish_non_exhaustive()
    }
}
