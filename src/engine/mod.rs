//! The resolution engine.
//!
//! A [`Resolver`] owns every unit it has seen and drives them through their
//! lifecycle. It is a small state machine fed by two kinds of input:
//!
//! * calls made by the host ([`Resolver::define`], [`Resolver::require`],
//!   [`Resolver::listen`]), handled immediately, and
//! * messages from collaborators (fetch outcomes through a [`Completion`],
//!   nested requests through a [`Require`]), which travel over a channel and
//!   are picked up on the next turn.
//!
//! ## Turns
//!
//! Nothing that reacts to a unit finishing happens inside the call that
//! finished it. Dependents are notified through jobs that run on a later turn
//! ([`Resolver::tick`]), so a unit's callback always returns before any of its
//! dependents observe its value, and a long chain of ready units is walked one
//! turn at a time instead of recursing through the whole graph.
//!
//! ## Reference counting
//!
//! Every unit counts the dependencies it still waits for. When a dependency
//! executes, each waiter is decremented once per occurrence of the name in its
//! list; the decrement that reaches zero runs the unit. A dependency that
//! would close a cycle back to the unit is not counted at all, its argument is
//! filled with whatever value exists when the unit runs.

mod aggregate;
mod diagnostics;
mod graph;
pub(crate) mod queue;

#[cfg(test)]
mod tests;

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};

use crate::args::{Argument, Arguments};
use crate::core::{ArcStr, Dynamic, Exports, Options, State, UnitId};
use crate::engine::aggregate::{CompletionAggregator, FailureFn, Firing, Member, SuccessFn};
use crate::engine::graph::DependencyGraph;
use crate::engine::queue::{Event, Job};
use crate::error::{ConfigError, ResolveError};
use crate::loader::Fetcher;
use crate::registry::Registry;
use crate::unit::{Definition, Unit};

pub use crate::engine::diagnostics::{Diagnostics, UnitReport};
pub use crate::engine::queue::{Completion, Require};

/// Client side module dependency resolver.
///
/// `F` is the collaborator that turns a module name into delivered source,
/// see [`Fetcher`].
pub struct Resolver<F> {
    options: Options,
    fetcher: F,
    registry: Registry,
    graph: DependencyGraph,
    groups: CompletionAggregator,
    jobs: VecDeque<Job>,
    sender: Sender<Event>,
    receiver: Receiver<Event>,
}

impl<F: Fetcher> Resolver<F> {
    pub fn new(fetcher: F) -> Self {
        Self::with_options(fetcher, Options::default())
    }

    /// Aliases that touch the sentinel are rejected by [`Options::validate`];
    /// when options are built by hand such aliases are ignored.
    pub fn with_options(fetcher: F, options: Options) -> Self {
        if let Err(error) = options.validate() {
            tracing::warn!("{error}, ignoring it");
        }

        let (sender, receiver) = channel();

        Self {
            options,
            fetcher,
            registry: Registry::new(),
            graph: DependencyGraph::new(),
            groups: CompletionAggregator::new(),
            jobs: VecDeque::new(),
            sender,
            receiver,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn fetcher_mut(&mut self) -> &mut F {
        &mut self.fetcher
    }

    /// Declares a named module.
    ///
    /// Declaring a name that already has a definition is a no-op returning the
    /// existing unit. If every dependency is already satisfied the module runs
    /// before this call returns.
    pub fn define(&mut self, definition: Definition) -> Result<UnitId, ConfigError> {
        definition.validate(&self.options.sentinel)?;

        match definition.name.clone() {
            Some(name) => Ok(self.register(name, definition)),
            None => Err(ConfigError::AnonymousDefine),
        }
    }

    /// Runs `on_ready` once every module in `dependencies` has executed.
    ///
    /// This creates a one-off task. The task is looked at on the next turn, so
    /// even with no dependencies the callback never runs inside this call.
    pub fn require<I, S, R>(&mut self, dependencies: I, on_ready: R) -> Result<UnitId, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        R: FnOnce(Arguments) -> anyhow::Result<Exports> + Send + 'static,
    {
        self.request(Definition::new().depends_on(dependencies).on_ready(on_ready))
    }

    /// Dynamic request in its full shape, including an error callback.
    pub fn request(&mut self, definition: Definition) -> Result<UnitId, ConfigError> {
        definition.validate_request(&self.options.sentinel)?;
        Ok(self.spawn_task(definition))
    }

    /// Runs `on_success` with the values of `names` once all of them have
    /// executed, without creating a unit of its own.
    pub fn listen<I, S, R>(&mut self, names: I, on_success: R) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        R: FnOnce(Arguments) + Send + 'static,
    {
        self.subscribe_group(names, Box::new(on_success), None)
    }

    /// Like [`listen`](Self::listen), and runs `on_failure` instead if any of
    /// `names` fails.
    pub fn listen_or_else<I, S, R, E>(
        &mut self,
        names: I,
        on_success: R,
        on_failure: E,
    ) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        R: FnOnce(Arguments) + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        self.subscribe_group(names, Box::new(on_success), Some(Box::new(on_failure)))
    }

    /// Runs a single turn: every job queued before the turn started, together
    /// with the messages delivered so far. Work scheduled during the turn is
    /// left for the next one. Returns the number of jobs processed.
    pub fn tick(&mut self) -> usize {
        while let Ok(event) = self.receiver.try_recv() {
            self.jobs.push_back(Job::Event(event));
        }

        let turn = self.jobs.len();
        for _ in 0..turn {
            let Some(job) = self.jobs.pop_front() else {
                break;
            };
            self.process(job);
        }

        turn
    }

    /// Runs turns until there is nothing left to do right now. Fetches that
    /// have not reported back are not waited for.
    pub fn run_until_idle(&mut self) -> usize {
        let mut processed = 0;

        loop {
            match self.tick() {
                0 => return processed,
                n => processed += n,
            }
        }
    }

    /// Runs turns and blocks for fetch outcomes until no fetch is outstanding.
    ///
    /// There is no timeout: a fetcher that holds on to its [`Completion`]
    /// forever blocks this call forever.
    pub fn run_until_settled(&mut self) -> usize {
        let mut processed = self.run_until_idle();

        while self.in_flight() > 0 {
            match self.receiver.recv() {
                Ok(event) => self.jobs.push_back(Job::Event(event)),
                Err(_) => break,
            }
            processed += self.run_until_idle();
        }

        processed
    }

    /// Number of modules whose fetch has started but not finished.
    pub fn in_flight(&self) -> usize {
        self.registry
            .units()
            .filter(|unit| unit.state == State::Fetching)
            .count()
    }

    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn state(&self, name: &str) -> Option<State> {
        self.registry
            .by_name(self.options.canonical(name))
            .map(|unit| unit.state)
    }

    pub fn state_of(&self, id: UnitId) -> Option<State> {
        self.registry.state(id)
    }

    /// The value produced by module `name`, if it has executed and produced
    /// anything.
    pub fn exports(&self, name: &str) -> Option<Dynamic> {
        self.registry
            .by_name(self.options.canonical(name))
            .and_then(Unit::exports)
            .and_then(|exports| exports.value().cloned())
    }

    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.registry
            .by_name(self.options.canonical(name))
            .and_then(Unit::exports)
            .and_then(Exports::get::<T>)
    }

    pub fn inspect(&self, id: UnitId) -> Option<UnitReport> {
        self.registry
            .get(id)
            .map(|unit| UnitReport::new(unit, &self.graph))
    }

    pub fn module(&self, name: &str) -> Option<UnitReport> {
        self.registry
            .lookup(self.options.canonical(name))
            .and_then(|id| self.inspect(id))
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let mut units = Vec::with_capacity(self.registry.len());
        units.extend(
            self.registry
                .units()
                .map(|unit| UnitReport::new(unit, &self.graph)),
        );

        Diagnostics { units }
    }

    fn is_sentinel(&self, name: &str) -> bool {
        name == self.options.sentinel
    }

    fn canonical(&self, name: &str) -> ArcStr {
        ArcStr::from(self.options.canonical(name))
    }

    fn canonical_all(&self, names: &[ArcStr]) -> Vec<ArcStr> {
        names
            .iter()
            .map(|name| match self.is_sentinel(name) {
                true => name.clone(),
                false => self.canonical(name),
            })
            .collect()
    }

    fn require_handle(&self) -> Require {
        Require::new(self.options.sentinel.as_str().into(), self.sender.clone())
    }

    /// Returns the module known as `name`, creating it and starting its fetch
    /// on first reference.
    fn acquire(&mut self, name: &str) -> UnitId {
        let (id, created) = self.registry.get_or_create(name);
        if created {
            self.start_fetch(id);
        }
        id
    }

    fn start_fetch(&mut self, id: UnitId) {
        let Some(unit) = self.registry.get_mut(id) else {
            return;
        };
        let Some(name) = unit.name().cloned() else {
            return;
        };
        if !unit.transition(State::Fetching) {
            return;
        }

        let completion = Completion::new(name.clone(), self.sender.clone());
        self.fetcher.fetch(&name, completion);
    }

    fn register(&mut self, name: ArcStr, definition: Definition) -> UnitId {
        let name = self.canonical(&name);
        let dependencies = self.canonical_all(&definition.dependencies);

        let id = match self.registry.lookup(&name) {
            Some(id) => id,
            None => self.registry.insert_defined(&name),
        };

        let Some(unit) = self.registry.get_mut(id) else {
            return id;
        };

        if unit.defined || unit.state.is_terminal() {
            tracing::warn!("{unit} is already defined, ignoring the new definition");
            return id;
        }

        if unit.state != State::Fetched && !unit.transition(State::Fetched) {
            return id;
        }

        unit.attach(definition, dependencies);
        self.analyze(id);
        id
    }

    fn spawn_task(&mut self, definition: Definition) -> UnitId {
        let dependencies = self.canonical_all(&definition.dependencies);
        let id = self.registry.create_task();

        if let Some(unit) = self.registry.get_mut(id) {
            unit.attach(definition, dependencies);
            tracing::debug!("{unit} created");
        }

        self.jobs.push_back(Job::Start(id));
        id
    }

    fn subscribe_group<I, S>(
        &mut self,
        names: I,
        on_success: SuccessFn,
        on_failure: Option<FailureFn>,
    ) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<ArcStr> = names
            .into_iter()
            .map(|name| ArcStr::from(name.as_ref()))
            .collect();

        for (position, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyDependency { position });
            }
            if self.is_sentinel(name) {
                return Err(ConfigError::ReservedName(name.to_string()));
            }
        }

        let names: Vec<ArcStr> = names.iter().map(|name| self.canonical(name)).collect();

        for name in &names {
            let id = self.acquire(name);
            let member = match self.registry.state(id) {
                Some(State::Executed) => Member::Resolved,
                Some(State::Error) => Member::Rejected,
                _ => Member::Pending,
            };
            self.groups.track(name.clone(), member);
        }

        self.groups.listen(names, on_success, on_failure);
        self.jobs.push_back(Job::Evaluate);
        Ok(())
    }

    fn process(&mut self, job: Job) {
        match job {
            Job::Event(Event::Fetched { name, outcome }) => self.fetched(name, outcome),
            Job::Event(Event::Request(definition)) => {
                match definition.validate_request(&self.options.sentinel) {
                    Ok(()) => {
                        self.spawn_task(definition);
                    }
                    Err(error) => tracing::warn!("discarding nested request: {error}"),
                }
            }
            Job::Start(id) => self.analyze(id),
            Job::Notify { waiter, dependency } => {
                tracing::trace!("{waiter} notified by {dependency}");
                let ready = self
                    .registry
                    .get_mut(waiter)
                    .is_some_and(|unit| unit.settle_one());
                if ready {
                    self.execute(waiter);
                }
            }
            Job::Reject {
                waiter,
                dependency,
                cause,
            } => self.reject(waiter, dependency, cause),
            Job::Settle { name, member } => {
                self.groups.notify(name, member);
                self.evaluate_groups();
            }
            Job::Evaluate => self.evaluate_groups(),
        }
    }

    fn fetched(&mut self, name: ArcStr, outcome: anyhow::Result<Option<Definition>>) {
        let Some(id) = self.registry.lookup(&name) else {
            tracing::warn!("received '{name}' which was never requested");
            return;
        };

        match outcome {
            Ok(Some(mut definition)) => {
                let declared = definition.name.get_or_insert_with(|| name.clone()).clone();

                if let Err(error) = definition.validate(&self.options.sentinel) {
                    if self.registry.state(id) != Some(State::Fetching) {
                        tracing::warn!("discarding malformed definition of '{name}': {error}");
                        return;
                    }
                    let error = ResolveError::Fetch {
                        name: name.to_string(),
                        error: Arc::new(anyhow::Error::new(error)),
                    };
                    self.fail(id, error);
                    return;
                }

                self.register(declared, definition);
                self.loaded(id);
            }
            Ok(None) => self.loaded(id),
            Err(error) => match self.registry.state(id) {
                Some(State::Fetching) => {
                    let error = ResolveError::Fetch {
                        name: name.to_string(),
                        error: Arc::new(error),
                    };
                    self.fail(id, error);
                }
                _ => tracing::debug!("ignoring late failure for '{name}': {error}"),
            },
        }
    }

    /// The source of `id` has been delivered. A module whose source did not
    /// define it produces nothing.
    fn loaded(&mut self, id: UnitId) {
        let Some(unit) = self.registry.get_mut(id) else {
            return;
        };
        if unit.defined || unit.state != State::Fetching {
            return;
        }

        tracing::debug!("{unit} was loaded without a definition");
        unit.transition(State::Fetched);
        unit.defined = true;
        self.analyze(id);
    }

    /// Counts what `id` has to wait for and subscribes it to those units.
    fn analyze(&mut self, id: UnitId) {
        let Some(unit) = self.registry.get(id) else {
            return;
        };
        if unit.state != State::Fetched {
            return;
        }
        let label = unit.to_string();
        let dependencies = unit.dependencies.clone();

        let mut awaited = Vec::with_capacity(dependencies.len());
        let mut requires_self_reference = false;
        let mut excluded = 0;

        for name in &dependencies {
            if self.is_sentinel(name) {
                requires_self_reference = true;
                continue;
            }

            let dependency = self.acquire(name);
            if self.graph.forms_cycle(id, dependency) {
                tracing::debug!("{label}: '{name}' closes a cycle, not waiting for it");
                excluded += 1;
                continue;
            }

            awaited.push(dependency);
        }

        if let Some(unit) = self.registry.get_mut(id) {
            unit.pending = awaited.len();
            unit.requires_self_reference = requires_self_reference;
        }

        tracing::debug!(
            pending = awaited.len(),
            excluded,
            "{label}: analysed {} dependencies",
            dependencies.len()
        );

        if awaited.is_empty() {
            self.execute(id);
            return;
        }

        for dependency in awaited {
            match self.registry.get(dependency).map(|unit| unit.state) {
                Some(State::Executed) => {
                    self.jobs.push_back(Job::Notify {
                        waiter: id,
                        dependency,
                    });
                }
                Some(State::Error) => {
                    let cause = self.failure_of(dependency);
                    self.jobs.push_back(Job::Reject {
                        waiter: id,
                        dependency,
                        cause,
                    });
                }
                _ => self.graph.subscribe(id, dependency),
            }
        }
    }

    fn failure_of(&self, id: UnitId) -> ResolveError {
        let unit = self.registry.get(id);

        match unit.and_then(|unit| unit.failure.clone()) {
            Some(error) => error,
            None => ResolveError::Fetch {
                name: unit
                    .and_then(Unit::name)
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                error: Arc::new(anyhow::anyhow!("unit failed")),
            },
        }
    }

    fn arguments(&self, dependencies: &[ArcStr]) -> Arguments {
        let items = dependencies
            .iter()
            .map(|name| {
                if self.is_sentinel(name) {
                    return Argument::Require(self.require_handle());
                }

                self.registry
                    .by_name(name)
                    .and_then(Unit::exports)
                    .and_then(|exports| exports.value().cloned())
                    .map_or(Argument::Undefined, Argument::Value)
            })
            .collect();

        Arguments::new(items)
    }

    fn execute(&mut self, id: UnitId) {
        let Some(unit) = self.registry.get_mut(id) else {
            return;
        };
        if unit.state != State::Fetched || !unit.transition(State::Executing) {
            return;
        }

        let label = unit.to_string();
        let on_ready = unit.on_ready.take();
        let dependencies = unit.dependencies.clone();
        let args = self.arguments(&dependencies);

        let result = {
            let span = tracing::info_span!("execute", unit = %label);
            let _enter = span.enter();

            match on_ready {
                Some(callback) => shielded(move || callback(args)).and_then(|result| result),
                None => Ok(Exports::none()),
            }
        };

        match result {
            Ok(exports) => {
                if let Some(unit) = self.registry.get_mut(id) {
                    if unit.produced.set(exports).is_err() {
                        tracing::error!("{unit} produced a value twice");
                    }
                    unit.transition(State::Executed);
                }
                tracing::info!("{label} executed");
                self.publish(id);
            }
            Err(error) => {
                let error = ResolveError::Execution {
                    unit: label,
                    error: Arc::new(error),
                };
                self.fail(id, error);
            }
        }
    }

    /// Schedules the notification of everything waiting on `id`.
    fn publish(&mut self, id: UnitId) {
        for waiter in self.graph.release(id) {
            self.jobs.push_back(Job::Notify {
                waiter,
                dependency: id,
            });
        }

        if let Some(name) = self.registry.get(id).and_then(Unit::name).cloned() {
            self.jobs.push_back(Job::Settle {
                name,
                member: Member::Resolved,
            });
        }
    }

    fn fail(&mut self, id: UnitId, error: ResolveError) {
        let Some(unit) = self.registry.get_mut(id) else {
            return;
        };
        if !unit.transition(State::Error) {
            return;
        }

        let label = unit.to_string();
        let name = unit.name().cloned();
        let on_error = unit.on_error.take();
        unit.on_ready = None;
        unit.failure = Some(error.clone());

        match on_error {
            Some(callback) => {
                if let Err(panic) = shielded(|| callback(&error)) {
                    tracing::error!("{label}: error callback failed: {panic}");
                }
            }
            None => tracing::warn!("{label} failed and has no error callback: {error}"),
        }

        for waiter in self.graph.release(id) {
            self.jobs.push_back(Job::Reject {
                waiter,
                dependency: id,
                cause: error.clone(),
            });
        }

        if let Some(name) = name {
            self.jobs.push_back(Job::Settle {
                name,
                member: Member::Rejected,
            });
        }
    }

    fn reject(&mut self, waiter: UnitId, dependency: UnitId, cause: ResolveError) {
        let Some(unit) = self.registry.get(waiter) else {
            return;
        };
        if unit.state.is_terminal() {
            return;
        }

        let error = ResolveError::Dependency {
            unit: unit.to_string(),
            dependency: self
                .registry
                .get(dependency)
                .and_then(Unit::name)
                .map(ToString::to_string)
                .unwrap_or_default(),
            cause: Arc::new(cause),
        };

        self.fail(waiter, error);
    }

    fn evaluate_groups(&mut self) {
        if !self.groups.has_open_groups() {
            return;
        }

        for firing in self.groups.evaluate(&self.registry) {
            match firing {
                Firing::Success(callbacks, args) => {
                    for callback in callbacks {
                        let args = args.clone();
                        if let Err(error) = shielded(move || callback(args)) {
                            tracing::error!("group callback failed: {error}");
                        }
                    }
                }
                Firing::Failure(callbacks) => {
                    if callbacks.is_empty() {
                        tracing::warn!("group failed and has no failure callback");
                    }
                    for callback in callbacks {
                        if let Err(error) = shielded(callback) {
                            tracing::error!("group failure callback failed: {error}");
                        }
                    }
                }
            }
        }
    }
}

/// Runs user code, turning a panic into an error so that one misbehaving
/// callback only fails its own unit.
fn shielded<R>(callback: impl FnOnce() -> R) -> anyhow::Result<R> {
    std::panic::catch_unwind(AssertUnwindSafe(callback)).map_err(|panic| {
        if let Some(s) = panic.downcast_ref::<&str>() {
            anyhow::anyhow!("callback panicked: {s}")
        } else if let Some(s) = panic.downcast_ref::<String>() {
            anyhow::anyhow!("callback panicked: {s}")
        } else {
            anyhow::anyhow!("callback panicked with unknown payload")
        }
    })
}
