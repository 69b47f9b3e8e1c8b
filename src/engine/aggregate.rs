use std::collections::HashMap;

use crate::args::{Argument, Arguments};
use crate::core::ArcStr;
use crate::registry::Registry;

pub(crate) type SuccessFn = Box<dyn FnOnce(Arguments) + Send>;
pub(crate) type FailureFn = Box<dyn FnOnce() + Send>;

/// Completion state of a single group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Member {
    Pending,
    Resolved,
    Rejected,
}

/// Callbacks waiting on one exact list of names.
struct CompletionGroup {
    names: Box<[ArcStr]>,
    on_success: Vec<SuccessFn>,
    on_failure: Vec<FailureFn>,
    done: bool,
}

impl CompletionGroup {
    fn judge(&self, members: &HashMap<ArcStr, Member>) -> Member {
        let mut pending = false;

        for name in &self.names {
            match members.get(name).copied().unwrap_or(Member::Pending) {
                Member::Rejected => return Member::Rejected,
                Member::Pending => pending = true,
                Member::Resolved => {}
            }
        }

        if pending {
            Member::Pending
        } else {
            Member::Resolved
        }
    }
}

/// A group that settled during [`CompletionAggregator::evaluate`], with the
/// callbacks it owes.
pub(crate) enum Firing {
    Success(Vec<SuccessFn>, Arguments),
    Failure(Vec<FailureFn>),
}

/// Readiness of ad-hoc groups of names, independent of any unit.
///
/// Groups are keyed by the ordered list of names, so the success callbacks
/// receive values in the order they were requested. Rejection wins over
/// pending, pending wins over resolved, the same way a promise combinator
/// settles.
#[derive(Default)]
pub(crate) struct CompletionAggregator {
    members: HashMap<ArcStr, Member>,
    groups: Vec<CompletionGroup>,
    index: HashMap<Box<[ArcStr]>, usize>,
}

impl CompletionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `name` in the given state unless it is tracked already.
    pub fn track(&mut self, name: ArcStr, member: Member) {
        self.members.entry(name).or_insert(member);
    }

    pub fn listen(
        &mut self,
        names: Vec<ArcStr>,
        on_success: SuccessFn,
        on_failure: Option<FailureFn>,
    ) {
        for name in &names {
            self.members.entry(name.clone()).or_insert(Member::Pending);
        }

        let names = names.into_boxed_slice();
        let index = match self.index.get(&names) {
            Some(&index) => index,
            None => {
                self.groups.push(CompletionGroup {
                    names: names.clone(),
                    on_success: Vec::new(),
                    on_failure: Vec::new(),
                    done: false,
                });
                self.index.insert(names, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };

        let group = &mut self.groups[index];
        group.on_success.push(on_success);
        group.on_failure.extend(on_failure);
        group.done = false;
    }

    pub fn notify(&mut self, name: ArcStr, member: Member) {
        self.members.insert(name, member);
    }

    pub fn has_open_groups(&self) -> bool {
        self.groups.iter().any(|group| !group.done)
    }

    /// Settles every open group whose members allow it. The callbacks are
    /// handed back to the caller instead of being run here, so that no user
    /// code runs while the aggregator is borrowed.
    pub fn evaluate(&mut self, registry: &Registry) -> Vec<Firing> {
        let mut firings = Vec::new();

        for group in self.groups.iter_mut().filter(|group| !group.done) {
            match group.judge(&self.members) {
                Member::Pending => continue,
                Member::Rejected => {
                    group.on_success.clear();
                    firings.push(Firing::Failure(std::mem::take(&mut group.on_failure)));
                }
                Member::Resolved => {
                    let args = group
                        .names
                        .iter()
                        .map(|name| {
                            registry
                                .by_name(name)
                                .and_then(|unit| unit.exports())
                                .and_then(|exports| exports.value().cloned())
                                .map_or(Argument::Undefined, Argument::Value)
                        })
                        .collect();

                    group.on_failure.clear();
                    firings.push(Firing::Success(
                        std::mem::take(&mut group.on_success),
                        Arguments::new(args),
                    ));
                }
            }

            group.done = true;
        }

        firings
    }
}
