use std::collections::{BTreeMap, HashMap};

use crate::core::{ArcStr, State, UnitId};
use crate::unit::{Kind, Unit};

/// Table of every unit known to a resolver.
///
/// Units are never removed. Modules are additionally indexed by name, tasks
/// can only be reached through their id.
#[derive(Default)]
pub(crate) struct Registry {
    next: u64,
    units: BTreeMap<UnitId, Unit>,
    modules: HashMap<ArcStr, UnitId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> UnitId {
        self.next += 1;
        UnitId(self.next)
    }

    /// Returns the module registered under `name`, creating it in `Inited` if
    /// it is not known yet. The flag tells whether a new module was created,
    /// in which case the caller is responsible for starting its fetch.
    pub fn get_or_create(&mut self, name: &str) -> (UnitId, bool) {
        if let Some(&id) = self.modules.get(name) {
            return (id, false);
        }

        (self.insert_module(name, State::Inited), true)
    }

    /// Registers a module whose source is already present, so it never needs
    /// to be fetched.
    pub fn insert_defined(&mut self, name: &str) -> UnitId {
        debug_assert!(!self.modules.contains_key(name));
        self.insert_module(name, State::Fetched)
    }

    fn insert_module(&mut self, name: &str, state: State) -> UnitId {
        let id = self.allocate();
        let name = ArcStr::from(name);

        self.modules.insert(name.clone(), id);
        self.units.insert(id, Unit::new(id, Kind::Module { name }, state));
        id
    }

    pub fn create_task(&mut self) -> UnitId {
        let id = self.allocate();
        self.units.insert(id, Unit::new(id, Kind::Task, State::Fetched));
        id
    }

    pub fn lookup(&self, name: &str) -> Option<UnitId> {
        self.modules.get(name).copied()
    }

    pub fn get(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(&id)
    }

    pub fn get_mut(&mut self, id: UnitId) -> Option<&mut Unit> {
        self.units.get_mut(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Unit> {
        self.lookup(name).and_then(|id| self.get(id))
    }

    pub fn state(&self, id: UnitId) -> Option<State> {
        self.get(id).map(|unit| unit.state)
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }
}
