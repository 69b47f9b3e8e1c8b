use std::fmt::Write;

use serde::Serialize;

use crate::core::{State, UnitId};
use crate::engine::graph::DependencyGraph;
use crate::unit::Unit;

/// Snapshot of a single unit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitReport {
    pub id: UnitId,
    /// `None` for tasks.
    pub name: Option<String>,
    pub state: State,
    /// Dependencies the unit still counts on.
    pub pending: usize,
    /// Declared dependency names, sentinel included.
    pub dependencies: Vec<String>,
    /// Units this one is subscribed to right now.
    pub waiting_on: Vec<UnitId>,
    pub requires_self_reference: bool,
}

impl UnitReport {
    pub(crate) fn new(unit: &Unit, graph: &DependencyGraph) -> Self {
        Self {
            id: unit.id,
            name: unit.name().map(ToString::to_string),
            state: unit.state,
            pending: unit.pending,
            dependencies: unit.dependencies.iter().map(ToString::to_string).collect(),
            waiting_on: graph.waiting_on(unit.id),
            requires_self_reference: unit.requires_self_reference,
        }
    }

    fn label(&self) -> String {
        match &self.name {
            Some(name) => name.replace('"', "\\\""),
            None => format!("task {}", self.id),
        }
    }
}

/// Snapshot of everything a resolver knows, in id order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub units: Vec<UnitReport>,
}

impl Diagnostics {
    /// Units that have not reached a terminal state.
    pub fn stalled(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|unit| !unit.state.is_terminal())
    }

    /// Renders the outstanding waits as a Mermaid diagram, color-coded by
    /// state.
    ///
    /// * **Green**: Executed
    /// * **Red**: Error
    /// * **Yellow**: Fetched or executing, waiting on dependencies
    /// * **Blue**: Not delivered yet
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        for unit in &self.units {
            let color = match unit.state {
                State::Executed => "#90EE90",
                State::Error => "#FF7F7F",
                State::Fetched | State::Executing => "#FFFF99",
                State::Inited | State::Fetching => "#ADD8E6",
            };

            writeln!(
                f,
                "    u{}[\"{}\\n{:?}\"]",
                unit.id.get(),
                unit.label(),
                unit.state
            )
            .unwrap();
            writeln!(f, "    style u{} fill:{}", unit.id.get(), color).unwrap();
        }

        for unit in &self.units {
            for dependency in &unit.waiting_on {
                writeln!(f, "    u{} --> u{}", unit.id.get(), dependency.get()).unwrap();
            }
        }

        f
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
