//! Fixed top-level namespaces of the state document.

use std::fmt;

/// An isolated top-level section of the state document, owned by one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Task records and device assignments (task queue).
    Queue,
    /// Location pool.
    Locations,
    /// Contact-identifier pools.
    Resources,
    /// Opaque presentation settings kept for UI consumers.
    Ui,
    /// Worker sessions per device (orchestrator).
    Servers,
}

impl Namespace {
    /// Every namespace, in document order.
    pub const ALL: [Self; 5] = [
        Self::Queue,
        Self::Locations,
        Self::Resources,
        Self::Ui,
        Self::Servers,
    ];

    /// Key of the namespace inside the consolidated document.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Locations => "locations",
            Self::Resources => "resources",
            Self::Ui => "ui",
            Self::Servers => "servers",
        }
    }

    /// Single-purpose file that held this namespace before consolidation.
    #[must_use]
    pub fn legacy_file_name(self) -> &'static str {
        match self {
            Self::Queue => "task-queue.json",
            Self::Locations => "location-state.json",
            Self::Resources => "resources.json",
            Self::Ui => "ui-state.json",
            Self::Servers => "servers.json",
        }
    }

    /// Parse a namespace key.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ns| ns.as_str() == raw)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
