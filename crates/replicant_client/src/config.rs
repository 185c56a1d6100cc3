//! Configuration for the client runtime.

/// Configuration for a [`crate::Connector`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum entity changes applied per scheduler tick.
    pub changes_per_tick: usize,
    /// Maximum entity links performed per scheduler tick.
    pub links_per_tick: usize,
    /// Whether to validate the entity world after each change-set.
    pub validate_entities: bool,
    /// Number of convergence passes an unreferenced area of interest
    /// survives before it is disposed.
    pub orphan_grace_passes: u32,
}

impl ClientConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            changes_per_tick: 100,
            links_per_tick: 100,
            validate_entities: true,
            orphan_grace_passes: 2,
        }
    }

    /// Sets the entity-change batch size per tick.
    pub fn with_changes_per_tick(mut self, count: usize) -> Self {
        self.changes_per_tick = count;
        self
    }

    /// Sets the entity-link batch size per tick.
    pub fn with_links_per_tick(mut self, count: usize) -> Self {
        self.links_per_tick = count;
        self
    }

    /// Disables world validation (performance-sensitive deployments).
    pub fn without_validation(mut self) -> Self {
        self.validate_entities = false;
        self
    }

    /// Sets the orphan grace pass count.
    pub fn with_orphan_grace_passes(mut self, passes: u32) -> Self {
        self.orphan_grace_passes = passes;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}
