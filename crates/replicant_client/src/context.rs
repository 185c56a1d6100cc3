//! Per-domain replication context.

use replicant_protocol::SchemaRegistry;

/// Shared context for one isolated replication domain.
///
/// Constructed once and passed by reference to every component; multiple
/// isolated domains are simply multiple contexts. There is no hidden
/// process-wide state.
#[derive(Debug, Clone)]
pub struct ReplicantContext {
    registry: SchemaRegistry,
}

impl ReplicantContext {
    /// Creates a context around a schema registry.
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    /// The domain's schema registry.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }
}
