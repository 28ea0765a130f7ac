use stowage_core::TenantId;

use crate::RealtimeEvent;

/// Messages bound to a single tenant (workspace).
///
/// Consumers pinned to one tenant use this to drop messages that belong to
/// another, e.g. a feed frame that arrives just after a workspace switch.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl TenantScoped for RealtimeEvent {
    fn tenant_id(&self) -> TenantId {
        self.workspace_id
    }
}
