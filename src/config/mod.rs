use pgrx::{GucContext, GucFlags, GucRegistry, GucSetting};

/// Every trigger managed by this extension starts with this prefix.
/// Reconciliation never touches triggers outside the family.
pub const TRIGGER_PREFIX: &str = "denorm";

/// Trigger functions are named `func_<trigger name>`
pub const FUNCTION_PREFIX: &str = "func_";

/// Source marker for recursive dependencies (a table depending on itself)
pub const SELF_REFERENCE: &str = "self";

/// Schema holding the extension-owned tables
pub const EXTENSION_SCHEMA: &str = "public";

/// Sink table written by trigger bodies
pub const DIRTY_QUEUE_TABLE: &str = "denorm_dirty_instance";

/// Persisted dependency declarations
pub const DEPENDENCY_TABLE: &str = "denorm_dependency";

/// One row per reconciliation run
pub const AUDIT_TABLE: &str = "denorm_audit_log";

/// NAMEDATALEN - 1
pub const MAX_IDENTIFIER_LEN: usize = 63;

static AUDIT_ENABLED: GucSetting<bool> = GucSetting::<bool>::new(true);
static RESOLUTION_CACHE_ENABLED: GucSetting<bool> = GucSetting::<bool>::new(true);

/// Register the extension's GUCs. Called once from `_PG_init`.
pub fn register_gucs() {
    GucRegistry::define_bool_guc(
        "pg_denorm.audit",
        "Record every reconciliation run in denorm_audit_log",
        "When off, reconciliation only reports through the server log.",
        &AUDIT_ENABLED,
        GucContext::Userset,
        GucFlags::default(),
    );

    GucRegistry::define_bool_guc(
        "pg_denorm.resolution_cache",
        "Cache resolved dependencies for the lifetime of the backend",
        "Turn off while altering foreign keys so every run re-reads the catalog.",
        &RESOLUTION_CACHE_ENABLED,
        GucContext::Userset,
        GucFlags::default(),
    );
}

pub fn audit_enabled() -> bool {
    AUDIT_ENABLED.get()
}

pub fn resolution_cache_enabled() -> bool {
    RESOLUTION_CACHE_ENABLED.get()
}
