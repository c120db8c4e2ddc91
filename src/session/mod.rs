//! Sessions: container naming, slots, saved state, and the setup/cleanup lifecycle

pub mod id;
pub mod lifecycle;
pub mod naming;
pub mod slot;
pub mod store;

pub use id::{generate_session_id, validate_session_id};
pub use lifecycle::{
    CleanupOptions, ExtraMount, Lifecycle, LifecycleSettings, SetupOptions, SetupOutcome,
    SetupResult, SANDBOX_MARKER,
};
pub use naming::{container_name, list_workspace_sessions, WorkspaceId};
pub use slot::{allocate_slot, allocate_slot_from, DEFAULT_MAX_SLOT};
pub use store::{SessionMetadata, SessionStore, SessionSummary};
