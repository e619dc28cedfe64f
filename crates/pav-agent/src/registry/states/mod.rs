//! The registry state graph:
//!
//! ```text
//! Bootstrapping ──ready──> Active
//!       │                    │ delete request
//!       │ delete request     ▼
//!       └───────────────> Blocked ──no volumes──> Tombstoned
//! ```

pub mod active;
pub mod blocked;
pub mod bootstrapping;
pub mod tombstoned;

pub use active::Active;
pub use blocked::Blocked;
pub use bootstrapping::Bootstrapping;
pub use tombstoned::Tombstoned;
