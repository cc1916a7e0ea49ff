//! Veldt Region Server
//!
//! The authoritative core of one virtual-world region: world model, script
//! host, physics bridge, user sessions and grid federation glue.
//!
//! ## Architecture
//!
//! ```text
//! RegionGroup  (region.rs)   ← caches, caps, grid backend, task queue
//!   └── Region (region.rs)   ← sessions, tick pumps
//!         ├── World            (world/)     ← object arena + octree
//!         ├── Terrain          (terrain.rs) ← 256×256 heightfield
//!         ├── ScriptHost       (scripting/) ← worker thread + VM table
//!         └── PhysicsBridge    (physics/)   ← worker thread + staging mutex
//! ```
//!
//! Three threads: the main loop (never blocks), the script worker and the
//! physics worker. Workers talk to the main thread through bounded queues
//! and one mutex each; grid-backend completions re-enter through the group
//! task queue.
//!
//! The UDP wire codec and the HTTP server are external: they exchange the
//! parsed message structs in [`protocol`], drive capabilities through
//! [`region::RegionGroup::handle_caps_path`], and implement
//! [`protocol::ClientHooks`] per session for outbound traffic.

// Protocol and data-language types are always available (no server feature
// needed).
pub mod llsd;
pub mod protocol;
pub mod types;

// Server-side modules require the `server` feature.
#[cfg(feature = "server")]
pub mod assets;
#[cfg(feature = "server")]
pub mod caps;
#[cfg(feature = "server")]
pub mod config;
#[cfg(feature = "server")]
pub mod evqueue;
#[cfg(feature = "server")]
pub mod grid;
#[cfg(feature = "server")]
pub mod inventory;
#[cfg(feature = "server")]
pub mod persist;
#[cfg(feature = "server")]
pub mod physics;
#[cfg(feature = "server")]
pub mod region;
#[cfg(feature = "server")]
pub mod scripting;
#[cfg(feature = "server")]
pub mod session;
#[cfg(feature = "server")]
pub mod teleport;
#[cfg(feature = "server")]
pub mod terrain;
#[cfg(feature = "server")]
pub mod world;

// Convenience re-exports (server only)
#[cfg(feature = "server")]
pub use config::RegionConfig;
#[cfg(feature = "server")]
pub use region::{Region, RegionGroup};
#[cfg(feature = "server")]
pub use session::{SessionHandle, UserSession};
#[cfg(feature = "server")]
pub use world::{World, WorldObject};
pub use types::{ChatType, LocalId, RegionHandle};
