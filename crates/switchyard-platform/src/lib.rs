//! switchyard-platform — the compute-platform seam.
//!
//! The orchestration logic is platform-agnostic: everything it needs
//! from the underlying compute platform (launch a replica set, drain
//! one, enumerate instances, reassign the public entry point) goes
//! through the [`ComputePlatform`] trait. The [`ReplicaSetController`]
//! layers persistence and retry policy on top of that seam.
//!
//! # Components
//!
//! - **`platform`** — `ComputePlatform` trait, launch spec, platform errors
//! - **`controller`** — replica set lifecycle (create, retire, list)
//! - **`dev`** — in-process platform for dev mode and tests

pub mod controller;
pub mod dev;
pub mod platform;

pub use controller::ReplicaSetController;
pub use dev::DevPlatform;
pub use platform::{BoxFuture, ComputePlatform, LaunchSpec, PlatformError, PlatformResult};
