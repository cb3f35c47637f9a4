//! Container layer: per-kind specs, hardening, runtime backends and the
//! lifecycle manager built on top of them.

pub mod fake;
pub mod hardening;
pub mod lifecycle;
pub mod runtime;
pub mod spec;

pub use lifecycle::{ContainerHandle, ContainerLifecycleManager};
pub use runtime::{ContainerInfo, ContainerRuntime, DockerCli};
pub use spec::{ContainerKey, ContainerKind, ContainerSpec, SpecBuilder};
