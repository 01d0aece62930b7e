//! # canister
//!
//! **Embedded-Linux Container Runtime**
//!
//! This crate installs signed, immutable NPK application packages,
//! constructs an OS-level sandbox for each, and supervises their
//! execution through a framed control-plane protocol. It is built for
//! appliance-style systems: one runtime daemon owning a fixed set of
//! containers, started at boot and driven by a local console socket.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          canisterd                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                     Console (api)                          │  │
//! │  │  length-prefixed frames │ FIFO request/response │ fan-out  │  │
//! │  └──────────────────────────────┬─────────────────────────────┘  │
//! │                                 │                                │
//! │  ┌──────────────────────────────┼─────────────────────────────┐  │
//! │  │                      Lifecycle Engine                      │  │
//! │  │  install → mount → start → stop → umount → uninstall       │  │
//! │  │  one in-flight transition per container │ notifications    │  │
//! │  └───────┬──────────────────┬───────────────────┬─────────────┘  │
//! │          │                  │                   │                │
//! │  ┌───────┴──────┐   ┌───────┴────────┐   ┌──────┴───────────┐    │
//! │  │  Repository  │   │ Sandbox        │   │  Launcher        │    │
//! │  │  NPK store   │   │ Compiler       │   │  (per target OS) │    │
//! │  │  digests     │   │ seccomp/cgroup │   │  spawn/wait/kill │    │
//! │  │  atomic adds │   │ caps/rlimits   │   │  mount/umount    │    │
//! │  └──────────────┘   └────────────────┘   └──────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌──────────────┐  install   ┌───────────┐   mount   ┌─────────┐
//!   │ NotInstalled │ ─────────► │ Installed │ ────────► │ Mounted │
//!   └──────────────┘            └───────────┘           └────┬────┘
//!          ▲                         ▲                       │ start
//!          │ uninstall               │ umount                ▼
//!          │                    ┌────┴─────┐  exited   ┌─────────┐
//!          └────────────────────┤ Stopped/ │ ◄──────── │ Running │
//!                               │ Exited   │   stop    └─────────┘
//!                               └──────────┘
//! ```
//!
//! # Security Model
//!
//! - **Integrity**: package manifests are digest-verified at open,
//!   filesystem images while they are unpacked. A tampered byte never
//!   reaches a mount.
//! - **Deny by default**: empty capability bounding set, seccomp
//!   allow-lists with a configurable deny action, explicit cgroup
//!   limits. A sandbox that cannot be fully compiled never spawns.
//! - **Containment of failure**: every error is per-request or
//!   per-container; autostart and repository-scan failures are
//!   isolated and logged, never fatal.

pub mod api;
pub mod console;
pub mod constants;
pub mod container;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod manifest;
pub mod npk;
pub mod platform;
pub mod repository;
pub mod sandbox;

pub use container::{Container, Name, Version};
pub use engine::{Engine, EngineConfig};
pub use error::{Error, Result};
