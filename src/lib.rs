//! # Pipkin Core Library
//!
//! This crate contains the core logic and building blocks of the `pipkin` tool – a self-bootstrapping
//! package manager for command-line Python tools.
//!
//! `pipkin` resolves a desired version for a package, builds an isolated virtual environment for it,
//! and exposes the tool's entry points as stable, auto-updating executables in a shared base directory,
//! without needing system-wide privileges.
//!
//! This library is built for the `pipkin` CLI, but you can also reuse it as a backend in other tools.
//!
//! ## Modules Overview
//! - [`config`] – Layered settings resolution (CLI > config-file chain > defaults) and bundles
//! - [`spec`] – Package references, canonical names, and derived paths
//! - [`versions`] – Index-style version ordering and desired-version resolution
//! - [`index`] – Latest-version lookups against a package index
//! - [`softlock`] – Cooperative, crash-tolerant locking of installation targets
//! - [`builder`] – Building virtual environments and discovering entry points
//! - [`installer`] – The install/upgrade state machine, uninstall, and grooming
//! - [`delivery`] – Exposing entry points via symlink, wrapper, or copy
//! - [`manifest`] – Durable records of what is installed, how, and by whom
//! - [`util`] – Shared utilities (paths, audit log, ownership checks)


pub mod builder;
pub mod config;
pub mod delivery;
pub mod index;
pub mod installer;
pub mod manifest;
pub mod softlock;
pub mod spec;
pub mod util;
pub mod versions;

pub use builder::*;
pub use config::*;
pub use delivery::*;
pub use installer::*;
pub use manifest::*;
pub use softlock::*;
pub use spec::*;
pub use util::*;
pub use versions::*;
