//! Ruleset resolution, caching and installation
//!
//! Rulesets are named bundles of files published in a registry. A version
//! specifier (`latest`, `1.2.0`, `^1.0`, a branch or a commit) is resolved
//! against the refs the registry advertises, and the selected files are
//! fetched through a local content cache.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  Downloader │────▶│   Manager    │────▶│  Registry   │
//! │ (pool/job)  │     │ (name→reg)   │     │ (resolve)   │
//! └─────────────┘     └──────────────┘     └─────────────┘
//!                                                 │
//!                              ┌──────────────────┼──────────────┐
//!                              ▼                  ▼              ▼
//!                       ┌─────────────┐    ┌─────────────┐ ┌─────────────┐
//!                       │    Cache    │    │  Resolver   │ │ Registries  │
//!                       │ (versions,  │    │ (semver,    │ │ (git, s3,   │
//!                       │  content)   │    │  branches)  │ │  gitlab...) │
//!                       └─────────────┘    └─────────────┘ └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`]: On-disk version index and content cache
//! - [`cancel`]: Cancellation signal for in-flight downloads
//! - [`constraint`]: Semver range constraints
//! - [`downloader`]: Concurrent batch installs with per-registry limits
//! - [`error`]: Error types for configuration, cache and registry operations
//! - [`manager`]: Registry lookup by name and single-ruleset installs
//! - [`pattern`]: Glob selection of ruleset files
//! - [`registry`]: Registry trait and the caching layer shared by backends
//! - [`registries`]: Concrete backends
//! - [`resolver`]: Version specifier parsing and resolution
//! - [`semver`]: Shared semver utilities
//! - [`types`]: Common types like `ResolvedVersion` and `ContentSelector`

pub mod cache;
pub mod cancel;
pub mod constraint;
pub mod downloader;
pub mod error;
pub mod manager;
pub mod pattern;
pub mod registries;
pub mod registry;
pub mod resolver;
pub mod semver;
pub mod types;
