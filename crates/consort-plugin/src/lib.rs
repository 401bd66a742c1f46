//! Plugin discovery for consort.
//!
//! This crate finds plugin modules on disk, probes them (in process or in a
//! short-lived child for crash isolation), and keeps what it learns in a
//! process-wide registry backed by a flat text cache file.
//!
//! ## Usage
//!
//! ```ignore
//! use consort_plugin::{DylibLoader, HostConfig, HostContext, SearchFlags, SearchRequest};
//!
//! let context = HostContext::new(HostConfig::default(), Arc::new(DylibLoader::new()))?;
//! let report = context.search(
//!     &SearchRequest::new(["/opt/plugins"]).flags(SearchFlags {
//!         use_default_paths: true,
//!         save_cache: true,
//!         parallel: true,
//!         ..Default::default()
//!     }),
//!     None,
//! )?;
//! println!("{} plugins", report.found.len());
//! ```

pub mod arch;
pub use arch::{check_architecture, Arch};

pub mod cache;
pub use cache::CacheFile;

mod config;
pub use config::{
    default_probe_executable, default_settings_dir, HostConfig, ProbeMode, CACHE_FILE_NAME,
};

mod context;
pub use context::{
    HostContext, ProbeCallback, SearchCallback, SearchFlags, SearchReport, SearchRequest,
};

mod factory;
pub use factory::Factory;

pub mod loader;
pub use loader::{AbiAdapter, DylibLoader};

pub mod probe;
pub use probe::{ProbeResult, ProbeStatus, Prober};

mod registry;
pub use registry::{assign_keys, PluginRegistry, ProbeGuard};

pub mod search;
pub use search::{default_search_paths, search};
