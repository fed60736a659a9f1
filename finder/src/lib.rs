//! Workspace Finder
//!
//! Supervises local stdio tool servers, talks to them over newline-delimited
//! JSON-RPC, and runs a concurrent search → fetch pipeline across them.
//!
//! # Example
//!
//! ```rust,ignore
//! use workspace_finder::config::ServersConfig;
//! use workspace_finder::oneshot::{run_oneshot, OneshotOptions};
//!
//! let config = ServersConfig::load_from_path("servers.toml".as_ref())?;
//! let result = run_oneshot(&config, &OneshotOptions::new("release checklist"), None).await;
//! for link in &result.summary.links {
//!     println!("{}", link.markdown());
//! }
//! ```

pub mod config;
pub mod evidence;
pub mod oneshot;
pub mod pipeline;
pub mod process;
pub mod rpc;
pub mod summary;
