//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `scan`   | `Scan`           |
//! | `config` | `Config`         |

pub mod config;
pub mod scan;
pub mod serve;

use std::path::Path;

use anyhow::Result;
use fixloop::config::FixloopConfig;

use super::Cli;

pub use config::cmd_config;
pub use scan::cmd_scan;
pub use serve::cmd_serve;

/// Load configuration the way every command does: file, environment, then
/// the global CLI flags.
pub(crate) fn load_config(cli: &Cli, project_dir: &Path) -> Result<FixloopConfig> {
    Ok(FixloopConfig::load(project_dir, cli.config.as_deref())?.with_verbose(cli.verbose))
}
