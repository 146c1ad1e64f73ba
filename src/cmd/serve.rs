//! HTTP service command: `fixloop serve`.

use std::path::Path;

use anyhow::Result;
use fixloop::server::{ServerConfig, start_server};

use super::super::Cli;

pub async fn cmd_serve(
    cli: &Cli,
    project_dir: &Path,
    host: Option<String>,
    port: Option<u16>,
    dev: bool,
) -> Result<()> {
    let mut config = super::load_config(cli, project_dir)?;
    config.override_server(host, port);

    let server = ServerConfig::from_config(&config, dev);
    println!(
        "{} http://{}:{}",
        console::style("fixloop serving on").bold().cyan(),
        server.host,
        server.port
    );
    start_server(&config, server).await
}
