//! Line-oriented service configuration files.
//!
//! Blank lines and lines beginning with `#` are ignored. Directives:
//!
//! ```text
//! path <dir>                        # append to the plug-in search path
//! service <resource> <file>         # load a service plug-in
//! option <resource> <name>=<value>  # set a service option
//! ```

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::http::HttpServer;
use crate::{Error, Result};

/// Applies a service configuration file to a server.
///
/// Configuration errors are fatal: the first malformed line or failed
/// directive aborts loading.
pub fn load_service_config(server: &Arc<HttpServer>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::new_config(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), "loading service configuration");

    for (index, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        apply_directive(server, line)
            .map_err(|e| Error::new_config(format!("{}:{}: {e}", path.display(), index + 1)))?;
    }
    Ok(())
}

fn apply_directive(server: &Arc<HttpServer>, line: &str) -> Result<()> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.as_slice() {
        ["path", dir] => server.add_plugin_directory(dir),
        ["service", resource, file] => server.load_service(resource, file),
        ["option", resource, assignment] => {
            let (name, value) = assignment.split_once('=').ok_or_else(|| {
                Error::new_config(format!("malformed option (expected name=value): {assignment}"))
            })?;
            server.set_service_option(resource, name, value)
        }
        [directive, ..] => Err(Error::new_config(format!(
            "unrecognized directive: {directive}"
        ))),
        [] => Ok(()),
    }
}
