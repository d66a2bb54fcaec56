//! CLI arguments support.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[clap(version, about = "machine replication daemon", long_about = None)]
pub struct Args {
    /// Port for the HTTP surface.
    #[clap(short, long)]
    pub port: Option<u16>,
    /// Prefix for the follow file name, for running several instances side
    /// by side.
    #[clap(long = "file-prefix")]
    pub file_prefix: Option<String>,
    /// Explicit config file path.
    #[clap(long)]
    pub cfg: Option<PathBuf>,
}

impl Args {
    pub fn make_overrides_map(&self) -> HashMap<&str, String> {
        let mut map: HashMap<&str, String> = HashMap::new();
        if let Some(port) = self.port {
            map.insert("port", port.to_string());
        }
        if let Some(prefix) = &self.file_prefix {
            map.insert("file_prefix", prefix.clone());
        }
        map
    }
}
