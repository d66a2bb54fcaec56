//! Small shared helpers: config layering, home paths, signal handling.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use config::{Environment, File, Map, Source, Value};
use dirs::home_dir;
use serde::de::DeserializeOwned;

const MACHINED_DIR: &str = ".machined";

/// Path to a file in the machined home directory, if a home exists.
pub fn machined_home_path(file_name: &str) -> Option<PathBuf> {
    let home = home_dir()?;
    Some(Path::new(&home).join(MACHINED_DIR).join(file_name))
}

/// Resolves configuration in layers: struct defaults, then any config files
/// that exist, then `<prefix>_*` environment variables, then explicit
/// command line overrides.
pub fn make_config<T, S, V>(
    default: T,
    file_paths: &[Option<PathBuf>],
    env_prefix: &str,
    flag_overrides: HashMap<S, V>,
) -> Result<T>
where
    T: DeserializeOwned + Source + Send + Sync + 'static,
    S: AsRef<str>,
    V: Into<Value>,
{
    let mut builder = config::Config::builder().add_source(default);
    for path in file_paths.iter().flatten() {
        if path.is_file() {
            builder = builder.add_source(File::from(path.as_path()));
        }
    }
    builder = builder.add_source(Environment::with_prefix(env_prefix).try_parsing(true));
    for (flag, value) in flag_overrides {
        builder = builder.set_override(flag.as_ref(), value)?;
    }
    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}

pub fn insert_into_config_map<I: Into<Value>>(map: &mut Map<String, Value>, field: &str, val: I) {
    map.insert(field.to_string(), val.into());
}

/// Blocks the current task until ctrl-c is received.
pub async fn block_until_sigint() {
    let (ctrlc_send, ctrlc_oneshot) = futures::channel::oneshot::channel();
    let ctrlc_send_c = RefCell::new(Some(ctrlc_send));

    let running = Arc::new(AtomicUsize::new(0));
    ctrlc::set_handler(move || {
        let prev = running.fetch_add(1, Ordering::SeqCst);
        if prev == 0 {
            println!("Got interrupt, shutting down...");
            if let Some(ctrlc_send) = ctrlc_send_c.try_borrow_mut().unwrap().take() {
                ctrlc_send.send(()).expect("Error sending ctrl-c message");
            }
        } else {
            std::process::exit(0);
        }
    })
    .expect("Error setting Ctrl-C handler");

    ctrlc_oneshot.await.unwrap();
}
