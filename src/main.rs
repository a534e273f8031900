use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use log::error;

use mdsync::config::Config;
use mdsync::sync;

/// CLI argument parsing is out of scope; the config file path and the
/// list of mailboxes to sync come from the environment (spec §1).
fn main() -> ExitCode {
    env_logger::init();

    let config_path = match env::var("MDSYNC_CONFIG") {
        Ok(path) => PathBuf::from(path),
        Err(_) => {
            error!("missing envvar MDSYNC_CONFIG");
            return ExitCode::FAILURE;
        }
    };
    let boxes: Vec<String> = match env::var("MDSYNC_BOXES") {
        Ok(list) => list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect(),
        Err(_) => vec!["INBOX".to_owned()],
    };

    match run(&config_path, &boxes) {
        Ok(stats) => {
            log::info!(
                "sync complete: {} appended, {} fetched, {} flagged, {} expunged, {} orphaned, {} skipped",
                stats.appended,
                stats.fetched,
                stats.flagged,
                stats.expunged,
                stats.orphaned,
                stats.skipped
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("sync failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: &PathBuf, boxes: &[String]) -> mdsync::Result<sync::Stats> {
    let config = Config::load_from_file(config_path)?;
    config.validate()?;
    sync::run_all(&config, boxes)
}
