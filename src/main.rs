use std::process::ExitCode;

use clap::Parser;

use btrfs_backup_lib::cli::Cli;
use btrfs_backup_lib::sync::SyncOutcome;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    let results = match btrfs_backup_lib::run(&cli) {
        Ok(results) => results,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(2);
        }
    };

    let mut any_failed = false;
    for (subvolume, result) in &results {
        match result {
            Ok(SyncOutcome::NoOp) => {
                log::info!(target: "sync", "{} already up to date", subvolume.tag());
            }
            Ok(SyncOutcome::Transferred { snapshot_name }) => {
                log::info!(target: "sync", "{} transferred {snapshot_name}", subvolume.tag());
            }
            Ok(SyncOutcome::Failed { snapshot_name, argv, exit_code, stderr }) => {
                any_failed = true;
                log::error!(
                    target: "sync",
                    "{} failed transferring {snapshot_name}: {argv:?} exited {exit_code}{}",
                    subvolume.tag(),
                    stderr.as_deref().map(|s| format!(": {s}")).unwrap_or_default(),
                );
            }
            Err(e) => {
                any_failed = true;
                log::error!(target: "sync", "{} failed: {e}", subvolume.tag());
            }
        }
    }

    if any_failed {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
