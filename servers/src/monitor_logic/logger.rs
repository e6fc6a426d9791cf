use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

use lib_monitor::Rank;

/// File name prefix of this rank's logs. Ranks sharing a log directory keep their own files.
fn log_prefix(rank: Rank) -> String {
    format!("om_monitor_r{}_", rank)
}

pub fn setup_logging(log_dir: &Path, level: log::LevelFilter, rank: Rank) -> Result<PathBuf> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Clean up old log files of this rank, keeping only the most recent one
    cleanup_old_logs(log_dir, &log_prefix(rank))?;

    let log_file_name = format!(
        "{}{}.log",
        log_prefix(rank),
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}

pub fn cleanup_old_logs(log_dir: &Path, prefix: &str) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Sort by modification time, newest first
    entries.sort_by_key(|(modified, _)| std::cmp::Reverse(*modified));

    // Keep the most recent one (index 0), delete the rest
    for (_, path) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_cleanup_keeps_newest_log_of_the_rank() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("om_monitor_r0_old.log");
        let new = dir.path().join("om_monitor_r0_new.log");
        let other_rank = dir.path().join("om_monitor_r1_old.log");
        let unrelated = dir.path().join("notes.txt");
        for path in [&old, &new, &other_rank, &unrelated] {
            fs::write(path, "x").unwrap();
        }
        let past = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        cleanup_old_logs(dir.path(), &log_prefix(0)).unwrap();

        assert!(!old.exists());
        assert!(new.exists());
        assert!(other_rank.exists());
        assert!(unrelated.exists());
    }
}
