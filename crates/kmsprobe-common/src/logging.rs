use chrono::Local;
use log::{Level, LevelFilter, Metadata, Record};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::paths::kmsprobe_log_dir;

static SESSION_DIR: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Writes info and above to `kmsprobe.log`, debug and trace to
/// `kmsprobe.dbg.log`, and mirrors every line to stderr.
pub struct FileLogger {
    level: LevelFilter,
    main_file: Option<Mutex<File>>,
    debug_file: Option<Mutex<File>>,
}

impl FileLogger {
    pub fn init(level: LevelFilter) -> Result<(), Box<dyn std::error::Error>> {
        let opened: Result<_, Box<dyn std::error::Error>> = kmsprobe_log_dir()
            .ok_or_else(|| "no XDG_DATA_HOME or HOME".into())
            .and_then(|log_dir| Self::open_session(&log_dir));
        let logger = match opened {
            Ok((session_dir, main_file, debug_file)) => {
                if let Ok(mut guard) = SESSION_DIR.lock() {
                    *guard = Some(session_dir);
                }
                FileLogger {
                    level,
                    main_file: Some(Mutex::new(main_file)),
                    debug_file: Some(Mutex::new(debug_file)),
                }
            }
            Err(e) => {
                eprintln!("Log files unavailable ({}), logging to stderr only", e);
                FileLogger {
                    level,
                    main_file: None,
                    debug_file: None,
                }
            }
        };

        log::set_max_level(level);
        log::set_logger(Box::leak(Box::new(logger)))
            .map_err(|e| format!("Failed to set logger: {}", e))?;

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Some(dir) = current_session_dir() {
            log::info!("Log directory: {}", dir.display());
        }
        log::info!("Started at: {}", timestamp);

        Ok(())
    }

    fn open_session(log_dir: &Path) -> Result<(PathBuf, File, File), Box<dyn std::error::Error>> {
        fs::create_dir_all(log_dir)?;

        let session_num = Self::get_next_session_number(log_dir);
        let session_dir = log_dir.join(format!("session-{}", session_num));
        fs::create_dir_all(&session_dir)?;

        let main_file = Self::open_log_file(&session_dir, "kmsprobe.log")?;
        let debug_file = Self::open_log_file(&session_dir, "kmsprobe.dbg.log")?;
        Ok((session_dir, main_file, debug_file))
    }

    fn open_log_file(dir: &Path, name: &str) -> Result<File, Box<dyn std::error::Error>> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(file)
    }

    fn get_next_session_number(log_dir: &Path) -> u32 {
        let mut max_num = 0u32;

        if let Ok(entries) = fs::read_dir(log_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name_str = name.to_string_lossy();

                if let Some(rest) = name_str.strip_prefix("session-") {
                    if let Ok(num) = rest.parse::<u32>() {
                        max_num = max_num.max(num);
                    }
                }
            }
        }

        max_num + 1
    }
}

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now().format("%H:%M:%S%.3f");
        let level_char = match record.level() {
            Level::Error => 'E',
            Level::Warn => 'W',
            Level::Info => 'I',
            Level::Debug => 'D',
            Level::Trace => 'T',
        };

        let log_line = format!("{} {} {}\n", timestamp, record.target(), record.args());

        let file_mutex = if record.level() >= Level::Debug {
            self.debug_file.as_ref()
        } else {
            self.main_file.as_ref()
        };

        if let Some(Ok(mut file)) = file_mutex.map(|m| m.lock()) {
            let _ = file.write_all(log_line.as_bytes());
            let _ = file.flush();
        }

        eprint!("{} {} {}", timestamp, level_char, log_line);
    }

    fn flush(&self) {
        for file in [&self.main_file, &self.debug_file].into_iter().flatten() {
            let _ = file.lock().map(|mut f| f.flush());
        }
    }
}

pub fn current_session_dir() -> Option<PathBuf> {
    SESSION_DIR.lock().ok()?.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_numbers_continue_after_highest() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("session-3")).unwrap();
        fs::create_dir_all(tmp.path().join("session-11")).unwrap();
        fs::create_dir_all(tmp.path().join("unrelated")).unwrap();

        assert_eq!(FileLogger::get_next_session_number(tmp.path()), 12);
    }

    #[test]
    fn missing_log_dir_starts_at_one() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(FileLogger::get_next_session_number(&tmp.path().join("missing")), 1);
    }

    #[test]
    fn open_session_creates_both_files() {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = tmp.path().join("logs");
        fs::create_dir_all(log_dir.join("session-1")).unwrap();

        let (session_dir, _main, _debug) = FileLogger::open_session(&log_dir).unwrap();

        assert_eq!(session_dir, log_dir.join("session-2"));
        assert!(session_dir.join("kmsprobe.log").is_file());
        assert!(session_dir.join("kmsprobe.dbg.log").is_file());
    }
}
