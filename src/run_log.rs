use crate::enums::Level;
use camino::Utf8Path;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Mutex;

/// Append-only record of completed work, one `{level}\t{key}` line per entry.
///
/// Entries already in the file when it is opened are remembered, so a resumed run
/// can skip work it completed before.
pub struct SuccessLog {
    inner: Mutex<SuccessLogInner>,
}

struct SuccessLogInner {
    done: HashSet<(Level, String)>,
    file: Option<fs_err::File>,
}

impl SuccessLog {
    /// A log which is not persisted.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(SuccessLogInner {
                done: HashSet::new(),
                file: None,
            }),
        }
    }

    pub fn open(path: &Utf8Path) -> std::io::Result<Self> {
        let done = if path.is_file() {
            fs_err::read_to_string(path)?
                .lines()
                .filter_map(parse_line)
                .collect()
        } else {
            HashSet::new()
        };
        let file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        tracing::info!(path = path.as_str(), previously_done = done.len(), "opened success log");
        Ok(Self {
            inner: Mutex::new(SuccessLogInner {
                done,
                file: Some(file),
            }),
        })
    }

    pub fn contains(&self, level: Level, key: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.done.contains(&(level, key.to_string())))
            .unwrap_or(false)
    }

    /// Record `key` as done. Failing to write the file is logged, not fatal: the
    /// success log only saves work on resume.
    pub fn record(&self, level: Level, key: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            tracing::error!(%level, key, "success log lock poisoned");
            return;
        };
        if !inner.done.insert((level, key.to_string())) {
            return;
        }
        if let Some(file) = inner.file.as_mut() {
            if let Err(e) = writeln!(file, "{level}\t{key}") {
                tracing::error!(%level, key, error = e.to_string(), "could not write success log");
            }
        }
    }
}

fn parse_line(line: &str) -> Option<(Level, String)> {
    let (level, key) = line.split_once('\t')?;
    let level = match level {
        "version" => Level::Version,
        "collection" => Level::Collection,
        "patient" => Level::Patient,
        "study" => Level::Study,
        "series" => Level::Series,
        "instance" => Level::Instance,
        _ => return None,
    };
    Some((level, key.to_string()))
}
