use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub step: usize,
    pub tag: String,
    pub value: f64,
    /// Seconds since the unix epoch.
    pub wall_time: f64,
}

/// Appends scalar events, one JSON object per line, to `<dir>/events.jsonl`.
pub struct SummaryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SummaryWriter {
    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;

        let path = dir.join(EVENTS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> io::Result<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();

        let event = ScalarEvent {
            step,
            tag: tag.to_owned(),
            value,
            wall_time,
        };

        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
pub(crate) fn read_events(path: &Path) -> io::Result<Vec<ScalarEvent>> {
    fs::read_to_string(path)?
        .lines()
        .map(|line| serde_json::from_str(line).map_err(io::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_across_writers() {
        let dir = tempfile::tempdir().unwrap();

        let mut writer = SummaryWriter::create(dir.path()).unwrap();
        writer.add_scalar("loss", 2.5, 0).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let mut writer = SummaryWriter::create(dir.path()).unwrap();
        writer.add_scalar("learning_rate", 1e-4, 100).unwrap();
        writer.flush().unwrap();

        let events = read_events(writer.path()).unwrap();

        assert_eq!(
            events
                .iter()
                .map(|event| (event.tag.as_str(), event.step))
                .collect::<Vec<_>>(),
            vec![("loss", 0), ("learning_rate", 100)]
        );
        assert_eq!(events[0].value, 2.5);
    }
}
