use std::{
    cell::RefCell,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

use crate::kernel::SimTime;

/// Per-component append-only logs. Every line carries the component name and
/// the virtual timestamp in milliseconds: `[orchestrator 12.34] message`.
pub struct LogDir {
    path: PathBuf,
}

impl LogDir {
    pub fn create(path: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&path)?;
        Ok(LogDir { path })
    }

    pub fn component(&self, name: &str) -> Result<SimLog, std::io::Error> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.path.join(format!("{name}.log")))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "--- {name} log ---")?;
        Ok(SimLog {
            name: name.to_string(),
            sink: Some(RefCell::new(writer)),
        })
    }
}

pub struct SimLog {
    name: String,
    sink: Option<RefCell<BufWriter<File>>>,
}

impl SimLog {
    /// A log that swallows everything. Used by unit tests.
    pub fn disabled(name: &str) -> Self {
        SimLog {
            name: name.to_string(),
            sink: None,
        }
    }

    pub fn line(&self, now: SimTime, args: std::fmt::Arguments<'_>) {
        if let Some(sink) = &self.sink {
            let mut writer = sink.borrow_mut();
            let _ = writeln!(
                writer,
                "[{} {:.2}] {}",
                self.name,
                now.as_secs_f64() * 1000.0,
                args
            );
        }
    }

    pub fn flush(&self) {
        if let Some(sink) = &self.sink {
            let _ = sink.borrow_mut().flush();
        }
    }
}

impl Drop for SimLog {
    fn drop(&mut self) {
        self.flush();
    }
}
