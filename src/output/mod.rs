//! This module contains the emission of persisted outputs: one test case
//! per terminated path, the binary `.ktest` rendition of its input
//! objects, the run-wide logs, and the machine-readable run summary.

use std::{
    fs::{self, File, OpenOptions},
    io::Write as _,
    path::{Path, PathBuf},
};

use serde::Serialize;

/// One concrete input object of a test case.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TestObject {
    /// The name of the symbolic input.
    pub name: String,

    /// The concrete bytes assigned to it.
    pub bytes: Vec<u8>,
}

/// A complete test case for one terminated path.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TestCase {
    /// The ordinal of the test within the run.
    pub id: u64,

    /// The input objects, in the order they were introduced on the path.
    pub objects: Vec<TestObject>,

    /// The branch history of the path, over `{0,1,2,3}`.
    pub branch_history: String,

    /// The suffix of the companion file, e.g. `early` or `assert.err`,
    /// absent for a plain success.
    pub suffix: Option<String>,
}

/// Counters describing what a run produced.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct OutputStats {
    /// Test cases written, of any kind.
    pub tests_written: u64,

    /// Error test cases among them.
    pub errors_written: u64,
}

/// The sink for everything a run persists.
///
/// Constructed with [`None`] as the directory it keeps the counters and
/// the in-memory test list but writes nothing, which is what unit tests
/// and the master's bounded exploration use.
#[derive(Debug)]
pub struct OutputHandler {
    directory: Option<PathBuf>,
    next_id:   u64,
    stats:     OutputStats,
    tests:     Vec<TestCase>,
}

impl OutputHandler {
    /// Constructs a handler writing under `directory`, creating it when
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the directory cannot be created.
    pub fn new(directory: Option<PathBuf>) -> std::io::Result<Self> {
        if let Some(dir) = &directory {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            directory,
            next_id: 0,
            stats: OutputStats::default(),
            tests: vec![],
        })
    }

    /// Gets the counters.
    #[must_use]
    pub fn stats(&self) -> OutputStats {
        self.stats
    }

    /// Gets the test cases emitted so far.
    #[must_use]
    pub fn tests(&self) -> &[TestCase] {
        &self.tests
    }

    /// Emits one test case: the `.ktest` rendition of `objects`, an
    /// optional companion file carrying `message` under the given
    /// `suffix`, and the branch-history log line.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if any of the files cannot be written.
    pub fn process_test_case(
        &mut self,
        objects: Vec<TestObject>,
        branch_history: String,
        suffix: Option<&str>,
        message: Option<&str>,
    ) -> std::io::Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        self.stats.tests_written += 1;
        let is_error = suffix.is_some_and(|s| s.ends_with(".err"));
        if is_error {
            self.stats.errors_written += 1;
        }

        let test = TestCase {
            id,
            objects,
            branch_history,
            suffix: suffix.map(str::to_owned),
        };

        if let Some(dir) = self.directory.clone() {
            let stem = format!("test{id:06}");
            write_ktest(&dir.join(format!("{stem}.ktest")), &test)?;
            if let (Some(suffix), Some(message)) = (suffix, message) {
                fs::write(dir.join(format!("{stem}.{suffix}")), message)?;
            }
            self.append_line("branch-history.log", &test.branch_history)?;
        }

        self.tests.push(test);
        Ok(id)
    }

    /// Appends one line to the instruction log.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the log cannot be written.
    pub fn log_instruction(&mut self, line: &str) -> std::io::Result<()> {
        self.append_line("instructions.txt", line)
    }

    /// Writes the machine-readable run summary.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the summary cannot be serialised or written.
    pub fn write_summary<S: Serialize>(&self, summary: &S) -> std::io::Result<()> {
        let Some(dir) = &self.directory else {
            return Ok(());
        };
        let rendered = serde_json::to_string_pretty(summary)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join("summary.json"), rendered)
    }

    fn append_line(&self, file: &str, line: &str) -> std::io::Result<()> {
        let Some(dir) = &self.directory else {
            return Ok(());
        };
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(file))?;
        writeln!(handle, "{line}")
    }
}

/// The magic bytes opening a `.ktest` file.
const KTEST_MAGIC: &[u8; 5] = b"KTEST";

/// The version of the `.ktest` layout written here.
const KTEST_VERSION: u32 = 3;

/// Writes the binary rendition of a test case: the magic, a version, the
/// object count, then each object as `(name length, name bytes, byte
/// count, bytes)` with all integers little-endian.
fn write_ktest(path: &Path, test: &TestCase) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(KTEST_MAGIC)?;
    file.write_all(&KTEST_VERSION.to_le_bytes())?;
    file.write_all(&u32::try_from(test.objects.len()).unwrap_or(u32::MAX).to_le_bytes())?;
    for object in &test.objects {
        let name = object.name.as_bytes();
        file.write_all(&u32::try_from(name.len()).unwrap_or(u32::MAX).to_le_bytes())?;
        file.write_all(name)?;
        file.write_all(
            &u32::try_from(object.bytes.len())
                .unwrap_or(u32::MAX)
                .to_le_bytes(),
        )?;
        file.write_all(&object.bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn in_memory_handler_counts_without_writing() {
        let mut handler = OutputHandler::new(None).expect("no directory to create");
        let id = handler
            .process_test_case(vec![], "01".into(), None, None)
            .expect("no files to write");
        assert_eq!(id, 0);
        assert_eq!(handler.stats().tests_written, 1);
        assert_eq!(handler.stats().errors_written, 0);
    }

    #[test]
    fn error_suffixes_are_counted_separately() {
        let mut handler = OutputHandler::new(None).expect("no directory to create");
        handler
            .process_test_case(vec![], "0".into(), Some("assert.err"), Some("boom"))
            .expect("no files to write");
        handler
            .process_test_case(vec![], "1".into(), Some("early"), Some("halting"))
            .expect("no files to write");
        assert_eq!(handler.stats().tests_written, 2);
        assert_eq!(handler.stats().errors_written, 1);
    }

    #[test]
    fn writes_ktest_and_logs_on_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut handler = OutputHandler::new(Some(dir.path().to_owned()))?;
        handler.process_test_case(
            vec![TestObject {
                name:  "x".into(),
                bytes: vec![42, 0, 0, 0],
            }],
            "013".into(),
            Some("assert.err"),
            Some("assertion failed"),
        )?;

        let ktest = fs::read(dir.path().join("test000000.ktest"))?;
        assert_eq!(&ktest[..5], KTEST_MAGIC);
        let err = fs::read_to_string(dir.path().join("test000000.assert.err"))?;
        assert_eq!(err, "assertion failed");
        let history = fs::read_to_string(dir.path().join("branch-history.log"))?;
        assert_eq!(history, "013\n");
        Ok(())
    }
}
