//! Output module: where a run's artifacts end up.
//!
//! [`OutputSink`] is the seam between the orchestrator and the filesystem.
//! [`DirectorySink`] lays a run out like this:
//!
//! ```text
//! <output>/
//!   chapters/chapter_001_Intro.wav
//!   chapters/chapter_002_The_Storm_part_01.wav
//!   audiobook.wav
//!   book.txt
//!   run_summary.json
//!   processing_report.txt
//! ```

pub mod report;
pub mod summary;
pub mod wav;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::synth::sanitize_title;

pub use report::render_report;
pub use summary::{
    ChapterSummary, ConfigSnapshot, FailedItem, ImageEntry, ImageSummary, RunSummary,
    SynthesisSummary,
    WORDS_PER_MINUTE,
};

pub const CHAPTERS_DIR: &str = "chapters";
pub const TEXT_FILE: &str = "book.txt";
pub const SUMMARY_FILE: &str = "run_summary.json";
pub const REPORT_FILE: &str = "processing_report.txt";
pub const MERGED_STEM: &str = "audiobook";

/// Longest sanitised title kept in an audio file name.
const TITLE_CHARS: usize = 20;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("nothing to merge")]
    NothingToMerge,

    #[error("cannot merge audio: {0}")]
    Merge(#[from] wav::WavError),

    #[error("failed to serialise run summary: {0}")]
    Summary(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// OutputSink trait
// ---------------------------------------------------------------------------

pub trait OutputSink: Send + Sync {
    /// Store one synthesised audio file under `name`.
    fn write_audio(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, OutputError>;

    /// Concatenate previously written audio files, in order, into `name`.
    fn merge_audio(&self, parts: &[PathBuf], name: &str) -> Result<PathBuf, OutputError>;

    fn write_text(&self, name: &str, text: &str) -> Result<PathBuf, OutputError>;

    fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf, OutputError>;

    fn write_report(&self, report: &str) -> Result<PathBuf, OutputError>;
}

// Compile-time assertion: Box<dyn OutputSink> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Box<dyn OutputSink>) {}
};

/// `chapter_{NNN}_{title}[_part_{PP}].{ext}`
pub fn audio_file_name(chapter: usize, title: &str, part: Option<usize>, ext: &str) -> String {
    let title = sanitize_title(title, TITLE_CHARS);
    match part {
        Some(part) => format!("chapter_{chapter:03}_{title}_part_{part:02}.{ext}"),
        None => format!("chapter_{chapter:03}_{title}.{ext}"),
    }
}

/// Join audio byte streams in order.  When every part is a WAV file the
/// result is one valid WAV; otherwise the raw bytes are concatenated, which
/// is what stream formats such as MP3 expect.
pub fn merge_bytes<B: AsRef<[u8]>>(parts: &[B]) -> Result<Vec<u8>, OutputError> {
    if parts.is_empty() {
        return Err(OutputError::NothingToMerge);
    }
    if parts.iter().all(|p| wav::is_wav(p.as_ref())) {
        return Ok(wav::merge(parts)?);
    }
    Ok(parts.iter().flat_map(|p| p.as_ref().iter().copied()).collect())
}

// ---------------------------------------------------------------------------
// DirectorySink
// ---------------------------------------------------------------------------

/// Writes artifacts under a root directory, creating it on first use.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write(&self, path: PathBuf, bytes: &[u8]) -> Result<PathBuf, OutputError> {
        let result = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(&path, bytes));
        match result {
            Ok(()) => {
                log::debug!("output: wrote {} ({} bytes)", path.display(), bytes.len());
                Ok(path)
            }
            Err(source) => Err(OutputError::Write { path, source }),
        }
    }
}

impl OutputSink for DirectorySink {
    fn write_audio(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, OutputError> {
        self.write(self.root.join(CHAPTERS_DIR).join(name), bytes)
    }

    fn merge_audio(&self, parts: &[PathBuf], name: &str) -> Result<PathBuf, OutputError> {
        let mut inputs = Vec::with_capacity(parts.len());
        for path in parts {
            let bytes = std::fs::read(path).map_err(|source| OutputError::Read {
                path: path.clone(),
                source,
            })?;
            inputs.push(bytes);
        }
        let merged = merge_bytes(&inputs)?;
        let path = self.write(self.root.join(name), &merged)?;
        log::info!("output: merged {} files into {}", parts.len(), path.display());
        Ok(path)
    }

    fn write_text(&self, name: &str, text: &str) -> Result<PathBuf, OutputError> {
        self.write(self.root.join(name), text.as_bytes())
    }

    fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf, OutputError> {
        let json = serde_json::to_vec_pretty(summary)?;
        self.write(self.root.join(SUMMARY_FILE), &json)
    }

    fn write_report(&self, report: &str) -> Result<PathBuf, OutputError> {
        self.write(self.root.join(REPORT_FILE), report.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// MemorySink (test only)
// ---------------------------------------------------------------------------

/// Test double keeping every artifact in memory under `mem/<name>`.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    files: std::sync::Mutex<std::collections::BTreeMap<PathBuf, Vec<u8>>>,
    fail_writes: bool,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails with a permission error.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(&Self::path(name)).cloned()
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).map(|b| String::from_utf8(b).unwrap())
    }

    pub fn names(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap()
            .keys()
            .map(|p| p.strip_prefix("mem").unwrap().display().to_string())
            .collect()
    }

    fn path(name: &str) -> PathBuf {
        Path::new("mem").join(name)
    }

    fn put(&self, name: &str, bytes: Vec<u8>) -> Result<PathBuf, OutputError> {
        let path = Self::path(name);
        if self.fail_writes {
            return Err(OutputError::Write {
                path,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        self.files.lock().unwrap().insert(path.clone(), bytes);
        Ok(path)
    }
}

#[cfg(test)]
impl OutputSink for MemorySink {
    fn write_audio(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, OutputError> {
        self.put(&format!("{CHAPTERS_DIR}/{name}"), bytes.to_vec())
    }

    fn merge_audio(&self, parts: &[PathBuf], name: &str) -> Result<PathBuf, OutputError> {
        let inputs: Vec<Vec<u8>> = {
            let files = self.files.lock().unwrap();
            parts.iter().filter_map(|p| files.get(p).cloned()).collect()
        };
        let merged = merge_bytes(&inputs)?;
        self.put(name, merged)
    }

    fn write_text(&self, name: &str, text: &str) -> Result<PathBuf, OutputError> {
        self.put(name, text.as_bytes().to_vec())
    }

    fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf, OutputError> {
        let json = serde_json::to_vec_pretty(summary)?;
        self.put(SUMMARY_FILE, json)
    }

    fn write_report(&self, report: &str) -> Result<PathBuf, OutputError> {
        self.put(REPORT_FILE, report.as_bytes().to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_names_are_numbered_and_sanitised() {
        assert_eq!(
            audio_file_name(1, "The Storm!", None, "wav"),
            "chapter_001_The_Storm.wav"
        );
        assert_eq!(
            audio_file_name(12, "A very long chapter title indeed", Some(3), "mp3"),
            "chapter_012_A_very_long_chapter_part_03.mp3"
        );
    }

    #[test]
    fn merge_joins_wav_files_into_one_wav() {
        let a = wav::encode_pcm16(&[1, 2], 22_050, 1).unwrap();
        let b = wav::encode_pcm16(&[3], 22_050, 1).unwrap();
        let merged = merge_bytes(&[a, b]).unwrap();
        let audio = wav::decode(&merged).unwrap();
        assert_eq!(audio.samples, wav::Samples::Int(vec![1, 2, 3]));
    }

    #[test]
    fn merge_concatenates_non_wav_streams() {
        let merged = merge_bytes(&[b"ID3a".to_vec(), b"ID3b".to_vec()]).unwrap();
        assert_eq!(merged, b"ID3aID3b");
        assert!(matches!(
            merge_bytes::<Vec<u8>>(&[]),
            Err(OutputError::NothingToMerge)
        ));
    }

    #[test]
    fn directory_sink_lays_out_run() {
        let dir = tempdir().expect("temp dir");
        let sink = DirectorySink::new(dir.path().join("out"));

        let first = sink
            .write_audio("chapter_001_A.wav", &wav::encode_pcm16(&[5], 8_000, 1).unwrap())
            .unwrap();
        let second = sink
            .write_audio("chapter_002_B.wav", &wav::encode_pcm16(&[6], 8_000, 1).unwrap())
            .unwrap();
        assert_eq!(first.parent().unwrap(), dir.path().join("out").join(CHAPTERS_DIR));

        let merged = sink.merge_audio(&[first, second], "audiobook.wav").unwrap();
        let bytes = std::fs::read(&merged).unwrap();
        assert_eq!(wav::decode(&bytes).unwrap().samples, wav::Samples::Int(vec![5, 6]));

        sink.write_text(TEXT_FILE, "hello").unwrap();
        sink.write_report("report").unwrap();
        sink.write_summary(&RunSummary::default()).unwrap();
        for name in [TEXT_FILE, REPORT_FILE, SUMMARY_FILE] {
            assert!(dir.path().join("out").join(name).exists(), "{name}");
        }
    }

    #[test]
    fn merge_reports_missing_part() {
        let dir = tempdir().expect("temp dir");
        let sink = DirectorySink::new(dir.path());
        let err = sink
            .merge_audio(&[dir.path().join("nope.wav")], "audiobook.wav")
            .unwrap_err();
        assert!(matches!(err, OutputError::Read { .. }));
    }
}
