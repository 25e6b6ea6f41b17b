pub mod compress;
pub mod event;
pub mod replay;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::detect::DetectError;
use crate::store::StoreError;

pub use event::{TapeEvent, TapeEventAt, TapeEventData, parse_jsonl_events, to_jsonl};
pub use replay::{ReplayHarness, ReplayReport};

#[derive(Debug, Error)]
pub enum TapeError {
    #[error("{path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Detect(#[from] DetectError),
}

/// A parsed session tape.
#[derive(Debug, Clone)]
pub struct Tape {
    pub id: String,
    pub path: Option<PathBuf>,
    pub events: Vec<TapeEventAt>,
}

impl Tape {
    pub fn parse(content: &str) -> Result<Self, TapeError> {
        Ok(Self {
            id: tape_id_for_contents(content),
            path: None,
            events: parse_jsonl_events(content)?,
        })
    }

    pub fn read(path: &Path) -> Result<Self, TapeError> {
        let content = compress::read_tape_text(path).map_err(|source| TapeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut tape = Self::parse(&content)?;
        tape.path = Some(path.to_path_buf());
        Ok(tape)
    }

    /// Session length: the timestamp of the last event.
    pub fn duration_ms(&self) -> u64 {
        self.events
            .iter()
            .map(|item| item.event.t)
            .max()
            .unwrap_or(0)
    }
}

/// SHA-256 of the tape's non-blank lines, trimmed and newline-joined, so that
/// whitespace and compression do not change a tape's identity.
pub fn tape_id_for_contents(content: &str) -> String {
    let mut hasher = Sha256::new();
    for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tape_id_ignores_blank_lines_and_indentation() {
        let compact = "{\"t\":0,\"k\":\"tick\"}\n{\"t\":1,\"k\":\"commit\"}\n";
        let padded = "\n  {\"t\":0,\"k\":\"tick\"}\n\n{\"t\":1,\"k\":\"commit\"}  ";
        assert_eq!(tape_id_for_contents(compact), tape_id_for_contents(padded));
        assert_eq!(tape_id_for_contents(compact).len(), 64);
        assert_ne!(
            tape_id_for_contents(compact),
            tape_id_for_contents("{\"t\":0,\"k\":\"tick\"}\n")
        );
    }

    #[test]
    fn zstd_tape_reads_with_same_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = "{\"t\":0,\"k\":\"arm\",\"armed\":true}\n{\"t\":40,\"k\":\"tick\",\"count\":2}\n";
        let plain = dir.path().join("a.jsonl");
        let packed = dir.path().join("a.jsonl.zst");
        compress::write_tape_text(&plain, body).expect("write plain");
        compress::write_tape_text(&packed, body).expect("write packed");

        let from_plain = Tape::read(&plain).expect("read plain");
        let from_packed = Tape::read(&packed).expect("read packed");
        assert_eq!(from_plain.id, from_packed.id);
        assert_eq!(from_packed.events.len(), 2);
        assert_eq!(from_packed.duration_ms(), 40);
    }

    #[test]
    fn missing_tape_reports_its_path() {
        let err = Tape::read(Path::new("/nonexistent/tape.jsonl")).expect_err("missing");
        assert!(err.to_string().contains("/nonexistent/tape.jsonl"));
    }
}
