//! Error classification.
//!
//! Commands mostly propagate `anyhow::Error` with context attached; this
//! module adds the kind tag that the worker pool needs to pick the single
//! most severe error to surface after a parallel phase, and that the
//! drivers use to decide whether a backup must be marked ERROR or
//! CORRUPT.

use std::fmt;

/// Kind of failure, ordered by severity (least severe first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorKind {
    /// User-visible input errors; rejected before any mutation.
    Policy,
    /// A file, WAL segment or backup id was not found. Often not fatal:
    /// a source file vanishing during backup is recorded, not raised.
    Missing,
    /// open/read/write/seek failures, with path and operation attached.
    SystemIo,
    /// Page header invalid, checksum mismatch, WAL record corrupt,
    /// manifest parse error.
    Format,
    /// Catalog inconsistencies: missing parents, diverging chains,
    /// timelines not in history. Marks backups ORPHAN/CORRUPT.
    Invariant,
    /// Agent protocol desync, version mismatch, unexpected EOF on the
    /// pipe. Terminates the worker pool.
    Remote,
}

/// An error with its kind attached.
#[derive(Debug)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub source: anyhow::Error,
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.source)
    }
}

impl std::error::Error for ClassifiedError {}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, source: anyhow::Error) -> ClassifiedError {
        ClassifiedError { kind, source }
    }
}

impl From<anyhow::Error> for ClassifiedError {
    fn from(source: anyhow::Error) -> Self {
        // Unclassified errors behave like I/O failures: fatal to the
        // current command, no special catalog handling.
        ClassifiedError {
            kind: ErrorKind::SystemIo,
            source,
        }
    }
}

/// Extension to tag an anyhow result with a kind.
pub trait ClassifyExt<T> {
    fn classify(self, kind: ErrorKind) -> Result<T, ClassifiedError>;
}

impl<T> ClassifyExt<T> for anyhow::Result<T> {
    fn classify(self, kind: ErrorKind) -> Result<T, ClassifiedError> {
        self.map_err(|e| ClassifiedError::new(kind, e))
    }
}

/// Pick the most severe of the collected worker errors.
pub fn most_severe(errors: Vec<ClassifiedError>) -> Option<ClassifiedError> {
    errors.into_iter().max_by_key(|e| e.kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order() {
        assert!(ErrorKind::Remote > ErrorKind::Format);
        assert!(ErrorKind::Format > ErrorKind::SystemIo);
        assert!(ErrorKind::SystemIo > ErrorKind::Missing);
        assert!(ErrorKind::Missing > ErrorKind::Policy);
    }

    #[test]
    fn picks_most_severe() {
        let errs = vec![
            ClassifiedError::new(ErrorKind::Missing, anyhow::anyhow!("a")),
            ClassifiedError::new(ErrorKind::Remote, anyhow::anyhow!("b")),
            ClassifiedError::new(ErrorKind::Format, anyhow::anyhow!("c")),
        ];
        assert_eq!(most_severe(errs).unwrap().kind, ErrorKind::Remote);
    }
}
