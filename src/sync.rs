//! Sync exception assembly.
//!
//! A sync sweeps many file systems and must keep going when one of them
//! misbehaves. The builder collects causes with a severity each; at the
//! end, [`SyncExceptionBuilder::check`] yields nothing, one composite
//! [`FsSyncError::Warning`], or one composite [`FsSyncError::Fatal`] —
//! fatal causes (possible data loss) take precedence over warnings.

use std::fmt;

use crate::addr::MountPoint;
use crate::error::FsError;

/// One collected sync problem.
#[derive(Debug)]
pub struct SyncIssue {
    pub mount_point: MountPoint,
    pub cause: FsError,
}

impl fmt::Display for SyncIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.mount_point.canonical(), self.cause)
    }
}

/// The causes carried by a composite sync error.
#[derive(Debug, Default)]
pub struct SyncIssues(Vec<SyncIssue>);

impl SyncIssues {
    pub fn iter(&self) -> impl Iterator<Item = &SyncIssue> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SyncIssues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

/// The composite outcome of a failed or degraded sync.
#[derive(Debug, thiserror::Error)]
pub enum FsSyncError {
    /// Sync committed everything, but something non-destructive went
    /// wrong (e.g. a stream had to be forced closed). Safe to continue.
    #[error("sync completed with warnings: {0}")]
    Warning(SyncIssues),

    /// Sync could not commit everything; data may have been lost.
    #[error("sync failed, data may have been lost: {0}")]
    Fatal(SyncIssues),
}

impl FsSyncError {
    pub fn issues(&self) -> &SyncIssues {
        match self {
            FsSyncError::Warning(issues) | FsSyncError::Fatal(issues) => issues,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, FsSyncError::Fatal(_))
    }
}

/// Accumulates sync problems across controllers.
#[derive(Debug, Default)]
pub struct SyncExceptionBuilder {
    warnings: Vec<SyncIssue>,
    fatals: Vec<SyncIssue>,
}

impl SyncExceptionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a non-destructive problem and continues.
    pub fn warn(&mut self, mount_point: MountPoint, cause: FsError) {
        tracing::warn!(mount_point = %mount_point, %cause, "sync warning");
        self.warnings.push(SyncIssue { mount_point, cause });
    }

    /// Records a destructive problem; the sweep continues so other file
    /// systems still get their chance to commit.
    pub fn fatal(&mut self, mount_point: MountPoint, cause: FsError) {
        tracing::warn!(mount_point = %mount_point, %cause, "sync failure");
        self.fatals.push(SyncIssue { mount_point, cause });
    }

    pub fn has_fatal(&self) -> bool {
        !self.fatals.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty() && self.fatals.is_empty()
    }

    /// Throws the assembly: `Ok` when clean, otherwise one composite
    /// error with fatal causes listed first.
    pub fn check(self) -> Result<(), FsSyncError> {
        if !self.fatals.is_empty() {
            let mut issues = self.fatals;
            issues.extend(self.warnings);
            Err(FsSyncError::Fatal(SyncIssues(issues)))
        } else if !self.warnings.is_empty() {
            Err(FsSyncError::Warning(SyncIssues(self.warnings)))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp() -> MountPoint {
        MountPoint::parse("zip:file:/a.zip!/").unwrap()
    }

    #[test]
    fn test_empty_builder_checks_clean() {
        assert!(SyncExceptionBuilder::new().check().is_ok());
    }

    #[test]
    fn test_warnings_only() {
        let mut b = SyncExceptionBuilder::new();
        b.warn(mp(), FsError::ThreadsBusy { total: 1, local: 0 });
        let err = b.check().unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.issues().len(), 1);
    }

    #[test]
    fn test_fatal_takes_precedence() {
        let mut b = SyncExceptionBuilder::new();
        b.warn(mp(), FsError::ThreadsBusy { total: 1, local: 0 });
        b.fatal(mp(), FsError::CorruptArchive("trailer".into()));
        let err = b.check().unwrap_err();
        assert!(err.is_fatal());
        // Fatal causes come first in the composite.
        assert_eq!(err.issues().len(), 2);
        assert!(matches!(
            err.issues().iter().next().unwrap().cause,
            FsError::CorruptArchive(_)
        ));
    }
}
