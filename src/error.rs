use std::backtrace::Backtrace;

use thiserror::Error;

/// Stack frames kept when a build failure is wrapped. A frame is its
/// numbered symbol line plus the `at file:line` lines under it.
pub const MAX_TRACE_FRAMES: usize = 30;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Nothing to import: the file is empty")]
    NothingToImport,

    #[error("Missing column! Column {0} you try to import is not present in the move line")]
    UnknownColumn(String),

    #[error("Column {0} not present in file")]
    MissingColumn(String),

    #[error("Invalid value '{value}' for field {field}")]
    InvalidValue { field: String, value: String },

    #[error("Unknown file type: {0}")]
    UnknownFileType(String),

    #[error("Unknown profile: {0}")]
    UnknownProfile(String),

    #[error("A profile with code {0} already exists")]
    DuplicateProfileCode(String),

    #[error("Profile {0} is not used for import")]
    ProfileNotImportable(String),

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Unknown partner: {0}")]
    UnknownPartner(String),

    #[error("Unknown move: {0}")]
    UnknownMove(String),

    #[error("Unknown completion rule function: {0}")]
    UnknownRule(String),

    #[error("Unknown import type: {0}")]
    UnknownImportType(String),

    #[error("Profile {profile} has no default {side} account")]
    MissingDefaultAccount { profile: String, side: &'static str },

    #[error("Line named \"{label}\" was matched by more than one partner ({count})")]
    TooManyPartners { label: String, count: usize },

    #[error("Statement import error. The statement cannot be created: Error: {kind}\nDescription: {description}\nTraceback:\n{trace}")]
    Build {
        kind: &'static str,
        description: String,
        trace: String,
    },

    #[error("{0}")]
    Other(String),
}

impl ImportError {
    /// Variant name, reported as the error type of a wrapped build failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Db(_) => "Db",
            Self::Io(_) => "Io",
            Self::Csv(_) => "Csv",
            Self::Spreadsheet(_) => "Spreadsheet",
            Self::Settings(_) => "Settings",
            Self::NothingToImport => "NothingToImport",
            Self::UnknownColumn(_) => "UnknownColumn",
            Self::MissingColumn(_) => "MissingColumn",
            Self::InvalidValue { .. } => "InvalidValue",
            Self::UnknownFileType(_) => "UnknownFileType",
            Self::UnknownProfile(_) => "UnknownProfile",
            Self::DuplicateProfileCode(_) => "DuplicateProfileCode",
            Self::ProfileNotImportable(_) => "ProfileNotImportable",
            Self::UnknownAccount(_) => "UnknownAccount",
            Self::UnknownPartner(_) => "UnknownPartner",
            Self::UnknownMove(_) => "UnknownMove",
            Self::UnknownRule(_) => "UnknownRule",
            Self::UnknownImportType(_) => "UnknownImportType",
            Self::MissingDefaultAccount { .. } => "MissingDefaultAccount",
            Self::TooManyPartners { .. } => "TooManyPartners",
            Self::Build { .. } => "Build",
            Self::Other(_) => "Other",
        }
    }

    /// Errors caused by the submitted file or arguments.
    pub fn is_user_input(&self) -> bool {
        matches!(
            self,
            Self::NothingToImport
                | Self::UnknownColumn(_)
                | Self::MissingColumn(_)
                | Self::InvalidValue { .. }
                | Self::UnknownFileType(_)
                | Self::UnknownProfile(_)
                | Self::DuplicateProfileCode(_)
                | Self::ProfileNotImportable(_)
                | Self::UnknownAccount(_)
                | Self::UnknownPartner(_)
                | Self::UnknownMove(_)
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownRule(_) | Self::UnknownImportType(_) | Self::MissingDefaultAccount { .. }
        )
    }

    /// Wrap a failure raised while a move was being built into a single
    /// `Build` error carrying the inner error's kind, message chain and a
    /// truncated backtrace. Already wrapped errors are returned unchanged.
    ///
    /// The backtrace is captured here, so it shows the wrap site (the
    /// builder step that failed), not the point where the inner error
    /// was raised.
    pub fn into_build_failure(self) -> ImportError {
        if let Self::Build { .. } = self {
            return self;
        }
        let mut description = self.to_string();
        let mut source = std::error::Error::source(&self);
        while let Some(cause) = source {
            description.push_str(&format!("\nCaused by: {cause}"));
            source = cause.source();
        }
        let trace = truncate_frames(&Backtrace::force_capture().to_string(), MAX_TRACE_FRAMES);
        ImportError::Build {
            kind: self.kind(),
            description,
            trace,
        }
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;

/// Frame headers look like `  12: crate::module::function`.
fn is_frame_header(line: &str) -> bool {
    line.trim_start()
        .split_once(": ")
        .is_some_and(|(index, _)| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

fn truncate_frames(trace: &str, max_frames: usize) -> String {
    let mut frames = 0;
    trace
        .lines()
        .take_while(|line| {
            if is_frame_header(line) {
                frames += 1;
            }
            frames <= max_frames
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_failure_keeps_kind_and_message() {
        let err = ImportError::UnknownAccount("999".to_string()).into_build_failure();
        match &err {
            ImportError::Build { kind, description, trace } => {
                assert_eq!(*kind, "UnknownAccount");
                assert!(description.contains("Unknown account: 999"));
                assert!(trace.lines().filter(|l| is_frame_header(l)).count() <= MAX_TRACE_FRAMES);
            }
            other => panic!("expected build failure, got {other:?}"),
        }
        let text = err.to_string();
        assert!(text.starts_with("Statement import error"));
        assert!(text.contains("Error: UnknownAccount"));
    }

    #[test]
    fn test_trace_is_cut_by_frame_not_by_line() {
        let trace = (0..40)
            .map(|i| format!("  {i}: frame_{i}\n             at src/lib.rs:{i}:5"))
            .collect::<Vec<_>>()
            .join("\n");
        let kept = truncate_frames(&trace, 30);
        assert_eq!(kept.lines().filter(|l| is_frame_header(l)).count(), 30);
        // Each kept frame keeps its location line.
        assert_eq!(kept.lines().count(), 60);
        assert!(kept.ends_with("at src/lib.rs:29:5"));
        assert!(!kept.contains("frame_30"));
        assert_eq!(truncate_frames(&trace, 100), trace);
    }

    #[test]
    fn test_build_failure_is_not_rewrapped() {
        let err = ImportError::Other("boom".to_string()).into_build_failure();
        let again = err.into_build_failure();
        match again {
            ImportError::Build { kind, .. } => assert_eq!(kind, "Other"),
            other => panic!("expected build failure, got {other:?}"),
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(ImportError::NothingToImport.is_user_input());
        assert!(ImportError::UnknownColumn("foo".into()).is_user_input());
        assert!(ImportError::DuplicateProfileCode("BNK".into()).is_user_input());
        assert!(ImportError::UnknownRule("nope".into()).is_configuration());
        assert!(!ImportError::UnknownRule("nope".into()).is_user_input());
    }
}
