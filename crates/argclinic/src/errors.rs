use std::fmt;

/// The single error type for every user-facing failure.
///
/// Keeping one kind (rather than a taxonomy) matches how the tool reports:
/// every diagnostic is a one-line message, optionally pinned to a file and
/// line, and the process exits with status 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClinicError {
    pub message: String,
    pub filename: Option<String>,
    pub lineno: Option<usize>,
}

impl ClinicError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            filename: None,
            lineno: None,
        }
    }

    /// Attaches a location to the error, without clobbering one that a
    /// deeper layer already recorded.
    #[must_use]
    pub fn with_location(mut self, filename: &str, lineno: usize) -> Self {
        if self.filename.is_none() {
            self.filename = Some(filename.to_owned());
        }
        if self.lineno.is_none() {
            self.lineno = Some(lineno);
        }
        self
    }

    /// Attaches just a filename, when no line is known.
    #[must_use]
    pub fn with_filename(mut self, filename: &str) -> Self {
        if self.filename.is_none() {
            self.filename = Some(filename.to_owned());
        }
        self
    }

    /// One-line diagnostic for the CLI, e.g. `file.c:12: bad indent`.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = String::from("Error");
        if let Some(filename) = &self.filename {
            out.push_str(&format!(" in file {filename:?}"));
        }
        if let Some(lineno) = self.lineno {
            out.push_str(&format!(" on line {lineno}"));
        }
        out.push_str(":\n");
        out.push_str(&self.message);
        out.push('\n');
        out
    }
}

impl fmt::Display for ClinicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.filename, self.lineno) {
            (Some(file), Some(line)) => write!(f, "{file}:{line}: {}", self.message),
            (Some(file), None) => write!(f, "{file}: {}", self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ClinicError {}

impl From<std::io::Error> for ClinicError {
    fn from(error: std::io::Error) -> Self {
        Self::new(error.to_string())
    }
}

pub type ClinicResult<T> = Result<T, ClinicError>;

/// Returns a [`ClinicError`] from the current function, `anyhow::bail` style.
macro_rules! fail {
    ($($arg:tt)*) => {
        return Err($crate::errors::ClinicError::new(format!($($arg)*)))
    };
}

pub(crate) use fail;
