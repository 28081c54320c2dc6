//! Locating the system Python interpreter and querying it for the PEP 508
//! marker environment of the machine we are resolving for.

use pep508_rs::MarkerEnvironment;
use std::io;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use thiserror::Error;

/// Specifies where to find the python executable.
#[derive(Debug, Clone, Default)]
pub enum PythonLocation {
    /// Use the python interpreter found on the PATH.
    #[default]
    System,

    /// Use the interpreter at this path.
    Custom(PathBuf),
}

impl PythonLocation {
    /// Resolves to a concrete executable path.
    pub fn executable(&self) -> Result<PathBuf, FindPythonError> {
        match self {
            PythonLocation::System => system_python_executable(),
            PythonLocation::Custom(path) => Ok(path.clone()),
        }
    }
}

/// An error that can occur when trying to find the python interpreter.
#[derive(Debug, Error)]
pub enum FindPythonError {
    /// No interpreter was found on the PATH.
    #[error("could not find python executable on the PATH")]
    NotFound,
}

/// Returns the path of the python executable found on the PATH.
pub fn system_python_executable() -> Result<PathBuf, FindPythonError> {
    which::which("python3")
        .or_else(|_| which::which("python"))
        .map_err(|_| FindPythonError::NotFound)
}

/// An error that can occur while querying the interpreter for its markers.
#[derive(Debug, Error)]
pub enum FromPythonError {
    #[allow(missing_docs)]
    #[error(transparent)]
    CouldNotFindPythonExecutable(#[from] FindPythonError),

    #[allow(missing_docs)]
    #[error(transparent)]
    FailedToExecute(#[from] io::Error),

    #[allow(missing_docs)]
    #[error(transparent)]
    FailedToParse(#[from] serde_json::Error),

    #[allow(missing_docs)]
    #[error("execution failed with exit code {0}")]
    FailedToRun(ExitStatus),
}

/// Try to determine the marker environment by executing the system python.
pub async fn markers_from_env() -> Result<MarkerEnvironment, FromPythonError> {
    let python = system_python_executable()?;
    tracing::info!("using python executable at {}", python.display());
    markers_from_python(python.as_path()).await
}

/// Try to determine the marker environment from an existing python executable. The executable is
/// used to run a small python program that dumps the information as json.
pub async fn markers_from_python(python: &Path) -> Result<MarkerEnvironment, FromPythonError> {
    let pep508_bytes = include_str!("python_env/pep508.py");

    let output = match tokio::process::Command::new(python)
        .arg("-c")
        .arg(pep508_bytes)
        .output()
        .await
    {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(FromPythonError::CouldNotFindPythonExecutable(
                FindPythonError::NotFound,
            ))
        }
        Err(e) => return Err(FromPythonError::FailedToExecute(e)),
        Ok(output) => output,
    };

    if !output.status.success() {
        return Err(FromPythonError::FailedToRun(output.status));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(serde_json::from_str(stdout.trim())?)
}
