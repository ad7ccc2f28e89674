//! Common utility functions for the simulator.
//!
//! This module contains shared utilities for the CLI:
//! - Logger initialization
//! - Input and output path handling

use std::error::Error;
use std::path::{Path, PathBuf};

/// Initialize the logger with the specified configuration.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to log file (logs to stderr if None)
///
/// # Errors
/// Returns an error if the log file cannot be opened or logger initialization fails.
pub fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {} - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        ensure_parent_dir(log_path)?;
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

/// Validate that an input file exists.
///
/// # Errors
/// Returns an error if the path does not exist or is not a regular file.
pub fn validate_input_file(input: &Path) -> Result<(), Box<dyn Error>> {
    if !input.exists() {
        return Err(format!("Input path '{}' does not exist.", input.display()).into());
    }
    if !input.is_file() {
        return Err(format!("Input path '{}' is not a file.", input.display()).into());
    }
    Ok(())
}

/// Create the parent directory of `path` if it is missing.
pub fn ensure_parent_dir(path: &Path) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Output path of one trial when several trials are run: `{stem}_trial{index}.{ext}`.
pub fn trial_output_path(output: &Path, index: usize) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("results");
    let name = match output.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{stem}_trial{index}.{ext}"),
        None => format!("{stem}_trial{index}"),
    };
    output.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_validate_input_file() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("map.toml");
        File::create(&file_path).unwrap();

        assert!(validate_input_file(&file_path).is_ok());
        assert!(validate_input_file(dir.path()).is_err());
        assert!(validate_input_file(Path::new("/nonexistent/map.toml")).is_err());
    }

    #[test]
    fn test_ensure_parent_dir_creates_nested_directories() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("a").join("b").join("out.csv");
        ensure_parent_dir(&output).unwrap();
        assert!(dir.path().join("a").join("b").is_dir());
        assert!(ensure_parent_dir(Path::new("out.csv")).is_ok());
    }

    #[test]
    fn test_trial_output_path() {
        assert_eq!(
            trial_output_path(Path::new("runs/out.csv"), 3),
            PathBuf::from("runs/out_trial3.csv")
        );
        assert_eq!(
            trial_output_path(Path::new("out"), 0),
            PathBuf::from("out_trial0")
        );
    }
}
