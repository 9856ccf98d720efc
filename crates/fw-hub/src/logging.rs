use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::Arc,
};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

const LOG_FILE_NAME: &str = "fw-hub.log";

/// Keeps the log file open for the life of the process.
pub struct LogGuard {
    _file: Option<Arc<File>>,
}

/// Filter directive when `RUST_LOG` is unset: `FW_LOG_LEVEL`, then
/// `debug` for `--debug`, then `info`.
pub fn resolve_level(debug: bool, env_level: Option<String>) -> String {
    match env_level {
        Some(level) if !level.trim().is_empty() => level.trim().to_string(),
        _ if debug => "debug".to_string(),
        _ => "info".to_string(),
    }
}

pub fn init_logging(debug: bool, log_dir: Option<&Path>) -> Option<LogGuard> {
    let level = resolve_level(debug, std::env::var("FW_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = match log_dir.map(open_log_file).transpose() {
        Ok(file) => file,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer(file.clone()))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(LogGuard { _file: file })
}

/// Stdout, teed into the log file when there is one.
fn make_writer(file: Option<Arc<File>>) -> BoxMakeWriter {
    match file {
        Some(file) => BoxMakeWriter::new(io::stdout.and(file)),
        None => BoxMakeWriter::new(io::stdout),
    }
}

fn open_log_file(dir: &Path) -> io::Result<Arc<File>> {
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))?;
    Ok(Arc::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn env_level_wins_over_debug_flag() {
        assert_eq!(resolve_level(true, Some("warn".into())), "warn");
        assert_eq!(resolve_level(false, Some(" trace ".into())), "trace");
        assert_eq!(resolve_level(true, Some("  ".into())), "debug");
        assert_eq!(resolve_level(true, None), "debug");
        assert_eq!(resolve_level(false, None), "info");
    }

    #[test]
    fn tee_writes_reach_the_log_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("logs");
        let writer = make_writer(Some(open_log_file(&nested).expect("open")));
        let mut sink = writer.make_writer();
        sink.write_all(b"event=fw_test\n").expect("write");
        sink.flush().expect("flush");
        let contents = std::fs::read_to_string(nested.join(LOG_FILE_NAME)).expect("read");
        assert_eq!(contents, "event=fw_test\n");
    }
}
