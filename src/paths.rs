use std::path::PathBuf;
use std::sync::OnceLock;

static CODESTREAM_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Returns the home directory (`~/.codestream/`).
/// Supports `$CODESTREAM_HOME` env override. Cached via `OnceLock`.
pub fn codestream_home() -> &'static PathBuf {
    CODESTREAM_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("CODESTREAM_HOME") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".codestream")
    })
}

/// `~/.codestream/config/`
pub fn config_dir() -> PathBuf {
    codestream_home().join("config")
}

/// `~/.codestream/logs/`
pub fn logs_dir() -> PathBuf {
    codestream_home().join("logs")
}
