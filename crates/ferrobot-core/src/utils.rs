//! Path and string helpers shared across crates.

use std::path::PathBuf;

/// Get the Ferrobot data directory (`~/.ferrobot/`).
pub fn get_data_path() -> PathBuf {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".ferrobot")
}

/// Get the shared media download directory (`~/.ferrobot/media/`).
pub fn get_media_path() -> PathBuf {
    get_data_path().join("media")
}

/// Sanitize a string for use as a filename.
pub fn safe_filename(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Expand `~` to the home directory in a path string.
pub fn expand_home(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        let home = home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(path.trim_start_matches("~/"))
    } else {
        PathBuf::from(path)
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("USERPROFILE").ok().map(PathBuf::from))
}
