//! Shared CLI helpers — path expansion, response printing, banner.

use std::path::PathBuf;

use colored::Colorize;

/// Expand `~` at the start of a path to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs_next::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Print an agent response to stdout.
pub fn print_response(response: &str) {
    println!();
    println!("{}", "Ferrobot".cyan().bold());
    if response.is_empty() {
        println!("{}", "(no response)".dimmed());
    } else {
        println!("{response}");
    }
    println!();
}

/// Print the banner shown at startup.
pub fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    println!();
    println!("{}  v{}", "Ferrobot".cyan().bold(), version.dimmed());
    println!("{}", "Type a message, or \"exit\" to quit.".dimmed());
    println!();
}

/// Print a "thinking" placeholder (for non-log mode).
pub fn print_thinking() {
    eprint!("{}", "thinking...".dimmed());
}

/// Clear the "thinking" placeholder.
pub fn clear_thinking() {
    eprint!("\r{}\r", " ".repeat(40));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_home() {
        let result = expand_tilde("~/foo/bar");
        assert!(result.ends_with("foo/bar"));
        assert!(!result.starts_with("~"));
    }

    #[test]
    fn expand_tilde_no_tilde() {
        let result = expand_tilde("/absolute/path");
        assert_eq!(result, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn expand_tilde_bare() {
        let result = expand_tilde("~");
        assert!(!result.to_string_lossy().contains('~'));
    }
}
