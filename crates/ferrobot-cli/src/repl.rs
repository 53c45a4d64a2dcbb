//! Interactive REPL over `process_direct`, with persistent history.

use anyhow::Result;
use rustyline::config::Configurer;
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};
use tracing::debug;

use ferrobot_agent::AgentLoop;

use crate::helpers;

/// Exit commands (case-insensitive match).
const EXIT_COMMANDS: &[&str] = &["exit", "quit", "/exit", "/quit", ":q"];

/// Run the interactive REPL loop.
pub async fn run(agent: AgentLoop) -> Result<()> {
    helpers::print_banner();

    let mut editor = create_editor()?;

    loop {
        let input = match editor.readline("You: ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {e}");
                break;
            }
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            continue;
        }

        if is_exit_command(trimmed) {
            println!("\nGoodbye!");
            break;
        }

        let _ = editor.add_history_entry(&input);

        debug!(input = trimmed, "processing input");
        helpers::print_thinking();

        match agent.process_direct(trimmed).await {
            Ok(response) => {
                helpers::clear_thinking();
                helpers::print_response(&response);
            }
            Err(e) => {
                helpers::clear_thinking();
                eprintln!("\nError: {e}\n");
            }
        }
    }

    save_history(&mut editor);
    Ok(())
}

fn create_editor() -> Result<Editor<(), DefaultHistory>> {
    let mut editor = DefaultEditor::new()?;
    editor.set_max_history_size(1000)?;

    let history_path = history_path();
    if history_path.exists() {
        let _ = editor.load_history(&history_path);
    }

    Ok(editor)
}

fn save_history(editor: &mut Editor<(), DefaultHistory>) {
    let path = history_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = editor.save_history(&path) {
        debug!("failed to save history: {e}");
    }
}

fn history_path() -> std::path::PathBuf {
    ferrobot_core::utils::get_data_path()
        .join("history")
        .join("cli_history")
}

fn is_exit_command(input: &str) -> bool {
    let lower = input.to_lowercase();
    EXIT_COMMANDS.contains(&lower.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_commands() {
        assert!(is_exit_command("exit"));
        assert!(is_exit_command("QUIT"));
        assert!(is_exit_command("/exit"));
        assert!(is_exit_command(":q"));
        assert!(!is_exit_command("hello"));
    }
}
