use std::io::{self, Write};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use eyre::Result;
use rustyline::{Config, Editor};

use crate::completion::Credential;

pub fn generate_prompt(custom_prompt: Option<&str>) -> String {
    custom_prompt.unwrap_or("> ").to_string()
}

pub fn rl() -> rustyline::Result<Editor<()>> {
    // History stays in memory; nothing typed in a session is saved.
    let config = Config::builder()
        .history_ignore_space(true)
        .build();
    Editor::with_config(config)
}

/// Asks for the API key with every typed character echoed as `*`.
///
/// Returns `None` when the user submits nothing or aborts with Esc / Ctrl-C.
pub fn read_credential(label: &str) -> Result<Option<Credential>> {
    let mut stdout = io::stdout();
    write!(stdout, "{}: ", label)?;
    stdout.flush()?;

    terminal::enable_raw_mode()?;
    let entered = read_masked(&mut stdout);
    terminal::disable_raw_mode()?;

    writeln!(stdout)?;
    Ok(entered?.and_then(Credential::new))
}

fn read_masked(out: &mut impl Write) -> Result<Option<String>> {
    let mut key = String::new();

    loop {
        let Event::Key(KeyEvent {
            code, modifiers, kind, ..
        }) = event::read()?
        else {
            continue;
        };

        if kind != KeyEventKind::Press {
            continue;
        }

        match code {
            KeyCode::Enter => return Ok(Some(key)),
            KeyCode::Esc => return Ok(None),
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => return Ok(None),
            KeyCode::Backspace => {
                if key.pop().is_some() {
                    write!(out, "\x08 \x08")?;
                    out.flush()?;
                }
            }
            KeyCode::Char(c) => {
                key.push(c);
                write!(out, "*")?;
                out.flush()?;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt() {
        assert_eq!(generate_prompt(None), "> ");
        assert_eq!(generate_prompt(Some("chat> ")), "chat> ");
    }
}
