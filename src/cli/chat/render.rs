use std::borrow::Cow;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

use color_print::cwriteln;
use eyre::Result;
use regex::Regex;
use tracing::warn;

use super::conversation_state::{Message, Role};
use crate::error::{TurnError, TurnResult};

const REPLACEMENT: char = '?';

/// Character set the terminal can display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEncoding {
    Utf8,
    Ascii,
}

impl DisplayEncoding {
    /// Reads the locale the same way libc does: `LC_ALL`, then `LC_CTYPE`,
    /// then `LANG`. An unset locale is assumed to be UTF-8.
    pub fn detect() -> Self {
        let locale = ["LC_ALL", "LC_CTYPE", "LANG"]
            .iter()
            .filter_map(|key| env::var(key).ok())
            .find(|value| !value.is_empty());

        match locale {
            Some(value) => Self::from_locale(&value),
            None => DisplayEncoding::Utf8,
        }
    }

    pub fn from_locale(locale: &str) -> Self {
        let lowered = locale.to_ascii_lowercase();
        if lowered.contains("utf-8") || lowered.contains("utf8") {
            DisplayEncoding::Utf8
        } else {
            DisplayEncoding::Ascii
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DisplayEncoding::Utf8 => "UTF-8",
            DisplayEncoding::Ascii => "ASCII",
        }
    }

    fn can_encode(&self, ch: char) -> bool {
        match self {
            DisplayEncoding::Utf8 => true,
            DisplayEncoding::Ascii => ch.is_ascii(),
        }
    }

    /// Returns the text unchanged, or the first character it cannot represent.
    pub fn encode_strict<'a>(&self, text: &'a str) -> TurnResult<&'a str> {
        match text.char_indices().find(|(_, ch)| !self.can_encode(*ch)) {
            Some((index, ch)) => Err(TurnError::Encoding {
                ch,
                index,
                encoding: self.name(),
            }),
            None => Ok(text),
        }
    }

    /// Best-effort version of `encode_strict`: unrepresentable characters are
    /// replaced rather than dropped, so non-empty input stays non-empty.
    pub fn encode_lossy<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match self.encode_strict(text) {
            Ok(text) => Cow::Borrowed(text),
            Err(_) => Cow::Owned(
                text.chars()
                    .map(|ch| if self.can_encode(ch) { ch } else { REPLACEMENT })
                    .collect(),
            ),
        }
    }
}

fn control_sequences() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b[@-_]|[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]")
            .expect("control sequence pattern is valid")
    })
}

/// Removes terminal escape sequences and control characters from model text
/// so a reply cannot move the cursor or recolor the terminal.
pub fn strip_control(text: &str) -> Cow<'_, str> {
    control_sequences().replace_all(text, "")
}

/// Writes transcript text to the terminal.
///
/// Writing never fails on content: text the display cannot represent goes
/// through `encode_lossy` and the fallback is remembered until
/// `take_encoding_fallback` is called.
pub struct Renderer<'a> {
    output: &'a mut dyn Write,
    encoding: DisplayEncoding,
    encoding_fallback: bool,
}

impl<'a> Renderer<'a> {
    pub fn new(output: &'a mut dyn Write, encoding: DisplayEncoding) -> Self {
        Self {
            output,
            encoding,
            encoding_fallback: false,
        }
    }

    fn safe_text<'t>(&mut self, text: &'t str) -> Cow<'t, str> {
        let text = strip_control(text);
        if let Err(e) = self.encoding.encode_strict(&text) {
            warn!("{}; falling back to lossy output", e);
            self.encoding_fallback = true;
            return Cow::Owned(self.encoding.encode_lossy(&text).into_owned());
        }
        text
    }

    /// Writes one streamed piece of the reply and flushes it immediately.
    pub fn write_chunk(&mut self, chunk: &str) -> Result<()> {
        let text = self.safe_text(chunk);
        self.output.write_all(text.as_bytes())?;
        self.output.flush()?;
        Ok(())
    }

    pub fn role_header(&mut self, role: Role) -> Result<()> {
        match role {
            Role::User => cwriteln!(self.output, "<cyan><bold>you</bold></cyan>")?,
            Role::Assistant => cwriteln!(self.output, "<green><bold>assistant</bold></green>")?,
        }
        Ok(())
    }

    pub fn message(&mut self, message: &Message) -> Result<()> {
        self.role_header(message.role())?;
        let text = self.safe_text(message.content());
        writeln!(self.output, "{}", text)?;
        writeln!(self.output)?;
        Ok(())
    }

    /// Re-renders a whole history in order.
    pub fn transcript(&mut self, messages: &[Message]) -> Result<()> {
        for message in messages {
            self.message(message)?;
        }
        Ok(())
    }

    pub fn end_message(&mut self) -> Result<()> {
        writeln!(self.output)?;
        writeln!(self.output)?;
        self.output.flush()?;
        Ok(())
    }

    pub fn info(&mut self, text: &str) -> Result<()> {
        cwriteln!(self.output, "<blue>{}</>", self.encoding.encode_lossy(text))?;
        Ok(())
    }

    pub fn warning(&mut self, text: &str) -> Result<()> {
        cwriteln!(self.output, "<yellow>{}</>", self.encoding.encode_lossy(text))?;
        Ok(())
    }

    pub fn error(&mut self, text: &str) -> Result<()> {
        cwriteln!(self.output, "<red>{}</>", self.encoding.encode_lossy(text))?;
        Ok(())
    }

    /// Reports and resets whether any text since the last call needed the
    /// lossy fallback.
    pub fn take_encoding_fallback(&mut self) -> bool {
        std::mem::take(&mut self.encoding_fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locale_detection() {
        assert_eq!(DisplayEncoding::from_locale("en_US.UTF-8"), DisplayEncoding::Utf8);
        assert_eq!(DisplayEncoding::from_locale("C.utf8"), DisplayEncoding::Utf8);
        assert_eq!(DisplayEncoding::from_locale("C"), DisplayEncoding::Ascii);
        assert_eq!(DisplayEncoding::from_locale("POSIX"), DisplayEncoding::Ascii);
    }

    #[test]
    fn strict_encoding_reports_first_bad_character() {
        let err = DisplayEncoding::Ascii.encode_strict("ok \u{1f600}").unwrap_err();
        assert_eq!(
            err,
            TurnError::Encoding {
                ch: '\u{1f600}',
                index: 3,
                encoding: "ASCII"
            }
        );
        assert!(DisplayEncoding::Utf8.encode_strict("ok \u{1f600}").is_ok());
    }

    #[test]
    fn lossy_encoding_never_empties_text() {
        assert_eq!(DisplayEncoding::Ascii.encode_lossy("caf\u{e9}"), "caf?");
        assert_eq!(DisplayEncoding::Ascii.encode_lossy("\u{1f600}\u{1f600}"), "??");
        assert!(matches!(DisplayEncoding::Ascii.encode_lossy("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn strips_terminal_escapes() {
        assert_eq!(strip_control("\x1b[2Jhello\x1b[31m red\x07"), "hello red");
        assert_eq!(strip_control("line one\nline two\ttab"), "line one\nline two\ttab");
    }

    #[test]
    fn unencodable_chunk_falls_back_without_error() {
        let mut out: Vec<u8> = Vec::new();
        let mut renderer = Renderer::new(&mut out, DisplayEncoding::Ascii);

        renderer.write_chunk("Hi \u{1f44b}").unwrap();
        assert!(renderer.take_encoding_fallback());
        assert!(!renderer.take_encoding_fallback());

        assert_eq!(String::from_utf8(out).unwrap(), "Hi ?");
    }

    #[test]
    fn transcript_renders_history_with_fallback() {
        let mut out: Vec<u8> = Vec::new();
        let mut renderer = Renderer::new(&mut out, DisplayEncoding::Ascii);
        renderer
            .transcript(&[Message::user("hello"), Message::assistant("\u{4f60}\u{597d}")])
            .unwrap();
        assert!(renderer.take_encoding_fallback());

        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("hello"));
        assert!(printed.contains("??"));
        assert!(printed.contains("assistant"));
    }
}
