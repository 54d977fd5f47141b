pub mod conversation_state;
pub mod prompt;
pub mod render;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

use std::io::Write;
use std::process::ExitCode;

use eyre::Result;
use prompt::generate_prompt;
use render::{DisplayEncoding, Renderer};
use rustyline::error::ReadlineError;
use session::{Session, TurnOutcome};
use tracing::{debug, error};

use crate::completion::CompletionBackend;
use crate::error::TurnError;

const WELCOME_TEXT: &str = "
Hi, I'm a chatbot backed by OpenAI's chat models. Ask me anything.

/help         Show the help dialogue
/quit         Quit the application
";

const HELP_TEXT: &str = "
GPT Chat CLI

/clear        Clear the conversation history
/history      Show the conversation so far
/key          Enter a different OpenAI API key
/help         Show this help dialogue
/quit         Quit the application

Press Ctrl-C while a reply is streaming to cancel it.
";

const KEY_LABEL: &str = "OpenAI API Key";
const KEY_MISSING_TEXT: &str = "Please add your OpenAI API key to continue. Use /key to enter one.";
const RATE_LIMITED_TEXT: &str = "Rate limit reached. Please wait and try again shortly.";
const ENCODING_TEXT: &str = "A Unicode encoding error occurred. Some characters may not display correctly.";
const CANCELLED_TEXT: &str = "Response cancelled.";

pub struct ChatContext<B> {
    output: Box<dyn Write>,
    input: Option<String>,
    interactive: bool,
    encoding: DisplayEncoding,
    session: Session<B>,
}

impl<B: CompletionBackend> ChatContext<B> {
    pub fn new(
        output: Box<dyn Write>,
        input: Option<String>,
        interactive: bool,
        session: Session<B>,
    ) -> Self {
        Self {
            output,
            input,
            interactive,
            encoding: DisplayEncoding::detect(),
            session,
        }
    }

    pub fn with_encoding(mut self, encoding: DisplayEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub async fn run(&mut self) -> Result<ExitCode> {
        // Handle non-interactive mode (single query)
        if let Some(input) = self.input.take() {
            let outcome = self.handle_chat_input(&input).await?;
            return Ok(match outcome {
                TurnOutcome::Completed { .. } => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            });
        }

        if self.interactive {
            self.print_welcome()?;
            if !self.session.has_credential() {
                self.ask_for_credential()?;
            }
            self.run_interactive().await?;
        }

        Ok(ExitCode::SUCCESS)
    }

    fn renderer(&mut self) -> Renderer<'_> {
        Renderer::new(self.output.as_mut(), self.encoding)
    }

    fn print_welcome(&mut self) -> Result<()> {
        writeln!(self.output, "{}", WELCOME_TEXT)?;
        Ok(())
    }

    fn ask_for_credential(&mut self) -> Result<()> {
        let credential = prompt::read_credential(KEY_LABEL)?;
        let missing = credential.is_none();
        self.session.set_credential(credential);

        if missing {
            self.renderer().info(KEY_MISSING_TEXT)?;
        }
        Ok(())
    }

    async fn run_interactive(&mut self) -> Result<()> {
        let mut rl = prompt::rl()?;

        loop {
            let prompt_text = generate_prompt(None);
            let readline = rl.readline(&prompt_text);

            match readline {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }

                    rl.add_history_entry(line.as_str());

                    if line.trim() == "/quit" {
                        break;
                    }

                    if let Err(e) = self.handle_input(&line).await {
                        error!("Failed to handle input: {}", e);
                        writeln!(self.output, "Error: {}", e)?;
                    }
                }
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(e) => {
                    writeln!(self.output, "Error: {}", e)?;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_input(&mut self, input: &str) -> Result<()> {
        match input.trim() {
            "/help" => {
                writeln!(self.output, "{}", HELP_TEXT)?;
            }
            "/clear" => {
                self.session.reset();
                writeln!(self.output, "Conversation cleared.")?;
            }
            "/history" => {
                self.print_history()?;
            }
            "/key" => {
                self.ask_for_credential()?;
            }
            _ => {
                self.handle_chat_input(input).await?;
            }
        }

        Ok(())
    }

    fn print_history(&mut self) -> Result<()> {
        let Self {
            output,
            encoding,
            session,
            ..
        } = self;
        let mut renderer = Renderer::new(output.as_mut(), *encoding);

        if session.conversation().is_empty() {
            renderer.info("The conversation is empty.")?;
            return Ok(());
        }

        renderer.transcript(session.conversation().all())?;
        if renderer.take_encoding_fallback() {
            renderer.warning(ENCODING_TEXT)?;
        }
        Ok(())
    }

    async fn handle_chat_input(&mut self, input: &str) -> Result<TurnOutcome> {
        let Self {
            output,
            encoding,
            session,
            ..
        } = self;
        let mut renderer = Renderer::new(output.as_mut(), *encoding);

        let outcome = tokio::select! {
            outcome = session.submit(input, &mut renderer) => outcome?,
            _ = tokio::signal::ctrl_c() => {
                debug!("Turn cancelled by user in state {:?}", session.state());
                session.abandon_turn();
                renderer.end_message()?;
                TurnOutcome::Cancelled
            }
        };

        match &outcome {
            TurnOutcome::Completed {
                encoding_fallback: true,
                ..
            } => renderer.warning(ENCODING_TEXT)?,
            TurnOutcome::Completed { .. } => {}
            TurnOutcome::Failed(TurnError::RateLimited(_)) => renderer.warning(RATE_LIMITED_TEXT)?,
            TurnOutcome::Failed(TurnError::Provider(detail)) => {
                renderer.error(&format!("An error occurred: {}", detail))?
            }
            TurnOutcome::Failed(TurnError::Encoding { .. }) => renderer.warning(ENCODING_TEXT)?,
            TurnOutcome::Cancelled => renderer.warning(CANCELLED_TEXT)?,
            TurnOutcome::CredentialMissing => renderer.info(KEY_MISSING_TEXT)?,
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::conversation_state::Message;
    use super::testing::{Scripted, ScriptedBackend, SharedBuffer};
    use crate::completion::Credential;

    fn context(
        script: Vec<Scripted>,
        credential: Option<Credential>,
        input: Option<&str>,
    ) -> (ChatContext<ScriptedBackend>, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let session = Session::new(ScriptedBackend::new(script), credential, 0);
        let context = ChatContext::new(
            Box::new(buffer.clone()),
            input.map(str::to_string),
            false,
            session,
        )
        .with_encoding(DisplayEncoding::Utf8);
        (context, buffer)
    }

    #[tokio::test]
    async fn one_shot_input_streams_reply() {
        let (mut context, buffer) = context(
            vec![Scripted::chunks(&["Pong", "!"])],
            Credential::new("sk-test"),
            Some("ping"),
        );

        let code = context.run().await.unwrap();

        assert_eq!(code, ExitCode::SUCCESS);
        assert!(buffer.contents().contains("Pong!"));
        assert_eq!(
            context.session.conversation().all(),
            &[Message::user("ping"), Message::assistant("Pong!")]
        );
    }

    #[tokio::test]
    async fn one_shot_without_key_makes_no_request() {
        let (mut context, buffer) = context(vec![Scripted::chunks(&["x"])], None, Some("ping"));

        let code = context.run().await.unwrap();

        assert_eq!(code, ExitCode::FAILURE);
        assert!(buffer.contents().contains("Please add your OpenAI API key"));
        assert_eq!(context.session.backend().requests(), 0);
    }

    #[tokio::test]
    async fn failures_become_inline_notices() {
        let (mut context, buffer) = context(
            vec![
                Scripted::Reject(TurnError::RateLimited("429".to_string())),
                Scripted::Reject(TurnError::Provider("401 Unauthorized: bad key".to_string())),
            ],
            Credential::new("sk-test"),
            None,
        );

        context.handle_input("hello").await.unwrap();
        context.handle_input("hello again").await.unwrap();

        let printed = buffer.contents();
        assert!(printed.contains(RATE_LIMITED_TEXT));
        assert!(printed.contains("An error occurred: 401 Unauthorized: bad key"));
        assert_eq!(context.session.conversation().len(), 2);
    }

    #[tokio::test]
    async fn encoding_fallback_is_reported() {
        let (context, buffer) = context(
            vec![Scripted::chunks(&["\u{4f60}\u{597d}"])],
            Credential::new("sk-test"),
            None,
        );
        let mut context = context.with_encoding(DisplayEncoding::Ascii);

        context.handle_input("say hi").await.unwrap();

        let printed = buffer.contents();
        assert!(printed.contains("??"));
        assert!(printed.contains(ENCODING_TEXT));
        assert_eq!(context.session.conversation().all()[1].content(), "\u{4f60}\u{597d}");
    }

    #[tokio::test]
    async fn slash_commands() {
        let (mut context, buffer) = context(
            vec![Scripted::chunks(&["hi there"])],
            Credential::new("sk-test"),
            None,
        );

        context.handle_input("hello").await.unwrap();
        context.handle_input("/history").await.unwrap();
        assert!(buffer.contents().contains("hi there"));

        context.handle_input("/clear").await.unwrap();
        assert!(context.session.conversation().is_empty());
        assert!(buffer.contents().contains("Conversation cleared."));

        context.handle_input("/history").await.unwrap();
        assert!(buffer.contents().contains("The conversation is empty."));

        context.handle_input("/help").await.unwrap();
        assert!(buffer.contents().contains("/clear"));
        assert_eq!(context.session.backend().requests(), 1);
    }
}
