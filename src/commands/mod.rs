/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `chat`: Interactive chat with streamed replies
- `bench`: Load a model, benchmark it and print the table

Reserved in-chat commands live in `special_commands` and run through
`dispatcher`.
*/

use crate::app::ChatApp;
use crate::config::Config;
use crate::engine::create_engine;
use crate::error::{LlamaChatError, Result};
use std::path::PathBuf;

// Reserved in-chat command table
pub mod special_commands;

// Execution of reserved commands
pub mod dispatcher;

// Chat command handler
pub mod chat {
    //! Interactive chat handler.
    //!
    //! Runs a readline loop on a dedicated thread and streams replies to the
    //! terminal as tokens arrive. Input stays open while a reply streams, so
    //! commands such as `/stop` can be typed mid-reply. Ctrl-C stops a
    //! streaming reply, Ctrl-D leaves the chat. An empty line with no model
    //! loaded asks for a model path.

    use super::*;
    use crate::message::{Author, Message};
    use crate::picker::{LineInput, PromptPicker};
    use async_trait::async_trait;
    use colored::Colorize;
    use rustyline::error::ReadlineError;
    use rustyline::DefaultEditor;
    use std::io::Write;
    use tokio::sync::mpsc;

    /// One answer from the terminal
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Line {
        /// A line of text
        Text(String),
        /// Ctrl-C at the prompt
        Interrupted,
        /// Ctrl-D or closed input
        Eof,
    }

    /// Terminal input split into asking and answering
    ///
    /// Asking shows a prompt without waiting, so the chat loop can keep
    /// applying completion events while a line is being typed.
    #[async_trait]
    pub trait ChatInput: Send {
        /// Show `prompt` and start reading a line
        ///
        /// Does nothing while an earlier read is still unanswered.
        fn ask(&mut self, prompt: &str);

        /// Wait for the line asked for
        ///
        /// Cancel safe: dropping the future keeps the read pending.
        async fn answer(&mut self) -> Result<Line>;
    }

    /// Readline running on its own thread
    ///
    /// Each read sends the prompt to the thread and the answer comes back
    /// on a channel, so the async loop never blocks on the terminal.
    pub struct TerminalInput {
        requests: std::sync::mpsc::Sender<String>,
        lines: mpsc::UnboundedReceiver<std::result::Result<Line, String>>,
        pending: bool,
        closed: bool,
    }

    impl TerminalInput {
        /// Start the readline thread
        pub fn spawn() -> Self {
            let (requests, prompts) = std::sync::mpsc::channel::<String>();
            let (tx, lines) = mpsc::unbounded_channel();

            std::thread::spawn(move || {
                let mut rl = match DefaultEditor::new() {
                    Ok(rl) => rl,
                    Err(e) => {
                        let _ = tx.send(Err(e.to_string()));
                        return;
                    }
                };
                while let Ok(prompt) = prompts.recv() {
                    let line = match rl.readline(&prompt) {
                        Ok(text) => {
                            if !text.trim().is_empty() {
                                let _ = rl.add_history_entry(text.as_str());
                            }
                            Ok(Line::Text(text))
                        }
                        Err(ReadlineError::Interrupted) => Ok(Line::Interrupted),
                        Err(ReadlineError::Eof) => Ok(Line::Eof),
                        Err(err) => Err(err.to_string()),
                    };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });

            Self {
                requests,
                lines,
                pending: false,
                closed: false,
            }
        }

        /// Show `prompt` and wait for the answer
        ///
        /// # Errors
        ///
        /// Returns an I/O error when readline fails.
        pub async fn read(&mut self, prompt: &str) -> Result<Line> {
            self.ask(prompt);
            self.answer().await
        }
    }

    #[async_trait]
    impl ChatInput for TerminalInput {
        fn ask(&mut self, prompt: &str) {
            if self.pending || self.closed {
                return;
            }
            if self.requests.send(prompt.to_string()).is_err() {
                self.closed = true;
                return;
            }
            self.pending = true;
        }

        async fn answer(&mut self) -> Result<Line> {
            if !self.pending {
                return Ok(Line::Eof);
            }
            let answer = self.lines.recv().await;
            self.pending = false;
            match answer {
                Some(Ok(line)) => Ok(line),
                Some(Err(e)) => {
                    tracing::error!("Readline error: {}", e);
                    Err(LlamaChatError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e,
                    ))
                    .into())
                }
                None => {
                    self.closed = true;
                    Ok(Line::Eof)
                }
            }
        }
    }

    #[async_trait]
    impl LineInput for TerminalInput {
        async fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
            match self.read(prompt).await? {
                Line::Text(text) => Ok(Some(text)),
                Line::Interrupted | Line::Eof => Ok(None),
            }
        }
    }

    /// Prints store messages as they appear and grow
    ///
    /// User messages are not echoed; the terminal already shows them.
    #[derive(Debug, Default)]
    pub struct Transcript {
        cursor: usize,
        printed: usize,
        labelled: bool,
    }

    impl Transcript {
        /// Print everything new in `app`'s store
        pub fn render(&mut self, app: &ChatApp) {
            let controller = app.controller();
            let streaming = controller
                .active_request()
                .and_then(|request| controller.reply_id(request));
            let messages = app.store().messages();

            while let Some(message) = messages.get(self.cursor) {
                if streaming == Some(message.id()) {
                    self.print_growth(message);
                    return;
                }
                match message.author() {
                    Author::User => {}
                    Author::System if message.is_notice() => {
                        println!("{}", message.text().yellow());
                    }
                    Author::System => {
                        self.print_growth(message);
                        println!();
                        if let Some(timings) = &message.metadata().timings {
                            println!("{}", timings.dimmed());
                        }
                    }
                }
                self.cursor += 1;
                self.printed = 0;
                self.labelled = false;
            }
        }

        fn print_growth(&mut self, message: &Message) {
            let text = message.text();
            if !self.labelled {
                print!("{} ", "llama:".green().bold());
                self.labelled = true;
            }
            if let Some(new) = text.get(self.printed..) {
                print!("{}", new);
                self.printed = text.len();
            }
            let _ = std::io::stdout().flush();
        }
    }

    /// Start interactive chat
    ///
    /// # Arguments
    ///
    /// * `config` - Global configuration (consumed)
    /// * `model` - Model to load before the first prompt
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be created or the terminal fails
    pub async fn run_chat(config: Config, model: Option<PathBuf>) -> Result<()> {
        tracing::info!("Starting interactive chat");

        let engine = create_engine(&config)?;
        let mut app = ChatApp::new(engine, config);
        let mut input = TerminalInput::spawn();
        let mut transcript = Transcript::default();

        print_welcome_banner();

        if let Some(path) = model {
            app.load_model(&path).await;
            transcript.render(&app);
        }

        loop {
            let prompt = format!("{} ", "User:".cyan().bold());
            input.ask(&prompt);
            match input.answer().await? {
                Line::Text(text) => {
                    if text.trim().is_empty() {
                        if !app.sessions().is_loaded() {
                            let mut picker = PromptPicker::new(&mut input);
                            app.pick_and_load(&mut picker).await?;
                            transcript.render(&app);
                        }
                        continue;
                    }
                    app.send(&text).await;
                    transcript.render(&app);
                    if stream_until_idle(&mut app, &mut transcript, &mut input).await?
                        == Flow::Quit
                    {
                        break;
                    }
                }
                Line::Interrupted => {
                    println!("CTRL-C (use CTRL-D to quit)");
                }
                Line::Eof => {
                    println!("CTRL-D");
                    break;
                }
            }
        }

        app.shutdown().await;
        println!("Goodbye!");
        Ok(())
    }

    /// What the chat loop does after a reply settles
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Flow {
        Continue,
        Quit,
    }

    enum Wake {
        Event(Option<crate::completion::CompletionEvent>),
        Input(Result<Line>),
        Interrupt,
    }

    /// Apply completion events until no reply streams
    ///
    /// Input keeps being read with an empty prompt. Lines typed meanwhile go
    /// through [`ChatApp::send`], so `/stop` and `/release` work mid-reply and
    /// plain messages are appended without starting a second completion.
    /// Ctrl-C stops the reply; Ctrl-D stops it and quits.
    async fn stream_until_idle<I: ChatInput>(
        app: &mut ChatApp,
        transcript: &mut Transcript,
        input: &mut I,
    ) -> Result<Flow> {
        let mut flow = Flow::Continue;
        while app.is_inferencing() {
            input.ask("");
            let wake = tokio::select! {
                event = app.next_event() => Wake::Event(event),
                line = input.answer() => Wake::Input(line),
                _ = tokio::signal::ctrl_c() => Wake::Interrupt,
            };
            match wake {
                Wake::Event(Some(event)) => app.handle_event(event),
                Wake::Event(None) => break,
                Wake::Input(line) => match line? {
                    Line::Text(text) if !text.trim().is_empty() => {
                        app.send(&text).await;
                    }
                    Line::Text(_) => {}
                    Line::Interrupted => {
                        app.stop().await;
                    }
                    Line::Eof => {
                        app.stop().await;
                        flow = Flow::Quit;
                    }
                },
                Wake::Interrupt => {
                    app.stop().await;
                }
            }
            transcript.render(app);
        }
        app.drain_events();
        transcript.render(app);
        Ok(flow)
    }

    fn print_welcome_banner() {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                         llamachat                            ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");
        println!(
            "{}",
            "Press Enter on an empty line to pick a model, CTRL-C stops a reply, CTRL-D quits\n"
                .dimmed()
        );
    }

}

// One-shot benchmark handler
pub mod bench {
    //! Benchmark a model from the command line.

    use super::*;

    /// Load `model`, run the benchmark and print every notice
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be created or the model does not
    /// load
    pub async fn run_bench(config: Config, model: PathBuf) -> Result<()> {
        tracing::info!("Benchmarking {}", model.display());

        let engine = create_engine(&config)?;
        let mut app = ChatApp::new(engine, config);

        let loaded = app.load_model(&model).await;
        if loaded {
            app.send(special_commands::ChatCommand::Bench.as_str()).await;
        }
        for message in app.store().messages() {
            println!("{}", message.text());
        }
        app.shutdown().await;

        if loaded {
            Ok(())
        } else {
            Err(LlamaChatError::ContextInit(format!(
                "could not load {}",
                model.display()
            ))
            .into())
        }
    }
}
