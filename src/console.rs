//! User-facing console capability
//!
//! All interactive output and input (password and PIN prompts, progress
//! notes, warnings shown after a successful run) goes through [`Console`], so
//! the build job never touches process-wide stdio directly.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use secrecy::SecretString;

/// Interactive console used by the build job.
pub trait Console {
    /// Print one line for the user.
    fn say(&self, line: &str);

    /// Prompt for a secret (password or PIN).
    ///
    /// An error means the user can no longer answer (closed input); callers
    /// treat it as an abort.
    fn read_secret(&self, prompt: &str) -> io::Result<SecretString>;
}

/// Console backed by the controlling terminal.
///
/// Secrets are read from the terminal with echo turned off. Without a
/// terminal the read fails, which aborts the run.
#[derive(Debug, Default)]
pub struct TerminalConsole;

impl TerminalConsole {
    pub fn new() -> Self {
        Self
    }
}

impl Console for TerminalConsole {
    fn say(&self, line: &str) {
        println!("{}", line);
    }

    fn read_secret(&self, prompt: &str) -> io::Result<SecretString> {
        rpassword::prompt_password(prompt).map(SecretString::from)
    }
}

/// Console that replays canned answers and records everything said.
///
/// Used by tests and by callers that drive the job non-interactively.
#[derive(Debug, Default)]
pub struct ScriptedConsole {
    answers: Mutex<VecDeque<String>>,
    transcript: Mutex<Vec<String>>,
}

impl ScriptedConsole {
    /// Create a console answering prompts with `answers`, in order.
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            transcript: Mutex::new(Vec::new()),
        }
    }

    /// Everything printed or prompted so far.
    pub fn transcript(&self) -> Vec<String> {
        self.transcript.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Number of answers not yet consumed.
    pub fn remaining_answers(&self) -> usize {
        self.answers.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn record(&self, line: &str) {
        if let Ok(mut transcript) = self.transcript.lock() {
            transcript.push(line.to_string());
        }
    }
}

impl Console for ScriptedConsole {
    fn say(&self, line: &str) {
        self.record(line);
    }

    fn read_secret(&self, prompt: &str) -> io::Result<SecretString> {
        self.record(prompt);
        let answer = self
            .answers
            .lock()
            .ok()
            .and_then(|mut answers| answers.pop_front());
        answer.map(SecretString::from).ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "scripted console has no more answers")
        })
    }
}
