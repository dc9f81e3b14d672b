//! User interaction.
//!
//! The driver asks the user to confirm recoverable decisions (create a missing
//! directory, abort a run, discard data on exit) and reports errors through
//! [`UserInterface`]. [`HeadlessUi`] answers prompts from a preset and records
//! everything, for tests and the command-line runner.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use tracing::{error, info};

/// Prompts, error reports and UI-thread detection.
pub trait UserInterface: Send + Sync {
    /// Whether the calling thread is the UI thread.
    fn is_ui_thread(&self) -> bool;

    /// Ask a yes/no question.
    fn confirm(&self, title: &str, message: &str) -> bool;

    /// Report an error.
    fn show_error(&self, message: &str);

    /// Show an informational message.
    fn show_message(&self, message: &str);
}

/// Non-interactive user interface.
#[derive(Debug)]
pub struct HeadlessUi {
    answer: AtomicBool,
    ui_thread: Mutex<Option<ThreadId>>,
    prompts: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
}

impl HeadlessUi {
    /// Headless UI answering every prompt with `answer`.
    pub fn new(answer: bool) -> Self {
        Self {
            answer: AtomicBool::new(answer),
            ui_thread: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Change the answer given to prompts.
    pub fn set_answer(&self, answer: bool) {
        self.answer.store(answer, Ordering::SeqCst);
    }

    /// Treat the calling thread as the UI thread.
    pub fn mark_current_thread_as_ui(&self) {
        *self.ui_thread.lock() = Some(thread::current().id());
    }

    /// Titles of the prompts shown so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Errors reported so far.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    /// Messages shown so far.
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl Default for HeadlessUi {
    fn default() -> Self {
        Self::new(true)
    }
}

impl UserInterface for HeadlessUi {
    fn is_ui_thread(&self) -> bool {
        *self.ui_thread.lock() == Some(thread::current().id())
    }

    fn confirm(&self, title: &str, message: &str) -> bool {
        let answer = self.answer.load(Ordering::SeqCst);
        info!(title, message, answer, "Prompt answered");
        self.prompts.lock().push(title.to_string());
        answer
    }

    fn show_error(&self, message: &str) {
        error!("{}", message);
        self.errors.lock().push(message.to_string());
    }

    fn show_message(&self, message: &str) {
        info!("{}", message);
        self.messages.lock().push(message.to_string());
    }
}
