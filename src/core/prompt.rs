//! Interactive prompts: yes/no confirmations and hidden passphrase entry.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::core::passphrase::Passphrase;

pub trait Prompter: Send + Sync {
    /// Ask a yes/no question; anything but an explicit yes is a no.
    fn confirm(&self, question: &str) -> io::Result<bool>;

    /// Read a passphrase without echoing it.
    fn read_passphrase(&self, prompt: &str) -> io::Result<Passphrase>;
}

/// Prompter backed by the controlling terminal.
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn confirm(&self, question: &str) -> io::Result<bool> {
        print!("{question} [y/N]: ");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        let answer = answer.trim().to_ascii_lowercase();
        Ok(answer == "y" || answer == "yes")
    }

    fn read_passphrase(&self, prompt: &str) -> io::Result<Passphrase> {
        rpassword::prompt_password(prompt).map(Passphrase::new)
    }
}

/// Obtain an encryption passphrase with double entry. Mismatched or empty
/// entries are not fatal; the prompt loops until both entries agree.
pub fn encryption_passphrase(prompter: &dyn Prompter) -> io::Result<Passphrase> {
    loop {
        let first = prompter.read_passphrase("Encryption passphrase: ")?;
        let second = prompter.read_passphrase("Confirm passphrase: ")?;
        if first.is_empty() {
            println!("Passphrase must not be empty. Please try again.");
            continue;
        }
        if first != second {
            println!("Passphrases do not match. Please try again.");
            continue;
        }
        return Ok(first);
    }
}

/// Obtain a decryption passphrase with a single entry.
pub fn decryption_passphrase(prompter: &dyn Prompter) -> io::Result<Passphrase> {
    prompter.read_passphrase("Decryption passphrase: ")
}

/// Shared create-if-confirmed policy for destination directories on the
/// volume: an existing directory passes, a missing one is only created
/// after the user confirms. Returns false when creation was declined.
pub fn ensure_directory(
    prompter: &dyn Prompter,
    dir: &Path,
    description: &str,
) -> io::Result<bool> {
    if dir.is_dir() {
        return Ok(true);
    }
    let question = format!("{description} {} does not exist. Create it?", dir.display());
    if !prompter.confirm(&question)? {
        return Ok(false);
    }
    std::fs::create_dir_all(dir)?;
    Ok(true)
}

/// Scripted prompter for tests: canned answers, recorded questions.
#[derive(Default)]
pub struct ScriptedPrompter {
    confirms: Mutex<VecDeque<bool>>,
    passphrases: Mutex<VecDeque<String>>,
    questions: Mutex<Vec<String>>,
    passphrase_prompts: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_confirm(&self, yes: bool) {
        self.confirms.lock().unwrap().push_back(yes);
    }

    pub fn push_passphrase(&self, secret: &str) {
        self.passphrases
            .lock()
            .unwrap()
            .push_back(secret.to_string());
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().unwrap().clone()
    }

    /// How many passphrase prompts were issued.
    pub fn passphrase_prompts(&self) -> usize {
        self.passphrase_prompts.lock().unwrap().len()
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&self, question: &str) -> io::Result<bool> {
        self.questions.lock().unwrap().push(question.to_string());
        Ok(self.confirms.lock().unwrap().pop_front().unwrap_or(false))
    }

    fn read_passphrase(&self, prompt: &str) -> io::Result<Passphrase> {
        self.passphrase_prompts
            .lock()
            .unwrap()
            .push(prompt.to_string());
        self.passphrases
            .lock()
            .unwrap()
            .pop_front()
            .map(Passphrase::new)
            .ok_or_else(|| io::Error::other("no scripted passphrase left"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_entry_loops_until_entries_match() {
        let prompter = ScriptedPrompter::new();
        prompter.push_passphrase("first");
        prompter.push_passphrase("second");
        prompter.push_passphrase("agreed");
        prompter.push_passphrase("agreed");

        let secret = encryption_passphrase(&prompter).unwrap();
        assert_eq!(secret, Passphrase::new("agreed".to_string()));
        assert_eq!(prompter.passphrase_prompts(), 4);
    }

    #[test]
    fn double_entry_rejects_empty_passphrase() {
        let prompter = ScriptedPrompter::new();
        prompter.push_passphrase("");
        prompter.push_passphrase("");
        prompter.push_passphrase("real");
        prompter.push_passphrase("real");

        let secret = encryption_passphrase(&prompter).unwrap();
        assert_eq!(secret, Passphrase::new("real".to_string()));
    }

    #[test]
    fn ensure_directory_creates_after_confirmation() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("fresh");
        let prompter = ScriptedPrompter::new();
        prompter.push_confirm(true);

        assert!(ensure_directory(&prompter, &dir, "Backup directory").unwrap());
        assert!(dir.is_dir());
        assert_eq!(prompter.questions().len(), 1);
    }

    #[test]
    fn ensure_directory_declined_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("fresh");
        let prompter = ScriptedPrompter::new();
        prompter.push_confirm(false);

        assert!(!ensure_directory(&prompter, &dir, "Backup directory").unwrap());
        assert!(!dir.exists());
    }

    #[test]
    fn ensure_directory_skips_prompt_when_present() {
        let tmp = tempfile::tempdir().unwrap();
        let prompter = ScriptedPrompter::new();

        assert!(ensure_directory(&prompter, tmp.path(), "Backup directory").unwrap());
        assert!(prompter.questions().is_empty());
    }
}
