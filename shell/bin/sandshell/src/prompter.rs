// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::{ErrorKind, Write};

use anyhow::Result;
use console::style;
use sandbox::OverlaySandbox;
use translator::Translator;

const EXIT_SEQUENCE: &str = "/exit";

/// What one line of user input asks for.
#[derive(Debug, PartialEq, Eq)]
enum Request {
    Empty,
    Exit,
    /// A `/`-prefixed natural-language request, prefix stripped.
    NaturalLanguage(String),
    /// A literal command, whitespace-split into argv.
    Command(Vec<String>),
}

fn parse_request(line: &str) -> Request {
    let line = line.trim();
    if line.is_empty() {
        return Request::Empty;
    }
    if line == EXIT_SEQUENCE {
        return Request::Exit;
    }
    if let Some(nl) = line.strip_prefix('/') {
        return Request::NaturalLanguage(nl.trim().to_string());
    }
    Request::Command(line.split_whitespace().map(str::to_string).collect())
}

/// The interactive loop: reads lines, routes literal commands into the
/// sandbox and `/`-prefixed requests through the translator, and echoes
/// captured output.
pub struct Prompter<'a> {
    sandbox: &'a mut OverlaySandbox,
    translator: Option<Translator>,
}

impl<'a> Prompter<'a> {
    pub fn new(sandbox: &'a mut OverlaySandbox, translator: Option<Translator>) -> Self {
        Self {
            sandbox,
            translator,
        }
    }

    /// Runs until `/exit` or end of input. Errors from individual commands
    /// are printed and the loop continues; only losing the terminal ends
    /// the session.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let prompt = format!("sandshell:{}", self.sandbox.current_dir().display());
            let line: String = match dialoguer::Input::new()
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text()
            {
                Ok(line) => line,
                Err(dialoguer::Error::IO(e)) if e.kind() == ErrorKind::Interrupted => {
                    println!("Use '{EXIT_SEQUENCE}' to end the session.");
                    continue;
                }
                // Losing stdin (EOF, closed terminal) ends the session the
                // same way /exit does: changes are still reviewed.
                Err(_) => break,
            };

            match parse_request(&line) {
                Request::Empty => continue,
                Request::Exit => break,
                Request::Command(argv) => self.run_command(&argv),
                Request::NaturalLanguage(request) => self.handle_ai_request(&request),
            }
        }
        Ok(())
    }

    fn run_command(&mut self, argv: &[String]) {
        match self.sandbox.run(argv) {
            Ok(output) => {
                let _ = std::io::stdout().write_all(&output.stdout);
                let _ = std::io::stderr().write_all(&output.stderr);
            }
            Err(e) => eprintln!("{} {e}", style("Error:").red()),
        }
    }

    fn handle_ai_request(&mut self, request: &str) {
        let Some(translator) = self.translator.as_ref() else {
            eprintln!("Natural-language mode is off (set OPENAI_API_KEY to enable it).");
            return;
        };

        let plan = match translator.to_plan(request) {
            Ok(plan) => plan,
            Err(e) => {
                let note = format!("AI translation error: {e:#}");
                eprintln!("{note}");
                self.add_context(note);
                return;
            }
        };

        println!("\nExplanation: {}", plan.explain);

        if plan.needs_clarification {
            println!("\nClarification needed: {}", plan.question);
            self.add_context(format!("Clarification needed: {}", plan.question));
            return;
        }

        println!("Executing: {}", plan.command.join(" "));
        match self.sandbox.run(&plan.command) {
            Ok(output) => {
                let _ = std::io::stdout().write_all(&output.stdout);
                let _ = std::io::stderr().write_all(&output.stderr);
                self.add_context(format!(
                    "Command executed: {} (exit code: {})",
                    plan.command.join(" "),
                    output.returncode
                ));
            }
            Err(e) => {
                let note = format!("Command failed to start: {e}");
                eprintln!("{note}");
                self.add_context(note);
            }
        }
    }

    fn add_context(&mut self, note: String) {
        if let Some(translator) = self.translator.as_mut() {
            translator.add_execution_context(note);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_input_lines() {
        assert_eq!(parse_request(""), Request::Empty);
        assert_eq!(parse_request("   "), Request::Empty);
        assert_eq!(parse_request("/exit"), Request::Exit);
        assert_eq!(
            parse_request("/find big logs"),
            Request::NaturalLanguage("find big logs".to_string())
        );
        assert_eq!(
            parse_request("ls -la /tmp"),
            Request::Command(vec!["ls".into(), "-la".into(), "/tmp".into()])
        );
        // Leading whitespace does not turn a command into a request.
        assert_eq!(
            parse_request("  echo hi"),
            Request::Command(vec!["echo".into(), "hi".into()])
        );
    }
}
