// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use cliutil::cli_main;
use console::style;
use dialoguer::Confirm;
use sandbox::OverlaySandbox;
use translator::{Translator, TranslatorConfig};

mod diff_display;
mod prompter;

use prompter::Prompter;

const BANNER: &str = r#"
  ┌──────────────────────────────────────────────────────────────┐
  │                      sandshell                               │
  │                                                              │
  │   Commands run in a copy-on-write sandbox. Nothing touches   │
  │   the real filesystem until you keep the changes at exit.    │
  │                                                              │
  │     • type commands as in a normal shell                     │
  │     • start with '/' for a natural-language request          │
  │     • '/exit' ends the session                               │
  └──────────────────────────────────────────────────────────────┘
"#;

#[derive(Parser, Debug)]
#[command(name = "sandshell", about = "Run shell commands in a copy-on-write sandbox")]
struct Cli {
    /// Directory to open the session on.
    #[arg(default_value = ".")]
    dir: PathBuf,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    cli_main(|| run_session(args), Default::default())
}

fn run_session(args: Cli) -> Result<()> {
    // Keep the shell alive on Ctrl+C; the foreground child receives its
    // own SIGINT from the terminal and dies alone.
    ctrlc::set_handler(|| {}).context("Failed to install the interrupt handler")?;

    let mut sandbox = OverlaySandbox::open(&args.dir)
        .with_context(|| format!("Failed to open a sandbox on {}", args.dir.display()))?;

    let translator = TranslatorConfig::from_env().map(Translator::new);
    if translator.is_none() {
        eprintln!(
            "{}",
            style("Natural-language mode is off (set OPENAI_API_KEY to enable it).").dim()
        );
    }

    println!("{}", BANNER);
    Prompter::new(&mut sandbox, translator).run()?;

    let changes = sandbox.changed_files();
    diff_display::display_changes(&changes);

    let keep_changes = !changes.is_empty()
        && Confirm::new()
            .with_prompt("Keep changes?")
            .default(false)
            .interact()
            .unwrap_or(false);

    sandbox.close(keep_changes);
    if keep_changes {
        println!("Changes kept.");
    } else {
        println!("Changes discarded.");
    }

    Ok(())
}
