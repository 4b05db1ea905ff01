// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Renders the session change set as a colored summary plus unified diffs.

use console::style;
use sandbox::{ChangeKind, ChangedFile};
use similar::TextDiff;

pub fn display_changes(changes: &[ChangedFile]) {
    if changes.is_empty() {
        println!("{}", style("No files were changed during this session.").dim());
        return;
    }

    println!();
    println!("{}", style("Changes summary").bold());

    let count = |kind: ChangeKind| changes.iter().filter(|c| c.kind == kind).count();
    let added = count(ChangeKind::Added);
    let modified = count(ChangeKind::Modified);
    let deleted = count(ChangeKind::Deleted);
    if added > 0 {
        println!("{}", style(format!("  {added} file(s) added")).green());
    }
    if modified > 0 {
        println!("{}", style(format!("  {modified} file(s) modified")).yellow());
    }
    if deleted > 0 {
        println!("{}", style(format!("  {deleted} file(s) deleted")).red());
    }
    println!();

    for change in changes {
        display_file_diff(change);
    }
}

fn display_file_diff(change: &ChangedFile) {
    let path = change.path.display();
    let header = match change.kind {
        ChangeKind::Added => style(format!("+ {path}")).green().bold(),
        ChangeKind::Modified => style(format!("~ {path}")).yellow().bold(),
        ChangeKind::Deleted => style(format!("- {path}")).red().bold(),
    };
    println!("{header}");

    match generate_diff(change) {
        Some(diff) => print_colored_diff(&diff),
        None => {
            let note = match change.kind {
                ChangeKind::Deleted => "  (file deleted)",
                ChangeKind::Added => "  (new file)",
                ChangeKind::Modified => "  (binary or unreadable file)",
            };
            println!("{}", style(note).dim());
        }
    }
    println!();
}

/// Builds the unified diff body for one change, or None for binary and
/// unreadable content.
fn generate_diff(change: &ChangedFile) -> Option<String> {
    let old = match change.kind {
        ChangeKind::Modified | ChangeKind::Deleted => read_text(&change.lower_path)?,
        ChangeKind::Added => String::new(),
    };
    let new = match change.kind {
        ChangeKind::Modified | ChangeKind::Added => read_text(&change.upper_path)?,
        ChangeKind::Deleted => String::new(),
    };
    if old == new {
        return Some(String::new());
    }

    let text_diff = TextDiff::from_lines(old.as_str(), new.as_str());
    let path = change.path.display();
    Some(
        text_diff
            .unified_diff()
            .context_radius(3)
            .header(&format!("a/{path}"), &format!("b/{path}"))
            .to_string(),
    )
}

fn read_text(path: &std::path::Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    String::from_utf8(bytes).ok()
}

fn print_colored_diff(diff: &str) {
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            println!("{}", style(line).bold());
        } else if line.starts_with("@@") {
            println!("{}", style(line).cyan());
        } else if line.starts_with('+') {
            println!("{}", style(line).green());
        } else if line.starts_with('-') {
            println!("{}", style(line).red());
        } else {
            println!("{}", style(line).dim());
        }
    }
}
