// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use plan::{PLAN_FN_NAME, PLAN_VERSION};
use serde_json::{json, Value};

pub(crate) const SYSTEM_PROMPT: &str = "\
You translate natural-language requests into a single shell command plan \
for a Linux machine. Always answer by calling the plan function; never \
answer in prose. The command field is an argv vector executed under bash \
inside a sandbox whose changes the user reviews afterwards. Prefer plain, \
widely available tools. When a request is destructive, ambiguous, or \
under-specified, set needs_clarification to true and put a short question \
in the question field instead of guessing.";

/// Few-shot turns teaching the model the plan calling convention: one plain
/// translation and one clarification round-trip for a destructive request.
pub(crate) fn few_shots() -> Vec<Value> {
    let search_args = serde_json::to_string(&json!({
        "version": PLAN_VERSION,
        "intent": "file_search",
        "command": ["find", ".", "-type", "f", "-name", "*.py", "-mtime", "-7", "-size", "+10M", "-print"],
        "cwd": ".",
        "inputs": [],
        "outputs": [],
        "explain": "Find *.py changed in 7 days and larger than 10MB.",
        "needs_clarification": false,
        "question": ""
    }))
    .unwrap();

    let delete_args = serde_json::to_string(&json!({
        "version": PLAN_VERSION,
        "intent": "file_delete",
        "command": [],
        "cwd": ".",
        "inputs": [],
        "outputs": [],
        "explain": "Deletion is destructive; request scope/confirmation first.",
        "needs_clarification": true,
        "question": "Which directory and size threshold? Preview first?"
    }))
    .unwrap();

    vec![
        json!({
            "role": "user",
            "content": "list python files larger than 10 MB modified this week",
        }),
        json!({
            "role": "assistant",
            "tool_calls": [{
                "id": "tool_1",
                "type": "function",
                "function": { "name": PLAN_FN_NAME, "arguments": search_args },
            }],
        }),
        json!({
            "role": "tool",
            "tool_call_id": "tool_1",
            "content": "Plan executed successfully",
        }),
        json!({
            "role": "user",
            "content": "delete the big logs",
        }),
        json!({
            "role": "assistant",
            "tool_calls": [{
                "id": "tool_2",
                "type": "function",
                "function": { "name": PLAN_FN_NAME, "arguments": delete_args },
            }],
        }),
        json!({
            "role": "tool",
            "tool_call_id": "tool_2",
            "content": "Plan executed successfully",
        }),
    ]
}
