// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Kernel command line option handling

/// Options used for linux entries when none are given
pub const DEFAULT_OPTIONS: &str = "quiet splash";

fn is_quote(c: char) -> bool {
    c == '"' || c == '\''
}

/// Split a command line into options
///
/// Whitespace separates options, except within quotes: `a="b c"` is a single
/// option even though it spans two whitespace-separated tokens. A quote left
/// open runs to the end of the input.
pub fn parse(input: &str) -> Vec<String> {
    let mut options = vec![];
    let mut buffer = String::new();
    let mut open: Option<char> = None;

    for token in input.split_whitespace() {
        if !buffer.is_empty() {
            buffer.push(' ');
        }
        buffer.push_str(token);

        for c in token.chars() {
            open = match open {
                None if is_quote(c) => Some(c),
                Some(q) if c == q => None,
                state => state,
            };
        }

        if open.is_none() {
            options.push(std::mem::take(&mut buffer));
        }
    }

    if !buffer.is_empty() {
        options.push(buffer);
    }

    options
}

/// Join options back into a command line
pub fn join(options: &[String]) -> String {
    options.join(" ")
}

/// Append each option of `extra` not already present
pub fn add(current: &mut Vec<String>, extra: &str) {
    for option in parse(extra) {
        if !current.contains(&option) {
            current.push(option);
        }
    }
}

/// Drop every option listed in `unwanted`
pub fn remove(current: &mut Vec<String>, unwanted: &str) {
    let unwanted = parse(unwanted);
    current.retain(|option| !unwanted.contains(option));
}
