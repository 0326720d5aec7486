// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Sink for install-time script statements.

use std::fmt;

/// Install-time failure categories. The numeric offset is added to the
/// partition's error code base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    Verification = 0,
    Update = 1,
    UnexpectedContents = 2,
    NonzeroContents = 3,
    Recover = 4,
}

/// Error code embedded in `abort()` messages. The system partition uses the
/// 1000 series and every other partition uses the 2000 series.
pub fn error_code(partition: &str, failure: Failure) -> u32 {
    let base = if partition == "system" { 1000 } else { 2000 };
    base + failure as u32
}

/// Consumer of script statements. Planners only ever append to a script.
pub trait ScriptSink {
    /// Add a comment block.
    fn comment(&mut self, comment: &str);

    /// Show a message on screen during installation.
    fn print(&mut self, message: &str);

    /// Advance the progress bar by `fraction` over `duration` seconds. A
    /// duration of 0 means progress is driven by the update itself.
    fn show_progress(&mut self, fraction: f64, duration: u32);

    /// Append raw statements verbatim.
    fn append_extra(&mut self, extra: &str);
}

/// An edify script built up line by line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EdifyScript {
    lines: Vec<String>,
}

impl EdifyScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for EdifyScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }

        Ok(())
    }
}

impl ScriptSink for EdifyScript {
    fn comment(&mut self, comment: &str) {
        self.lines.push(String::new());
        for line in comment.split('\n') {
            self.lines.push(format!("# {line}"));
        }
        self.lines.push(String::new());
    }

    fn print(&mut self, message: &str) {
        self.lines.push(format!("ui_print(\"{message}\");"));
    }

    fn show_progress(&mut self, fraction: f64, duration: u32) {
        self.lines
            .push(format!("show_progress({fraction:.6}, {duration});"));
    }

    fn append_extra(&mut self, extra: &str) {
        self.lines.push(extra.to_owned());
    }
}
