//! Command output sinks.
//!
//! Every controller operation receives a sink through which it reports
//! progress lines and status keywords while it runs. The command dispatcher
//! decides how those are rendered; controllers only choose the level.

use std::fmt;
use tokio::sync::mpsc;

/// Severity of a reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Diagnostic detail.
    Debug,
    /// Progress or status keyword.
    Inform,
    /// Something worth attention; the command goes on.
    Warn,
    /// Terminal success.
    Finish,
    /// Terminal failure.
    Fail,
}

impl Level {
    /// Single-character code used when rendering replies.
    pub fn code(&self) -> char {
        match self {
            Level::Debug => 'd',
            Level::Inform => 'i',
            Level::Warn => 'w',
            Level::Finish => ':',
            Level::Fail => 'f',
        }
    }

    /// Whether this level closes a command's reply.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Level::Finish | Level::Fail)
    }
}

/// A single reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// Severity
    pub level: Level,
    /// Keywords or quoted text
    pub text: String,
}

impl fmt::Display for ReplyLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.level.code(), self.text)
    }
}

/// Destination for leveled reply lines.
pub trait CommandSink: Send + Sync {
    /// Deliver one line.
    fn emit(&self, level: Level, text: &str);

    /// Emit at [`Level::Debug`].
    fn debug(&self, text: &str) {
        self.emit(Level::Debug, text);
    }

    /// Emit at [`Level::Inform`].
    fn inform(&self, text: &str) {
        self.emit(Level::Inform, text);
    }

    /// Emit at [`Level::Warn`].
    fn warn(&self, text: &str) {
        self.emit(Level::Warn, text);
    }

    /// Close the reply successfully.
    fn finish(&self, text: &str) {
        self.emit(Level::Finish, text);
    }

    /// Close the reply as failed.
    fn fail(&self, text: &str) {
        self.emit(Level::Fail, text);
    }

    /// Report a free-form device line as a quoted `text=` keyword.
    fn text(&self, line: &str) {
        self.inform(&text_keyword(line));
    }
}

/// Quote a free-form line as a `text="..."` keyword.
pub fn text_keyword(line: &str) -> String {
    format!("text=\"{}\"", line.replace('"', "'"))
}

/// Sink that forwards every line to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl CommandSink for TracingSink {
    fn emit(&self, level: Level, text: &str) {
        match level {
            Level::Debug => tracing::debug!("{text}"),
            Level::Inform | Level::Finish => tracing::info!("{text}"),
            Level::Warn => tracing::warn!("{text}"),
            Level::Fail => tracing::error!("{text}"),
        }
    }
}

/// Sink that pushes reply lines into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ReplyLine>,
}

impl ChannelSink {
    /// Sink plus the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReplyLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl CommandSink for ChannelSink {
    fn emit(&self, level: Level, text: &str) {
        // A closed receiver means nobody is listening for this command anymore.
        if self
            .tx
            .send(ReplyLine {
                level,
                text: text.to_string(),
            })
            .is_err()
        {
            tracing::trace!("reply dropped: {text}");
        }
    }
}

/// Drain everything currently queued on a [`ChannelSink`] receiver.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ReplyLine>) -> Vec<ReplyLine> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_preserves_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.inform("adc=1,2");
        sink.warn("careful");
        sink.finish("");

        let lines = drain(&mut rx);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].level, Level::Inform);
        assert_eq!(lines[1].text, "careful");
        assert!(lines[2].level.is_terminal());
    }

    #[test]
    fn test_text_keyword_escapes_quotes() {
        assert_eq!(text_keyword("say \"hi\""), "text=\"say 'hi'\"");
    }

    #[test]
    fn test_reply_line_rendering() {
        let line = ReplyLine {
            level: Level::Warn,
            text: "text=\"x\"".into(),
        };
        assert_eq!(line.to_string(), "w text=\"x\"");
    }
}
