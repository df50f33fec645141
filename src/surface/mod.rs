//! Command surface - Text commands in, titled replies out
//!
//! The dispatcher is transport-agnostic; the console is the shipped
//! transport and a chat transport would feed the same dispatcher.

mod access;
mod command;
mod console;
mod dispatch;

pub use console::{spawn_event_log, Console};
pub use dispatch::Dispatcher;

use std::fmt;

/// How a reply should be presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Success,
    Error,
    Info,
    Warning,
}

impl ReplyKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Success => "OK",
            Self::Error => "ERROR",
            Self::Info => "INFO",
            Self::Warning => "WARN",
        }
    }
}

/// One rendered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub title: String,
    pub body: String,
    pub fields: Vec<(String, String)>,
}

impl Reply {
    pub fn new(kind: ReplyKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            body: body.into(),
            fields: Vec::new(),
        }
    }

    pub fn success(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(ReplyKind::Success, title, body)
    }

    pub fn error(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(ReplyKind::Error, title, body)
    }

    pub fn info(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(ReplyKind::Info, title, body)
    }

    pub fn warning(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(ReplyKind::Warning, title, body)
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == ReplyKind::Error
    }

    /// Value of the first field called `name`
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.tag(), self.title)?;
        if !self.body.is_empty() {
            write!(f, "\n{}", self.body)?;
        }
        for (name, value) in &self.fields {
            if value.contains('\n') {
                write!(f, "\n  {}:", name)?;
                for line in value.lines() {
                    write!(f, "\n    {}", line)?;
                }
            } else {
                write!(f, "\n  {}: {}", name, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_render_title_body_and_fields() {
        let reply = Reply::success("VPS Started", "vps-1-1 is running")
            .with_field("Status", "RUNNING")
            .with_field("Output", "a\nb");
        assert_eq!(
            reply.to_string(),
            "[OK] VPS Started\nvps-1-1 is running\n  Status: RUNNING\n  Output:\n    a\n    b"
        );
        assert_eq!(reply.field("Status"), Some("RUNNING"));
        assert!(!reply.is_error());
    }
}
