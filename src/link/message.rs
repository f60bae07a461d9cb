//! Server-link wire grammar.
//!
//! One protocol line is `[:prefix SP] command [SP params] [SP :trailing]`.
//! The prefix names the server a relayed line originated from; the final
//! parameter may be marked with `:` to carry spaces. Lines arrive with
//! their CR-LF/LF terminator already stripped by the framing layer.
use std::fmt;

/// A parsed protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Originating server, when the line was relayed on our behalf.
    pub prefix: Option<String>,
    /// Protocol verb (`CAPAB`, `SERVER`, `SQUIT`, ...).
    pub command: String,
    /// Parameters; only the last one may contain spaces.
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("prefix with no command")]
    MissingCommand,
}

impl Message {
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    pub fn with_prefix(prefix: impl Into<String>, command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            command: command.into(),
            params,
        }
    }

    /// Parse one line (terminator already stripped).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = match line.strip_prefix(':') {
            Some(tail) => {
                let (pfx, rest) = tail.split_once(' ').ok_or(ParseError::MissingCommand)?;
                (Some(pfx.to_owned()), rest.trim_start_matches(' '))
            }
            None => (None, line),
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((cmd, tail)) => (cmd, tail),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    params.push(param.to_owned());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_owned());
                    break;
                }
            }
        }

        Ok(Self {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Serialize to wire form (no terminator). The last parameter gets a
    /// `:` marker when it is empty, contains a space, or starts with `:`.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(pfx) = &self.prefix {
            out.push(':');
            out.push_str(pfx);
            out.push(' ');
        }
        out.push_str(&self.command);

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            out.push(' ');
            if last.is_empty() || last.contains(' ') || last.starts_with(':') {
                out.push(':');
            }
            out.push_str(last);
        }
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}
