//! Commands accepted on standard input by a MAIN process

/// One parsed input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractiveCommand {
    /// `exit` / `e`
    Exit,
    /// `modify` / `m`, optionally with the new value on the same line
    Modify(Option<i64>),
    /// `show` / `s`
    Show,
    /// `status`: full snapshot of the shared state
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    UnknownCommand(String),
    InvalidValue(String),
}

impl InteractiveCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut words = line.split_whitespace();
        let Some(word) = words.next() else {
            return Err(ParseError::Empty);
        };
        match word {
            "exit" | "e" => Ok(InteractiveCommand::Exit),
            "show" | "s" => Ok(InteractiveCommand::Show),
            "status" => Ok(InteractiveCommand::Status),
            "modify" | "m" => match words.next() {
                None => Ok(InteractiveCommand::Modify(None)),
                Some(raw) => parse_value(raw).map(|v| InteractiveCommand::Modify(Some(v))),
            },
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }
}

/// Parses a counter value entered after a `modify` prompt.
pub fn parse_value(raw: &str) -> Result<i64, ParseError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ParseError::InvalidValue(raw.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_and_short_forms() {
        assert_eq!(InteractiveCommand::parse("exit"), Ok(InteractiveCommand::Exit));
        assert_eq!(InteractiveCommand::parse(" e "), Ok(InteractiveCommand::Exit));
        assert_eq!(InteractiveCommand::parse("show"), Ok(InteractiveCommand::Show));
        assert_eq!(InteractiveCommand::parse("s"), Ok(InteractiveCommand::Show));
        assert_eq!(InteractiveCommand::parse("m"), Ok(InteractiveCommand::Modify(None)));
        assert_eq!(InteractiveCommand::parse("status"), Ok(InteractiveCommand::Status));
    }

    #[test]
    fn modify_accepts_inline_value() {
        assert_eq!(
            InteractiveCommand::parse("modify -12"),
            Ok(InteractiveCommand::Modify(Some(-12)))
        );
        assert_eq!(
            InteractiveCommand::parse("m twelve"),
            Err(ParseError::InvalidValue("twelve".to_string()))
        );
    }

    #[test]
    fn unknown_and_blank_lines() {
        assert_eq!(InteractiveCommand::parse("   "), Err(ParseError::Empty));
        assert_eq!(
            InteractiveCommand::parse("reboot"),
            Err(ParseError::UnknownCommand("reboot".to_string()))
        );
    }
}
