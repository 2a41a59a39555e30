//! Operator console commands read from stdin while serving.

use thiserror::Error;

pub const HELP: &str = "\
Commands:
  state <mac> on|off       switch a board on or off
  flash <mac> <file-id>    flash one board
  flash-all <file-id>      flash every registered board
  add <mac>                register a board
  boards                   list registered boards
  locks                    list in-flight operations
  help                     show this help
  quit                     stop the server";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    State { mac_address: String, value: bool },
    Flash { mac_address: String, file_id: String },
    FlashAll { file_id: String },
    Add { mac_address: String },
    Boards,
    Locks,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("unknown command '{0}', type 'help'")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&name, args)) = words.split_first() else {
        return Ok(None);
    };

    let command = match (name, args) {
        ("state", [mac, value]) => ConsoleCommand::State {
            mac_address: mac.to_string(),
            value: parse_switch(value).ok_or(ConsoleError::Usage("state <mac> on|off"))?,
        },
        ("state", _) => return Err(ConsoleError::Usage("state <mac> on|off")),
        ("flash", [mac, file_id]) => ConsoleCommand::Flash {
            mac_address: mac.to_string(),
            file_id: file_id.to_string(),
        },
        ("flash", _) => return Err(ConsoleError::Usage("flash <mac> <file-id>")),
        ("flash-all", [file_id]) => ConsoleCommand::FlashAll {
            file_id: file_id.to_string(),
        },
        ("flash-all", _) => return Err(ConsoleError::Usage("flash-all <file-id>")),
        ("add", [mac]) => ConsoleCommand::Add {
            mac_address: mac.to_string(),
        },
        ("add", _) => return Err(ConsoleError::Usage("add <mac>")),
        ("boards", []) => ConsoleCommand::Boards,
        ("locks", []) => ConsoleCommand::Locks,
        ("help" | "?", _) => ConsoleCommand::Help,
        ("quit" | "exit", _) => ConsoleCommand::Quit,
        (other, _) => return Err(ConsoleError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state() {
        assert_eq!(
            parse("state AA:BB:CC:DD:EE:01 off").unwrap(),
            Some(ConsoleCommand::State {
                mac_address: "AA:BB:CC:DD:EE:01".to_string(),
                value: false,
            })
        );
        assert_eq!(
            parse("  state b1   ON ").unwrap(),
            Some(ConsoleCommand::State {
                mac_address: "b1".to_string(),
                value: true,
            })
        );
        assert_eq!(
            parse("state b1 maybe"),
            Err(ConsoleError::Usage("state <mac> on|off"))
        );
        assert!(parse("state b1").is_err());
    }

    #[test]
    fn test_parse_flash() {
        assert_eq!(
            parse("flash b1 f-1").unwrap(),
            Some(ConsoleCommand::Flash {
                mac_address: "b1".to_string(),
                file_id: "f-1".to_string(),
            })
        );
        assert_eq!(
            parse("flash-all f-1").unwrap(),
            Some(ConsoleCommand::FlashAll {
                file_id: "f-1".to_string()
            })
        );
        assert!(parse("flash-all").is_err());
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   ").unwrap(), None);
        assert_eq!(parse("locks").unwrap(), Some(ConsoleCommand::Locks));
        assert_eq!(parse("boards").unwrap(), Some(ConsoleCommand::Boards));
        assert_eq!(parse("exit").unwrap(), Some(ConsoleCommand::Quit));
        assert_eq!(
            parse("reboot b1"),
            Err(ConsoleError::Unknown("reboot".to_string()))
        );
    }
}
