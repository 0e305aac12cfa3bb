//! Line commands read from stdin.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Stop,
    Restart,
    Status,
    /// Re-read the config file and apply it to the next start.
    Reload,
    /// Replace the user settings and push them to the server.
    Settings(Value),
    /// Mark the build tooling as installed or missing.
    Tooling(bool),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  start              start the analysis server
  stop               stop it
  restart            stop, then start
  status             current state and recent messages
  reload             re-read the config file
  settings <json>    send new settings
  tooling on|off     build tooling availability
  quit               stop and exit";

impl Command {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "restart" => Self::Restart,
            "status" => Self::Status,
            "reload" => Self::Reload,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            "settings" => {
                if rest.is_empty() {
                    return Err("usage: settings <json>".to_string());
                }
                let value: Value =
                    serde_json::from_str(rest).map_err(|e| format!("invalid settings: {e}"))?;
                Self::Settings(value)
            }
            "tooling" => match rest {
                "on" | "true" => Self::Tooling(true),
                "off" | "false" => Self::Tooling(false),
                _ => return Err("usage: tooling on|off".to_string()),
            },
            other => return Err(format!("unknown command: {other} (try `help`)")),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_line_is_nothing() {
        assert_eq!(Command::parse("   "), Ok(None));
    }

    #[test]
    fn simple_words() {
        assert_eq!(Command::parse("start"), Ok(Some(Command::Start)));
        assert_eq!(Command::parse(" Restart \n"), Ok(Some(Command::Restart)));
        assert_eq!(Command::parse("exit"), Ok(Some(Command::Quit)));
    }

    #[test]
    fn settings_takes_json() {
        assert_eq!(
            Command::parse(r#"settings {"grails": {"trace": true}}"#),
            Ok(Some(Command::Settings(
                serde_json::json!({"grails": {"trace": true}})
            )))
        );
        assert!(Command::parse("settings").is_err());
        assert!(Command::parse("settings {oops").is_err());
    }

    #[test]
    fn tooling_flag() {
        assert_eq!(Command::parse("tooling on"), Ok(Some(Command::Tooling(true))));
        assert_eq!(
            Command::parse("tooling off"),
            Ok(Some(Command::Tooling(false)))
        );
        assert!(Command::parse("tooling maybe").is_err());
    }

    #[test]
    fn unknown_command() {
        let err = Command::parse("deploy").unwrap_err();
        assert!(err.contains("deploy"));
    }
}
