//! REPL command parsing
//!
//! Plain lines are story entries. Lines starting with `/` are commands.
//! Tab numbers are 1-based on the command line.

use storyloom_core::{CommandType, ParseCommandTypeError};
use thiserror::Error;

/// Errors from parsing a REPL line
#[derive(Debug, Error, PartialEq)]
pub enum CommandParseError {
    /// Not a known command
    #[error("unknown command /{0} (try /help)")]
    UnknownCommand(String),

    /// Required argument missing
    #[error("/{command} needs {expected}")]
    MissingArgument {
        /// Command name
        command: &'static str,
        /// What was expected
        expected: &'static str,
    },

    /// Argument is not a valid number
    #[error("/{command}: {value:?} is not a valid number")]
    InvalidNumber {
        /// Command name
        command: &'static str,
        /// Offending text
        value: String,
    },

    /// Bad `/mode` argument
    #[error(transparent)]
    InvalidMode(#[from] ParseCommandTypeError),
}

/// One parsed REPL line
#[derive(Clone, Debug, PartialEq)]
pub enum ReplCommand {
    /// Continue the story with this entry (may be empty)
    Prompt(String),
    /// Stop the running generation
    Abort,
    /// Change how entries are framed
    Mode(CommandType),
    /// List open tabs
    Tabs,
    /// Open and switch to a new tab
    New,
    /// Switch to a tab (0-based)
    Tab(usize),
    /// Close a tab (0-based)
    Close(usize),
    /// Name the current project
    Rename(String),
    /// Replace the current project's memory
    Memory(String),
    /// Print the current story
    Story,
    /// Search characters (None lists the project's cast)
    Chars(Option<String>),
    /// Create a character in the current project
    AddChar(String),
    /// Set a character's description
    Describe {
        /// Character name
        name: String,
        /// New description
        text: String,
    },
    /// Move a character into or out of the scene
    Toggle(String),
    /// Search named projects (None lists all)
    Projects(Option<String>),
    /// Open a named project
    Open(String),
    /// Set the token budget
    MaxTokens(u32),
    /// Set the temperature
    Temperature(f64),
    /// Save now
    Save,
    /// Show the command list
    Help,
    /// Save and exit
    Quit,
}

/// Command list shown by `/help`
pub const HELP: &str = "\
Type a line to continue the story. Commands:
  /abort                 stop the running generation
  /mode you|action       frame entries as `You: ...` or `> ...`
  /tabs                  list open tabs
  /new                   open a new tab
  /tab N                 switch to tab N
  /close N               close tab N
  /rename NAME           name the current project
  /memory TEXT           set the current project's memory
  /story                 print the current story
  /chars [QUERY]         list or search characters
  /addchar NAME          add a character to the scene
  /describe NAME = TEXT  set a character's description
  /toggle NAME           move a character into or out of the scene
  /projects [QUERY]      list or search saved projects
  /open NAME             open a saved project
  /maxtokens N           tokens per generation
  /temperature T         sampling temperature
  /save                  save now
  /help                  show this list
  /quit                  save and exit";

impl ReplCommand {
    /// Parse one input line
    pub fn parse(line: &str) -> Result<Self, CommandParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(command_line) = line.trim_start().strip_prefix('/') else {
            return Ok(Self::Prompt(line.trim().to_string()));
        };

        let (name, rest) = match command_line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (command_line, ""),
        };
        let optional = (!rest.is_empty()).then(|| rest.to_string());

        match name.to_lowercase().as_str() {
            "abort" | "stop" => Ok(Self::Abort),
            "mode" => Ok(Self::Mode(required("mode", "you or action", rest)?.parse()?)),
            "tabs" => Ok(Self::Tabs),
            "new" => Ok(Self::New),
            "tab" => Ok(Self::Tab(tab_number("tab", rest)?)),
            "close" => Ok(Self::Close(tab_number("close", rest)?)),
            "rename" => Ok(Self::Rename(required("rename", "a name", rest)?)),
            "memory" => Ok(Self::Memory(rest.to_string())),
            "story" => Ok(Self::Story),
            "chars" => Ok(Self::Chars(optional)),
            "addchar" => Ok(Self::AddChar(required("addchar", "a name", rest)?)),
            "describe" => {
                let (name, text) = rest.split_once('=').ok_or(CommandParseError::MissingArgument {
                    command: "describe",
                    expected: "NAME = TEXT",
                })?;
                Ok(Self::Describe {
                    name: required("describe", "NAME = TEXT", name)?,
                    text: text.trim().to_string(),
                })
            }
            "toggle" => Ok(Self::Toggle(required("toggle", "a name", rest)?)),
            "projects" => Ok(Self::Projects(optional)),
            "open" => Ok(Self::Open(required("open", "a project name", rest)?)),
            "maxtokens" => Ok(Self::MaxTokens(number("maxtokens", rest)?)),
            "temperature" | "temp" => Ok(Self::Temperature(number("temperature", rest)?)),
            "save" => Ok(Self::Save),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            other => Err(CommandParseError::UnknownCommand(other.to_string())),
        }
    }
}

fn required(
    command: &'static str,
    expected: &'static str,
    rest: &str,
) -> Result<String, CommandParseError> {
    let rest = rest.trim();
    if rest.is_empty() {
        Err(CommandParseError::MissingArgument { command, expected })
    } else {
        Ok(rest.to_string())
    }
}

fn number<T: std::str::FromStr>(command: &'static str, rest: &str) -> Result<T, CommandParseError> {
    let value = required(command, "a number", rest)?;
    value
        .parse()
        .map_err(|_| CommandParseError::InvalidNumber { command, value })
}

/// 1-based tab number to 0-based index
fn tab_number(command: &'static str, rest: &str) -> Result<usize, CommandParseError> {
    let n: usize = number(command, rest)?;
    n.checked_sub(1).ok_or(CommandParseError::InvalidNumber {
        command,
        value: rest.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_plain_lines_are_prompts() {
        assert_eq!(
            ReplCommand::parse("  Hello there  \n"),
            Ok(ReplCommand::Prompt("Hello there".to_string()))
        );
        assert_eq!(ReplCommand::parse(""), Ok(ReplCommand::Prompt(String::new())));
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(ReplCommand::parse("/abort"), Ok(ReplCommand::Abort));
        assert_eq!(ReplCommand::parse("/TABS"), Ok(ReplCommand::Tabs));
        assert_eq!(ReplCommand::parse("/quit"), Ok(ReplCommand::Quit));
        assert_eq!(ReplCommand::parse("/chars"), Ok(ReplCommand::Chars(None)));
        assert_eq!(
            ReplCommand::parse("/chars  an "),
            Ok(ReplCommand::Chars(Some("an".to_string())))
        );
    }

    #[test]
    fn test_mode() {
        assert_eq!(
            ReplCommand::parse("/mode action"),
            Ok(ReplCommand::Mode(CommandType::Action))
        );
        assert!(matches!(
            ReplCommand::parse("/mode shout"),
            Err(CommandParseError::InvalidMode(_))
        ));
    }

    #[test]
    fn test_tab_numbers_are_one_based() {
        assert_eq!(ReplCommand::parse("/tab 2"), Ok(ReplCommand::Tab(1)));
        assert_eq!(ReplCommand::parse("/close 1"), Ok(ReplCommand::Close(0)));
        assert!(matches!(
            ReplCommand::parse("/tab 0"),
            Err(CommandParseError::InvalidNumber { .. })
        ));
        assert_eq!(
            ReplCommand::parse("/tab"),
            Err(CommandParseError::MissingArgument {
                command: "tab",
                expected: "a number"
            })
        );
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            ReplCommand::parse("/describe Mira = A tall knight. = honest"),
            Ok(ReplCommand::Describe {
                name: "Mira".to_string(),
                text: "A tall knight. = honest".to_string(),
            })
        );
        assert!(ReplCommand::parse("/describe Mira").is_err());
        assert!(ReplCommand::parse("/describe = text").is_err());
    }

    #[test]
    fn test_numbers() {
        assert_eq!(ReplCommand::parse("/maxtokens 80"), Ok(ReplCommand::MaxTokens(80)));
        assert_eq!(
            ReplCommand::parse("/temperature 1.1"),
            Ok(ReplCommand::Temperature(1.1))
        );
        assert!(matches!(
            ReplCommand::parse("/maxtokens lots"),
            Err(CommandParseError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            ReplCommand::parse("/dance"),
            Err(CommandParseError::UnknownCommand("dance".to_string()))
        );
    }
}
