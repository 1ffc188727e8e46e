//! Parsing of terminal input lines.

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Submit text to the active channel.
    Send(String),
    /// Switch the active channel.
    Channel(String),
    /// Set (or clear) the auxiliary context attached to following submissions.
    Context(Option<String>),
    Mute,
    Unmute,
    /// Clear the active channel locally and on the server.
    Reset,
    /// List channels with unread events.
    Unread,
    /// List channels the server offers.
    Channels,
    /// Leave a note on the active channel for the server's personas.
    Note(String),
    /// Drop the connection and let the supervisor reconnect.
    Reconnect,
    Help,
    Quit,
    /// A `/command` we don't know, or one missing its argument.
    Invalid(String),
}

pub const HELP: &str = "\
commands:
  /channel <key>    switch channel (#name or @persona)
  /context [text]   attach context to following messages (no text clears it)
  /mute, /unmute    toggle audio playback
  /reset            clear the active channel
  /unread           list channels with unread messages
  /channels         list available channels
  /note <text>      leave a note on the active channel for its personas
  /reconnect        drop and re-open the stream
  /quit             exit
  //text            send text starting with '/'";

impl Input {
    /// Parse a line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some(escaped) = line.strip_prefix("//") {
            return Some(Self::Send(format!("/{escaped}")));
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(match line {
                "quit" | "exit" => Self::Quit,
                _ => Self::Send(line.to_string()),
            });
        };

        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        Some(match (name, arg) {
            ("channel" | "join", "") => Self::Invalid("usage: /channel <key>".to_string()),
            ("channel" | "join", key) => Self::Channel(key.to_string()),
            ("context", "") => Self::Context(None),
            ("context", text) => Self::Context(Some(text.to_string())),
            ("mute", _) => Self::Mute,
            ("unmute", _) => Self::Unmute,
            ("reset", _) => Self::Reset,
            ("unread", _) => Self::Unread,
            ("channels", _) => Self::Channels,
            ("note", "") => Self::Invalid("usage: /note <text>".to_string()),
            ("note", text) => Self::Note(text.to_string()),
            ("reconnect", _) => Self::Reconnect,
            ("help", _) => Self::Help,
            ("quit" | "exit", _) => Self::Quit,
            (other, _) => Self::Invalid(format!("unknown command /{other}; try /help")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_sent() {
        assert_eq!(Input::parse("  hello there "), Some(Input::Send("hello there".into())));
        assert_eq!(Input::parse("   "), None);
    }

    #[test]
    fn commands_parse_with_arguments() {
        assert_eq!(Input::parse("/channel #random"), Some(Input::Channel("#random".into())));
        assert_eq!(Input::parse("/join   @leah"), Some(Input::Channel("@leah".into())));
        assert_eq!(
            Input::parse("/context be brief"),
            Some(Input::Context(Some("be brief".into())))
        );
        assert_eq!(Input::parse("/context"), Some(Input::Context(None)));
        assert_eq!(Input::parse("/mute"), Some(Input::Mute));
        assert_eq!(Input::parse("/reset"), Some(Input::Reset));
        assert_eq!(Input::parse("/channels"), Some(Input::Channels));
        assert_eq!(
            Input::parse("/note  standup at 10 "),
            Some(Input::Note("standup at 10".into()))
        );
        assert_eq!(Input::parse("quit"), Some(Input::Quit));
    }

    #[test]
    fn bad_commands_are_invalid() {
        assert!(matches!(Input::parse("/channel"), Some(Input::Invalid(_))));
        assert!(matches!(Input::parse("/note"), Some(Input::Invalid(_))));
        assert!(matches!(Input::parse("/dance"), Some(Input::Invalid(_))));
    }

    #[test]
    fn double_slash_escapes() {
        assert_eq!(Input::parse("//shrug"), Some(Input::Send("/shrug".into())));
    }
}
