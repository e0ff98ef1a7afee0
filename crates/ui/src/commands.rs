use std::path::PathBuf;

use snafu::{OptionExt, Snafu, ensure};

/// Where attachments go: the global composer or one pane's composer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposerTarget {
    Global,
    Pane(String),
}

/// One line of user input, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Empty,
    Help,
    Quit,
    Board,
    Show { model: String },
    Models,
    Toggle { model: String },
    SendGlobal { text: String },
    SendTo { model: String, text: String },
    Attach {
        target: ComposerTarget,
        paths: Vec<PathBuf>,
    },
    Detach {
        target: ComposerTarget,
        index: usize,
    },
    ToggleInput { model: String },
    ToggleMenu { model: String },
    Fullscreen { model: String },
    SideMenu,
    Collapse,
    Dark,
    Image { model: String, message_id: String },
    Speak { model: String, message_id: String },
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    UnknownCommand { name: String },
    #[snafu(display("`/{command}` needs {argument}"))]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[snafu(display("`{raw}` is not an attachment index"))]
    InvalidIndex { raw: String },
}

pub const HELP: &str = "\
plain text              send to every selected model
@<model> <text>         send to one model
/send <model> <text>    same as @<model>
/models                 list models and their selection
/toggle <model>         select or deselect a model
/board                  show every pane
/show <model>           show one pane
/attach [@model] <path>...  attach images to a composer
/detach [@model] <index>    remove a pending image
/input <model>          show or hide a pane's input
/menu <model>           open or close a pane's menu
/fullscreen <model>     focus one pane, again to leave
/sidebar                open or close the model list
/collapse               collapse or expand the global composer
/dark                   switch dark mode
/image <model> <message-id>  generate an image from a message
/speak <model> <message-id>  synthesize a message to audio
/quit                   leave";

/// Parses one input line. Text that is not a command goes to the global composer.
pub fn parse(line: &str) -> Result<ReplCommand, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(ReplCommand::Empty);
    }

    if let Some(rest) = line.strip_prefix('@') {
        let (model, text) = split_word(rest);
        ensure!(
            !model.is_empty(),
            MissingArgumentSnafu {
                command: "send",
                argument: "a model",
            }
        );
        return Ok(ReplCommand::SendTo {
            model: model.to_string(),
            text: text.to_string(),
        });
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Ok(ReplCommand::SendGlobal {
            text: line.to_string(),
        });
    };

    let (name, args) = split_word(rest);
    match name {
        "help" | "h" | "?" => Ok(ReplCommand::Help),
        "quit" | "q" | "exit" => Ok(ReplCommand::Quit),
        "board" => Ok(ReplCommand::Board),
        "models" => Ok(ReplCommand::Models),
        "sidebar" => Ok(ReplCommand::SideMenu),
        "collapse" => Ok(ReplCommand::Collapse),
        "dark" => Ok(ReplCommand::Dark),
        "show" => Ok(ReplCommand::Show {
            model: required_word(args, "show")?,
        }),
        "toggle" => Ok(ReplCommand::Toggle {
            model: required_word(args, "toggle")?,
        }),
        "input" => Ok(ReplCommand::ToggleInput {
            model: required_word(args, "input")?,
        }),
        "menu" => Ok(ReplCommand::ToggleMenu {
            model: required_word(args, "menu")?,
        }),
        "fullscreen" => Ok(ReplCommand::Fullscreen {
            model: required_word(args, "fullscreen")?,
        }),
        "send" => {
            let (model, text) = split_word(args);
            ensure!(
                !model.is_empty(),
                MissingArgumentSnafu {
                    command: "send",
                    argument: "a model",
                }
            );
            Ok(ReplCommand::SendTo {
                model: model.to_string(),
                text: text.to_string(),
            })
        }
        "attach" => {
            let (target, rest) = composer_target(args);
            let paths = rest
                .split_whitespace()
                .map(PathBuf::from)
                .collect::<Vec<_>>();
            ensure!(
                !paths.is_empty(),
                MissingArgumentSnafu {
                    command: "attach",
                    argument: "at least one path",
                }
            );
            Ok(ReplCommand::Attach { target, paths })
        }
        "detach" => {
            let (target, rest) = composer_target(args);
            let raw = required_word(rest, "detach")?;
            let index = raw
                .parse::<usize>()
                .ok()
                .context(InvalidIndexSnafu { raw })?;
            Ok(ReplCommand::Detach { target, index })
        }
        "image" => {
            let (model, message_id) = model_and_message(args, "image")?;
            Ok(ReplCommand::Image { model, message_id })
        }
        "speak" => {
            let (model, message_id) = model_and_message(args, "speak")?;
            Ok(ReplCommand::Speak { model, message_id })
        }
        other => UnknownCommandSnafu { name: other }.fail(),
    }
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (input, ""),
    }
}

fn required_word(input: &str, command: &'static str) -> Result<String, CommandError> {
    let (word, _) = split_word(input);
    ensure!(
        !word.is_empty(),
        MissingArgumentSnafu {
            command,
            argument: "an argument",
        }
    );
    Ok(word.to_string())
}

fn composer_target(input: &str) -> (ComposerTarget, &str) {
    let (word, rest) = split_word(input);
    match word.strip_prefix('@') {
        Some(model) if !model.is_empty() => (ComposerTarget::Pane(model.to_string()), rest),
        _ => (ComposerTarget::Global, input.trim()),
    }
}

fn model_and_message(
    input: &str,
    command: &'static str,
) -> Result<(String, String), CommandError> {
    let (model, rest) = split_word(input);
    let (message_id, _) = split_word(rest);
    ensure!(
        !model.is_empty() && !message_id.is_empty(),
        MissingArgumentSnafu {
            command,
            argument: "a model and a message id",
        }
    );
    Ok((model.to_string(), message_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_goes_to_the_global_composer() {
        assert_eq!(
            parse("  hello everyone "),
            Ok(ReplCommand::SendGlobal {
                text: "hello everyone".to_string()
            })
        );
        assert_eq!(parse("   "), Ok(ReplCommand::Empty));
    }

    #[test]
    fn mentions_and_send_target_one_model() {
        let expected = ReplCommand::SendTo {
            model: "gpt-4o".to_string(),
            text: "just you".to_string(),
        };
        assert_eq!(parse("@gpt-4o just you"), Ok(expected.clone()));
        assert_eq!(parse("/send gpt-4o   just you"), Ok(expected));
        assert_eq!(
            parse("@"),
            Err(CommandError::MissingArgument {
                command: "send",
                argument: "a model",
            })
        );
    }

    #[test]
    fn attachments_can_target_a_pane() {
        assert_eq!(
            parse("/attach @alpha a.png b.jpg"),
            Ok(ReplCommand::Attach {
                target: ComposerTarget::Pane("alpha".to_string()),
                paths: vec![PathBuf::from("a.png"), PathBuf::from("b.jpg")],
            })
        );
        assert_eq!(
            parse("/attach a.png"),
            Ok(ReplCommand::Attach {
                target: ComposerTarget::Global,
                paths: vec![PathBuf::from("a.png")],
            })
        );
        assert!(matches!(
            parse("/attach @alpha"),
            Err(CommandError::MissingArgument { .. })
        ));
    }

    #[test]
    fn detach_requires_a_numeric_index() {
        assert_eq!(
            parse("/detach 2"),
            Ok(ReplCommand::Detach {
                target: ComposerTarget::Global,
                index: 2,
            })
        );
        assert_eq!(
            parse("/detach @alpha two"),
            Err(CommandError::InvalidIndex {
                raw: "two".to_string()
            })
        );
    }

    #[test]
    fn message_actions_need_both_ids() {
        assert_eq!(
            parse("/image alpha msg-1"),
            Ok(ReplCommand::Image {
                model: "alpha".to_string(),
                message_id: "msg-1".to_string(),
            })
        );
        assert!(matches!(
            parse("/speak alpha"),
            Err(CommandError::MissingArgument { command: "speak", .. })
        ));
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert_eq!(
            parse("/frobnicate"),
            Err(CommandError::UnknownCommand {
                name: "frobnicate".to_string()
            })
        );
    }
}
