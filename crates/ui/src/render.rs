use std::fmt::Write as _;

use polychat_chat::chat::{ChatBoard, ChatState, Message, MessageStatus, Role};
use polychat_llm::Model;

/// Terminal color scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
    pub color: bool,
    pub dark: bool,
}

impl Style {
    pub const PLAIN: Self = Self {
        color: false,
        dark: false,
    };

    pub fn for_board(board: &ChatBoard, color: bool) -> Self {
        Self {
            color,
            dark: board.dark_mode(),
        }
    }

    fn paint(&self, text: &str, light_code: &str, dark_code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        let code = if self.dark { dark_code } else { light_code };
        format!("\x1b[{code}m{text}\x1b[0m")
    }

    fn author(&self, text: &str) -> String {
        self.paint(text, "1;34", "1;96")
    }

    fn user(&self, text: &str) -> String {
        self.paint(text, "1;32", "1;92")
    }

    fn muted(&self, text: &str) -> String {
        self.paint(text, "2", "90")
    }

    fn error(&self, text: &str) -> String {
        self.paint(text, "31", "91")
    }
}

pub fn render_message(message: &Message, style: Style) -> String {
    let time = message.timestamp.format("%H:%M");
    let author = match (&message.role, &message.source) {
        (Role::User, _) => style.user("You"),
        (Role::Assistant, Some(source)) => style.author(&source.name),
        (Role::Assistant, None) => style.author("Assistant"),
    };
    let body = match &message.status {
        MessageStatus::Final => message.content.clone(),
        MessageStatus::Thinking(_) => style.muted(&message.content),
        MessageStatus::Failed => style.error(&message.content),
    };

    let mut line = format!("[{time}] {author}: {body}");
    if !message.images.is_empty() {
        let _ = write!(line, " {}", style.muted(&format!("(+{} image(s))", message.images.len())));
    }
    if let Some(url) = &message.image_url {
        let _ = write!(line, "\n        image: {url}");
    }
    let _ = write!(line, "\n        {}", style.muted(&format!("id {}", message.id)));
    line
}

pub fn render_pane(model: &Model, chat: &ChatState, style: Style) -> String {
    let mut out = String::new();
    let status = if chat.is_loading() {
        format!(" (waiting on {})", chat.in_flight().max(1))
    } else {
        String::new()
    };
    let _ = writeln!(out, "== {} [{}]{}", style.author(&model.name), model.id, status);

    if chat.messages().is_empty() {
        let _ = writeln!(out, "{}", style.muted("  no messages yet"));
    }
    for message in chat.messages() {
        let _ = writeln!(out, "{}", render_message(message, style));
    }

    if chat.menu_open() {
        let _ = writeln!(
            out,
            "{}",
            style.muted("  menu: /input, /fullscreen, /image <message-id>, /speak <message-id>")
        );
    }
    if chat.input_shown() {
        let _ = writeln!(
            out,
            "  > {}{}",
            chat.draft(),
            attachment_summary(chat.pending_images().len())
        );
    }
    out
}

/// Lists every model with its selection marker.
pub fn render_models(board: &ChatBoard, style: Style) -> String {
    let mut out = String::new();
    for model in board.models() {
        let marker = if model.selected { "[x]" } else { "[ ]" };
        let _ = write!(out, "{marker} {} {}", model.id, style.author(&model.name));
        if let Some(description) = &model.description {
            let _ = write!(out, " {}", style.muted(description));
        }
        out.push('\n');
    }
    out
}

/// Renders the whole board, or only the fullscreen pane when one is focused.
pub fn render_board(board: &ChatBoard, style: Style) -> String {
    let mut out = String::new();

    if board.side_menu_open() {
        out.push_str(&render_models(board, style));
        out.push('\n');
    }

    let focused = board.fullscreen();
    for model in board.models() {
        if focused.is_some_and(|focused| focused != model.id) {
            continue;
        }
        if focused.is_none() && !model.selected {
            continue;
        }
        if let Some(chat) = board.chat(&model.id) {
            out.push_str(&render_pane(model, chat, style));
            out.push('\n');
        }
    }

    let composer = board.composer();
    if composer.collapsed {
        out.push_str(&style.muted("composer collapsed (/collapse to expand)"));
    } else {
        let loading = if composer.loading { " (sending...)" } else { "" };
        let _ = write!(
            out,
            "all selected > {}{}{}",
            composer.draft,
            attachment_summary(composer.images.len()),
            loading
        );
    }
    out
}

fn attachment_summary(count: usize) -> String {
    if count == 0 {
        String::new()
    } else {
        format!(" [{count} image(s) attached]")
    }
}

#[cfg(test)]
mod tests {
    use polychat_chat::chat::{MessageId, RequestTicket};

    use super::*;

    fn board() -> ChatBoard {
        ChatBoard::new(vec![Model::new("alpha", "Alpha"), Model::new("beta", "Beta")])
    }

    #[test]
    fn panes_show_placeholders_and_failures() {
        let mut board = board();
        let model = Model::new("alpha", "Alpha");
        let ticket = RequestTicket::new("alpha", 1);
        if let Some(chat) = board.chat_mut("alpha") {
            chat.push(Message::user(MessageId::new("u1"), "hi", vec!["data:".to_string()]));
            let _ = chat.begin_request(Message::thinking(ticket, &model));
            chat.push(Message::failure(&model, "boom"));
        }

        let rendered = board
            .chat("alpha")
            .map(|chat| render_pane(&model, chat, Style::PLAIN))
            .unwrap_or_default();

        assert!(rendered.starts_with("== Alpha [alpha] (waiting on 1)"));
        assert!(rendered.contains("You: hi (+1 image(s))"));
        assert!(rendered.contains("Alpha: Alpha is thinking..."));
        assert!(rendered.contains("Alpha: Failed to get a response: boom"));
        assert!(rendered.contains("id u1"));
    }

    #[test]
    fn fullscreen_limits_the_board_to_one_pane() {
        let mut board = board();
        board.toggle_fullscreen("beta");

        let rendered = render_board(&board, Style::PLAIN);
        assert!(rendered.contains("== Beta"));
        assert!(!rendered.contains("== Alpha"));
    }

    #[test]
    fn deselected_panes_are_hidden_and_listed_in_the_side_menu() {
        let mut board = board();
        board.toggle_model("alpha");
        board.toggle_side_menu();

        let rendered = render_board(&board, Style::PLAIN);
        assert!(rendered.contains("[ ] alpha Alpha"));
        assert!(rendered.contains("[x] beta Beta"));
        assert!(!rendered.contains("== Alpha"));
    }

    #[test]
    fn collapsed_composer_hides_the_draft() {
        let mut board = board();
        board.composer_mut().draft = "secret draft".to_string();
        assert!(render_board(&board, Style::PLAIN).contains("all selected > secret draft"));

        board.composer_mut().toggle_collapsed();
        assert!(!render_board(&board, Style::PLAIN).contains("secret draft"));
    }

    #[test]
    fn dark_mode_switches_the_palette() {
        let light = Style {
            color: true,
            dark: false,
        };
        let dark = Style {
            color: true,
            dark: true,
        };
        assert_ne!(light.author("Alpha"), dark.author("Alpha"));
        assert_eq!(Style::PLAIN.author("Alpha"), "Alpha");
    }
}
