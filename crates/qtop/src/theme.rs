use crossterm::style::{Attribute, Color as AnsiColor, ContentStyle};
use ratatui::style::{Color, Modifier, Style};

pub mod glyphs {
    pub const CPU: &str = "💪";
    pub const RAM: &str = "🧠";
    pub const BAR_FULL: char = '#';
    pub const BAR_EMPTY: char = '-';
}

/// Semantic color of a table cell, shared by the listing and the live view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tone {
    #[default]
    Plain,
    Ok,
    Attention,
    Muted,
    Header,
}

pub const OK: AnsiColor = AnsiColor::Green;
pub const ATTENTION: AnsiColor = AnsiColor::Red;
pub const MUTED: AnsiColor = AnsiColor::DarkGrey;

pub fn ansi_style(tone: Tone) -> Option<ContentStyle> {
    let foreground = |color: AnsiColor| ContentStyle {
        foreground_color: Some(color),
        ..ContentStyle::new()
    };
    match tone {
        Tone::Plain => None,
        Tone::Ok => Some(foreground(OK)),
        Tone::Attention => Some(foreground(ATTENTION)),
        Tone::Muted => Some(foreground(MUTED)),
        Tone::Header => Some(ContentStyle {
            attributes: Attribute::Bold.into(),
            ..ContentStyle::new()
        }),
    }
}

pub const TITLE_STYLE: Style = Style::new()
    .fg(Color::Rgb(142, 192, 124))
    .add_modifier(Modifier::BOLD);
pub const STATUS_STYLE: Style = Style::new().fg(Color::Rgb(146, 131, 116));

pub fn tui_style(tone: Tone) -> Style {
    match tone {
        Tone::Plain => Style::new(),
        Tone::Ok => Style::new().fg(Color::Rgb(184, 187, 38)),
        Tone::Attention => Style::new().fg(Color::Rgb(251, 73, 52)),
        Tone::Muted => Style::new().fg(Color::Rgb(146, 131, 116)),
        Tone::Header => Style::new()
            .fg(Color::Rgb(250, 189, 47))
            .add_modifier(Modifier::BOLD),
    }
}

pub fn zebra_row_style(index: usize) -> Style {
    let bg = if index % 2 == 0 {
        Color::Rgb(18, 20, 26)
    } else {
        Color::Rgb(24, 27, 34)
    };
    Style::new().bg(bg)
}
