use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Flex, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
};
use ratatui_image::{Resize, StatefulImage, picker::Picker, protocol::StatefulProtocol};

use crate::backend::cache::ImageHandle;
use crate::backend::ehentai::dimensions_from_url;
use crate::backend::error::ErrorKind;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    #[default]
    Loading,
    Ready,
}

pub struct App {
    pub state: AppState,
    pub loading_message: String,
    pub title: String,
    pub total_pages: usize,
    /// Last page asked for; navigation keys move from here.
    pub requested_page: usize,
    pub displayed_page: Option<usize>,
    pub picker: Option<Picker>,
    pub page_image: Option<StatefulProtocol>,
    pub page_size: Option<(u32, u32)>,
    pub page_error: Option<(usize, ErrorKind)>,
    /// A jump is waiting out the debounce or loading.
    pub busy: bool,
    pub goto_input: String,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        let picker = Picker::from_query_stdio().ok();

        Self {
            state: AppState::Loading,
            loading_message: "Initializing...".to_string(),
            title: String::new(),
            total_pages: 0,
            requested_page: 1,
            displayed_page: None,
            picker,
            page_image: None,
            page_size: None,
            page_error: None,
            busy: false,
            goto_input: String::new(),
        }
    }

    pub fn set_loading(&mut self, message: &str) {
        self.state = AppState::Loading;
        self.loading_message = message.to_string();
    }

    pub fn set_ready(&mut self) {
        self.state = AppState::Ready;
    }

    pub fn open_gallery(&mut self, title: &str, total_pages: usize, start_page: usize) {
        self.title = title.to_string();
        self.total_pages = total_pages;
        self.requested_page = start_page;
        self.displayed_page = None;
        self.page_image = None;
        self.page_error = None;
    }

    pub fn set_page_image(&mut self, page: usize, handle: &ImageHandle) {
        self.displayed_page = Some(page);
        self.page_error = None;
        self.page_size = dimensions_from_url(&handle.url)
            .or_else(|| Some((handle.image.width(), handle.image.height())));

        if let Some(ref picker) = self.picker {
            let protocol = picker.new_resize_protocol((*handle.image).clone());
            self.page_image = Some(protocol);
        }
    }

    pub fn set_page_error(&mut self, page: usize, reason: &ErrorKind) {
        self.page_error = Some((page, reason.clone()));
    }

    pub fn failed_page(&self) -> Option<usize> {
        self.page_error.as_ref().map(|(page, _)| *page)
    }

    /// Moves the requested page and returns it, or `None` at either end.
    pub fn step(&mut self, forward: bool) -> Option<usize> {
        let target = if forward {
            self.requested_page + 1
        } else {
            self.requested_page.checked_sub(1)?
        };
        self.jump(target)
    }

    pub fn jump(&mut self, page: usize) -> Option<usize> {
        if page == 0 || page > self.total_pages {
            return None;
        }
        self.requested_page = page;
        Some(page)
    }

    pub fn push_goto_digit(&mut self, c: char) {
        if c.is_ascii_digit() && self.goto_input.len() < 6 {
            self.goto_input.push(c);
        }
    }

    pub fn take_goto(&mut self) -> Option<usize> {
        let page = self.goto_input.parse::<usize>().ok();
        self.goto_input.clear();
        page
    }
}

pub fn ui(f: &mut Frame, app: &mut App) {
    match app.state {
        AppState::Loading => draw_loading_screen(f, app),
        AppState::Ready => draw_reader(f, app),
    }
}

fn draw_loading_screen(f: &mut Frame, app: &App) {
    let frame = Block::bordered()
        .title(" eh-reader-tui ")
        .title_alignment(Alignment::Center)
        .border_style(Style::default().fg(Color::DarkGray));
    let inner = frame.inner(f.area());
    f.render_widget(frame, f.area());

    let [status] = Layout::vertical([Constraint::Length(1)])
        .flex(Flex::Center)
        .areas(inner);

    let line = Line::from(vec![
        Span::styled(spinner_frame(), Style::default().fg(Color::Cyan)),
        Span::raw(" "),
        Span::styled(
            app.loading_message.as_str(),
            Style::default().add_modifier(Modifier::BOLD),
        ),
    ]);
    f.render_widget(Paragraph::new(line).alignment(Alignment::Center), status);
}

fn spinner_frame() -> &'static str {
    let spinner_frames = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    spinner_frames[(millis / 100) as usize % spinner_frames.len()]
}

fn draw_reader(f: &mut Frame, app: &mut App) {
    let area = f.area();

    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // title + page counter
            Constraint::Min(5),    // page
            Constraint::Length(3), // footer
        ])
        .split(area);

    draw_header(f, root[0], app);
    draw_page(f, root[1], app);
    draw_footer(f, root[2]);
}

fn draw_header(f: &mut Frame, area: Rect, app: &App) {
    let shown = app
        .displayed_page
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());

    let mut spans = vec![
        Span::styled(
            format!("{} / {}", shown, app.total_pages),
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
    ];
    if app.busy && app.page_error.is_none() {
        spans.push(Span::styled(
            format!("  → {} {}", app.requested_page, spinner_frame()),
            Style::default().fg(Color::Cyan),
        ));
    }
    if let Some((w, h)) = app.page_size {
        spans.push(Span::styled(
            format!("  {}x{}", w, h),
            Style::default().fg(Color::DarkGray),
        ));
    }
    if !app.goto_input.is_empty() {
        spans.push(Span::styled(
            format!("  go to: {}_", app.goto_input),
            Style::default().fg(Color::Magenta),
        ));
    }

    let title = truncate_text(&app.title, area.width.saturating_sub(4) as usize);
    let header = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .title(title)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(header, area);
}

fn draw_page(f: &mut Frame, area: Rect, app: &mut App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));
    let inner = block.inner(area);
    f.render_widget(block, area);

    if let Some((page, reason)) = &app.page_error {
        let text = vec![
            Line::from(""),
            Line::from(Span::styled(
                format!("Page {} failed to load ({})", page, reason.label()),
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            )),
            Line::from(Span::styled(
                reason.to_string(),
                Style::default().fg(Color::DarkGray),
            )),
            Line::from(""),
            Line::from(vec![
                Span::raw("Press "),
                Span::styled("r", Style::default().fg(Color::Yellow)),
                Span::raw(" to reload"),
            ]),
        ];
        let error = Paragraph::new(text)
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true });
        f.render_widget(error, inner);
        return;
    }

    if let Some(state) = app.page_image.as_mut() {
        let image_widget = StatefulImage::new().resize(Resize::Fit(None));
        f.render_stateful_widget(image_widget, inner, state);
    } else {
        let placeholder = Paragraph::new(vec![
            Line::from(""),
            Line::from(Span::styled(
                if app.picker.is_some() {
                    "Loading..."
                } else {
                    "This terminal cannot show images"
                },
                Style::default().fg(Color::DarkGray),
            )),
        ])
        .alignment(Alignment::Center);
        f.render_widget(placeholder, inner);
    }
}

fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        format!(
            "{}...",
            text.chars()
                .take(max_len.saturating_sub(3))
                .collect::<String>()
        )
    }
}

fn draw_footer(f: &mut Frame, area: Rect) {
    let text = Line::from(vec![
        Span::styled("←/→", Style::default().fg(Color::Yellow)),
        Span::raw(": page  "),
        Span::styled("Home/End", Style::default().fg(Color::Yellow)),
        Span::raw(": first/last  "),
        Span::styled("0-9 Enter", Style::default().fg(Color::Yellow)),
        Span::raw(": go to  "),
        Span::styled("r", Style::default().fg(Color::Yellow)),
        Span::raw(": reload  "),
        Span::styled("q", Style::default().fg(Color::Yellow)),
        Span::raw(": quit"),
    ]);

    let p = Paragraph::new(text)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .alignment(Alignment::Center);
    f.render_widget(p, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(total: usize, start: usize) -> App {
        let mut app = App::new_without_terminal();
        app.open_gallery("Test", total, start);
        app
    }

    impl App {
        fn new_without_terminal() -> Self {
            Self {
                state: AppState::Ready,
                loading_message: String::new(),
                title: String::new(),
                total_pages: 0,
                requested_page: 1,
                displayed_page: None,
                picker: None,
                page_image: None,
                page_size: None,
                page_error: None,
                busy: false,
                goto_input: String::new(),
            }
        }
    }

    #[test]
    fn test_step_stays_inside_gallery() {
        let mut app = app(3, 1);
        assert_eq!(app.step(false), None);
        assert_eq!(app.step(true), Some(2));
        assert_eq!(app.step(true), Some(3));
        assert_eq!(app.step(true), None);
        assert_eq!(app.requested_page, 3);
    }

    #[test]
    fn test_goto_input() {
        let mut app = app(50, 1);
        app.push_goto_digit('1');
        app.push_goto_digit('x');
        app.push_goto_digit('2');
        assert_eq!(app.goto_input, "12");
        assert_eq!(app.take_goto(), Some(12));
        assert!(app.goto_input.is_empty());
        assert_eq!(app.take_goto(), None);
    }

    #[test]
    fn test_loading_screen_shows_message() {
        use ratatui::{Terminal, backend::TestBackend};

        let mut app = App::new_without_terminal();
        app.set_loading("Fetching gallery...");
        let mut terminal = Terminal::new(TestBackend::new(40, 7)).unwrap();
        terminal.draw(|f| ui(f, &mut app)).unwrap();

        let buffer = terminal.backend().buffer();
        let row = |y: u16| {
            (0..buffer.area.width)
                .map(|x| buffer[(x, y)].symbol())
                .collect::<String>()
        };
        assert!(row(0).contains("eh-reader-tui"));
        assert!(row(3).contains("Fetching gallery..."));
    }

    #[test]
    fn test_page_error_tracking() {
        let mut app = app(5, 2);
        app.set_page_error(2, &ErrorKind::Timeout);
        assert_eq!(app.failed_page(), Some(2));
        assert_eq!(truncate_text("abcdefgh", 6), "abc...");
    }
}
