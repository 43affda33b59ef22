mod backend;
mod config;
mod ui;

use backend::ehentai::{Fetcher, HttpFetcher, open_gallery};
use backend::progress::ProgressStore;
use backend::scheduler::{ReaderEvent, SchedulerState};
use backend::session::ReaderSession;
use config::{APP_DIR, ReaderConfig};
use ui::ui::{App, ui};

use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures::StreamExt;
use ratatui::{Terminal, backend::CrosstermBackend};
use std::{error::Error, fs, io, path::PathBuf, sync::Arc};

const USAGE: &str = "usage: eh-reader-tui <gallery-or-viewer-url> [--page N]";

struct Args {
    url: String,
    page: Option<usize>,
}

fn parse_args(mut args: pico_args::Arguments) -> Result<Args, String> {
    if args.contains(["-h", "--help"]) {
        return Err(USAGE.to_string());
    }

    let page = args
        .opt_value_from_str(["-p", "--page"])
        .map_err(|e| format!("{}\n{}", e, USAGE))?;

    let mut free = args.finish().into_iter();
    let url = free
        .next()
        .and_then(|s| s.into_string().ok())
        .ok_or(USAGE)?;
    if free.next().is_some() {
        return Err(USAGE.to_string());
    }

    Ok(Args { url, page })
}

fn init_logging() {
    let log_dir = dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR);
    fs::create_dir_all(&log_dir).ok();

    // The terminal belongs to the reader, so logs go to a file.
    let target = match fs::File::create(log_dir.join("reader.log")) {
        Ok(file) => env_logger::Target::Pipe(Box::new(file)),
        Err(_) => env_logger::Target::Stderr,
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(target)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args(pico_args::Arguments::from_env())?;
    init_logging();

    let config = ReaderConfig::load();
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&config)?);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new();

    app.set_loading("Fetching gallery...");
    terminal.draw(|f| ui(f, &mut app))?;

    let res = match open_gallery(Arc::clone(&fetcher), &args.url, &config).await {
        Ok(opened) => {
            let progress = config
                .remember_last_page
                .then(ProgressStore::open_default);
            let mut session = ReaderSession::start(opened, fetcher, &config, progress, args.page);

            let context = session.context();
            let title = context
                .title
                .clone()
                .unwrap_or_else(|| format!("Gallery {}", context.gallery_id));
            app.open_gallery(&title, context.total_pages, session.start_page());
            app.set_ready();

            let res = run_app(&mut terminal, &mut app, &mut session).await;
            session.shutdown();
            res
        }
        Err(e) => {
            log::error!("could not open {}: {}", args.url, e);
            Err(io::Error::other(format!("could not open {}: {}", args.url, e)))
        }
    };

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        eprintln!("{err}");
    }
    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    session: &mut ReaderSession,
) -> io::Result<()> {
    let mut event_stream = EventStream::new();

    loop {
        app.busy = session.snapshot().state != SchedulerState::Idle;
        terminal.draw(|f| ui(f, app))?;

        tokio::select! {
            // Redraw for the spinner
            _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => {}

            Some(Ok(event)) = event_stream.next() => {
                if let Event::Key(key) = event {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    if key.code == KeyCode::Char('q')
                        || (key.code == KeyCode::Esc && app.goto_input.is_empty())
                    {
                        return Ok(());
                    }
                    handle_reader_input(app, session, key.code).await;
                }
            }

            Some(event) = session.next_event() => {
                match event {
                    ReaderEvent::PageReady { page, image } => {
                        app.set_page_image(page, &image);
                    }
                    ReaderEvent::PageLoadFailed { page, reason } => {
                        app.set_page_error(page, &reason);
                    }
                    ReaderEvent::PreloadFailed { page, reason } => {
                        log::debug!("ignoring preload failure for page {}: {}", page, reason);
                    }
                }
            }
        }
    }
}

async fn handle_reader_input(app: &mut App, session: &ReaderSession, key: KeyCode) {
    let target = match key {
        KeyCode::Right | KeyCode::PageDown | KeyCode::Char(' ') | KeyCode::Char('l') => {
            app.step(true)
        }
        KeyCode::Left | KeyCode::PageUp | KeyCode::Char('h') => app.step(false),
        KeyCode::Home => app.jump(1),
        KeyCode::End => app.jump(app.total_pages),
        KeyCode::Char(c) if c.is_ascii_digit() => {
            app.push_goto_digit(c);
            None
        }
        KeyCode::Backspace => {
            app.goto_input.pop();
            None
        }
        KeyCode::Esc => {
            app.goto_input.clear();
            None
        }
        KeyCode::Enter => app.take_goto().and_then(|page| app.jump(page)),
        KeyCode::Char('r') => {
            if let Some(page) = app.failed_page() {
                app.page_error = None;
                app.requested_page = page;
                if let Err(e) = session.retry(page).await {
                    log::warn!("retry of page {} refused: {}", page, e);
                }
            }
            None
        }
        _ => None,
    };

    if let Some(page) = target {
        app.page_error = None;
        if let Err(e) = session.navigate(page) {
            log::warn!("navigation to page {} refused: {}", page, e);
        }
    }
}
