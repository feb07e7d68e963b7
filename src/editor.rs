//! Terminal front-end: a raw-mode editor pane with per-token heat colouring,
//! ghost continuations around the cursor, and a status/readout strip. All
//! model work stays in the buffer; this file only translates keys and paints.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossterm::style::Color;
use crossterm::{cursor, event, execute, queue, style, terminal};
use eyre::Result;
use futures_util::StreamExt;

use crate::buffer::{Alts, Buffer, BufferEvents};
use crate::config::Config;
use crate::engine::{Engine, ModelInfo, Vocab};

#[derive(Debug, Clone)]
enum UiEvent {
    Invalidate(usize, usize),
    Logit(usize, usize, f32),
    PredictionsChanged,
    TailReplace(usize, String),
}

/// Buffer callbacks land here; the frame loop drains them.
#[derive(Clone, Default)]
struct EventSink(Arc<Mutex<Vec<UiEvent>>>);

impl BufferEvents for EventSink {
    fn on_invalidate(&mut self, from: usize, to: usize) {
        self.0.lock().unwrap().push(UiEvent::Invalidate(from, to));
    }
    fn on_logit(&mut self, from: usize, to: usize, logit_minus_max: f32) {
        self.0
            .lock()
            .unwrap()
            .push(UiEvent::Logit(from, to, logit_minus_max));
    }
    fn on_predictions_changed(&mut self) {
        self.0.lock().unwrap().push(UiEvent::PredictionsChanged);
    }
    fn on_tail_replace(&mut self, from: usize, text: &str) {
        self.0
            .lock()
            .unwrap()
            .push(UiEvent::TailReplace(from, text.to_string()));
    }
}

struct View {
    document: String,
    cursor: usize,
    /// Scored byte ranges and their `logit - max_logit`.
    spans: Vec<(usize, usize, f32)>,
    alts: Alts,
    info: ModelInfo,
    file: Option<PathBuf>,
    log_line: String,
    notice: String,
    dirty: bool,
}

pub async fn run(
    vocab: Arc<dyn Vocab>,
    engine: Box<dyn Engine>,
    info: ModelInfo,
    config: Config,
    file: Option<PathBuf>,
    log_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    let sink = EventSink::default();
    let mut buffer = Buffer::new(vocab, engine, config, Box::new(sink.clone()))?;

    let mut view = View {
        document: String::new(),
        cursor: 0,
        spans: Vec::new(),
        alts: Alts::default(),
        info,
        file: file.clone(),
        log_line: String::new(),
        notice: String::new(),
        dirty: true,
    };

    if let Some(path) = &file {
        if let Ok(text) = std::fs::read_to_string(path) {
            buffer.insert(0, &text);
            view.document = text;
            view.cursor = view.document.len();
            buffer.request_alts_at(view.cursor);
        }
    }

    terminal::enable_raw_mode()?;
    let mut out = std::io::stdout();
    execute!(out, terminal::EnterAlternateScreen, cursor::Hide)?;

    let result = frame_loop(&mut buffer, &mut view, &sink, log_rx).await;

    buffer.pump_until_idle();
    let _ = execute!(out, terminal::LeaveAlternateScreen, cursor::Show);
    let _ = terminal::disable_raw_mode();
    result
}

async fn frame_loop(
    buffer: &mut Buffer,
    view: &mut View,
    sink: &EventSink,
    mut log_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    let mut events = event::EventStream::new();
    let mut tick = tokio::time::interval(Duration::from_millis(16));

    loop {
        drain_sink(buffer, view, sink);
        if view.dirty {
            draw(buffer, view)?;
            view.dirty = false;
        }

        tokio::select! {
            maybe = events.next() => match maybe {
                Some(Ok(ev)) => {
                    if handle_event(buffer, view, ev)? {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
            line = log_rx.recv() => {
                if let Some(line) = line {
                    view.log_line = line;
                    view.dirty = true;
                }
            }
            _ = tick.tick() => {
                if buffer.poll() {
                    view.dirty = true;
                }
            }
        }
    }
}

/// Apply queued buffer callbacks to the view.
fn drain_sink(buffer: &Buffer, view: &mut View, sink: &EventSink) {
    let events = std::mem::take(&mut *sink.0.lock().unwrap());
    if events.is_empty() {
        return;
    }
    view.dirty = true;
    for ev in events {
        match ev {
            UiEvent::Invalidate(from, to) => {
                view.spans.retain(|&(a, b, _)| b <= from || a >= to);
            }
            UiEvent::Logit(from, to, v) => {
                view.spans.retain(|&(a, b, _)| b <= from || a >= to);
                view.spans.push((from, to, v));
            }
            UiEvent::PredictionsChanged => {
                view.alts = buffer.get_alts_at(view.cursor);
            }
            UiEvent::TailReplace(from, text) => {
                let from = from.min(view.document.len());
                view.document.truncate(from);
                view.document.push_str(&text);
                view.spans.retain(|&(a, _, _)| a < from);
                view.cursor = view.cursor.min(view.document.len());
            }
        }
    }
}

/// Returns true when the editor should exit.
fn handle_event(buffer: &mut Buffer, view: &mut View, ev: event::Event) -> Result<bool> {
    use event::{Event, KeyCode, KeyEventKind, KeyModifiers};

    let Event::Key(key) = ev else {
        if matches!(ev, Event::Resize(..)) {
            view.dirty = true;
        }
        return Ok(false);
    };
    if key.kind == KeyEventKind::Release {
        return Ok(false);
    }
    view.dirty = true;

    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    let alt = key.modifiers.contains(KeyModifiers::ALT);

    match key.code {
        KeyCode::Char('q') if ctrl => return Ok(true),
        KeyCode::Char('s') if ctrl => {
            save(buffer, view);
        }
        KeyCode::Char('r') if ctrl => {
            reload_model(buffer, view);
        }
        KeyCode::Down if alt => {
            buffer.alt_next(view.cursor);
            view.alts = buffer.get_alts_at(view.cursor);
        }
        KeyCode::Up if alt => {
            buffer.alt_prev(view.cursor);
            view.alts = buffer.get_alts_at(view.cursor);
        }
        KeyCode::Left if alt => {
            view.cursor = buffer.alt_back(view.cursor);
        }
        KeyCode::Tab => {
            view.cursor = buffer.alt_commit(view.cursor);
            buffer.request_alts_at(view.cursor);
        }
        KeyCode::Char(c) if !ctrl && !alt => {
            insert_text(buffer, view, &c.to_string());
        }
        KeyCode::Enter => {
            insert_text(buffer, view, "\n");
        }
        KeyCode::Backspace => {
            if let Some(prev) = prev_boundary(&view.document, view.cursor) {
                view.document.replace_range(prev..view.cursor, "");
                buffer.erase(prev, view.cursor);
                view.cursor = prev;
                buffer.request_alts_at(view.cursor);
            }
        }
        KeyCode::Delete => {
            if let Some(next) = next_boundary(&view.document, view.cursor) {
                view.document.replace_range(view.cursor..next, "");
                buffer.erase(view.cursor, next);
                buffer.request_alts_at(view.cursor);
            }
        }
        KeyCode::Left => {
            if let Some(prev) = prev_boundary(&view.document, view.cursor) {
                view.cursor = prev;
                buffer.request_alts_at(view.cursor);
            }
        }
        KeyCode::Right => {
            if let Some(next) = next_boundary(&view.document, view.cursor) {
                view.cursor = next;
                buffer.request_alts_at(view.cursor);
            }
        }
        KeyCode::Home => view.cursor = line_start(&view.document, view.cursor),
        KeyCode::End => view.cursor = line_end(&view.document, view.cursor),
        _ => view.dirty = false,
    }
    Ok(false)
}

fn insert_text(buffer: &mut Buffer, view: &mut View, text: &str) {
    view.document.insert_str(view.cursor, text);
    buffer.insert(view.cursor, text);
    view.cursor += text.len();
    buffer.request_alts_at(view.cursor);
}

fn save(buffer: &Buffer, view: &mut View) {
    match &view.file {
        Some(path) => match std::fs::write(path, buffer.render_document()) {
            Ok(()) => view.notice = format!("saved {}", path.display()),
            Err(e) => view.notice = format!("save failed: {e}"),
        },
        None => view.notice = "no file to save to; start with a path".to_string(),
    }
}

/// Reload the current weights and resynthesize the tree over the committed
/// text. A failed load keeps the running model.
fn reload_model(buffer: &mut Buffer, view: &mut View) {
    match crate::engine::llama::load(&view.info.path) {
        Ok(rig) => match buffer.replace_engine(rig.vocab, rig.engine) {
            Ok(()) => {
                view.info = rig.info;
                view.notice = "model reloaded".to_string();
            }
            Err(e) => {
                tracing::error!(%e, "engine swap failed");
                view.notice = format!("reload failed: {e}");
            }
        },
        Err(e) => {
            tracing::error!(%e, "model reload failed");
            view.notice = format!("reload failed: {e}");
        }
    }
}

fn prev_boundary(text: &str, pos: usize) -> Option<usize> {
    if pos == 0 || pos > text.len() {
        return None;
    }
    let mut p = pos - 1;
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    Some(p)
}

fn next_boundary(text: &str, pos: usize) -> Option<usize> {
    if pos >= text.len() {
        return None;
    }
    let mut p = pos + 1;
    while p < text.len() && !text.is_char_boundary(p) {
        p += 1;
    }
    Some(p)
}

fn line_start(text: &str, pos: usize) -> usize {
    text[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0)
}

fn line_end(text: &str, pos: usize) -> usize {
    text[pos..].find('\n').map(|i| pos + i).unwrap_or(text.len())
}

/// Map a normalised logit to a heat colour: greedy tokens cool, long tails hot.
fn heat(logit_minus_max: f32) -> Color {
    if logit_minus_max > -0.5 {
        Color::Green
    } else if logit_minus_max > -2.0 {
        Color::Yellow
    } else if logit_minus_max > -5.0 {
        Color::Red
    } else {
        Color::DarkGrey
    }
}

fn span_colour(spans: &[(usize, usize, f32)], pos: usize) -> Option<Color> {
    spans
        .iter()
        .find(|&&(a, b, _)| a <= pos && pos < b)
        .map(|&(_, _, v)| heat(v))
}

fn draw(buffer: &Buffer, view: &View) -> Result<()> {
    let (w, h) = terminal::size()?;
    let w = w.max(20) as usize;
    let h = h.max(8) as usize;
    let text_rows = h - 5;

    let mut out = std::io::stdout();
    queue!(
        out,
        cursor::MoveTo(0, 0),
        terminal::Clear(terminal::ClearType::All)
    )?;

    // document pane with heat colouring and a cursor mark
    let mut row = 0usize;
    let mut col = 0usize;
    for (idx, ch) in view.document.char_indices() {
        if row >= text_rows {
            break;
        }
        let colour = span_colour(&view.spans, idx);
        let at_cursor = idx == view.cursor;
        put_char(&mut out, ch, colour, at_cursor)?;
        if ch == '\n' || col + 1 >= w {
            row += 1;
            col = 0;
            queue!(out, cursor::MoveTo(0, row as u16))?;
        } else {
            col += 1;
        }
    }
    // cursor at end of text: show the selected continuation as ghost text
    if view.cursor >= view.document.len() && row < text_rows {
        queue!(out, style::SetForegroundColor(Color::DarkGrey))?;
        let ghost: String = view.alts.selected.chars().take(w - col.min(w)).collect();
        queue!(
            out,
            style::SetAttribute(style::Attribute::Reverse),
            style::Print(' '),
            style::SetAttribute(style::Attribute::Reset),
            style::SetForegroundColor(Color::DarkGrey),
            style::Print(ghost),
            style::ResetColor
        )?;
    }

    // prediction strip
    let strip = |label: &str, s: &str| -> String {
        clip(&format!("{label} {}", s.replace('\n', "⏎")), w)
    };
    queue!(
        out,
        cursor::MoveTo(0, text_rows as u16),
        style::SetForegroundColor(Color::DarkGrey),
        style::Print(strip("▲", &view.alts.above)),
        cursor::MoveTo(0, text_rows as u16 + 1),
        style::SetForegroundColor(Color::White),
        style::Print(strip("▶", &view.alts.selected)),
        cursor::MoveTo(0, text_rows as u16 + 2),
        style::SetForegroundColor(Color::DarkGrey),
        style::Print(strip("▼", &view.alts.below)),
    )?;

    // status: model, cursor, outstanding work
    let queue_line = buffer.queue_summary();
    let status = format!(
        "{} {} | ctx {} | pos {} | {} {}{} {}",
        view.info.architecture,
        view.info.size_label,
        view.info.n_ctx,
        view.cursor,
        if buffer.is_idle() { "idle" } else { "working" },
        queue_line.len(),
        if queue_line.is_empty() {
            String::new()
        } else {
            format!(" [{}]", queue_line[0])
        },
        view.notice,
    );
    let status_line = clip(&status, w);
    let log_line = clip(&view.log_line, w);
    queue!(
        out,
        cursor::MoveTo(0, text_rows as u16 + 3),
        style::SetForegroundColor(Color::Cyan),
        style::Print(status_line),
        cursor::MoveTo(0, text_rows as u16 + 4),
        style::SetForegroundColor(Color::DarkGrey),
        style::Print(log_line),
        style::ResetColor
    )?;

    out.flush()?;
    Ok(())
}

/// Cut to a column budget without splitting a codepoint.
fn clip(s: &str, w: usize) -> String {
    s.chars().take(w).collect()
}

fn put_char(
    out: &mut std::io::Stdout,
    ch: char,
    colour: Option<Color>,
    at_cursor: bool,
) -> Result<()> {
    if at_cursor {
        queue!(out, style::SetAttribute(style::Attribute::Reverse))?;
    }
    match colour {
        Some(c) => queue!(out, style::SetForegroundColor(c))?,
        None => queue!(out, style::ResetColor)?,
    }
    let shown = if ch == '\n' { ' ' } else { ch };
    queue!(out, style::Print(shown))?;
    if at_cursor {
        queue!(out, style::SetAttribute(style::Attribute::Reset))?;
    }
    Ok(())
}
