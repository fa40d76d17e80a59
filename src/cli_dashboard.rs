//! Terminal dashboard over the shared Postgres store.
//! Overview (worker nodes and active renders)
//! Queue (next queued tasks by priority)
//! Events (latest recorded events)

use std::{
  io,
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};
use sqlx::{Pool, Postgres};
use tokio::runtime::Runtime;
use tracing::warn;
use renderfarm::config::Config;
use renderfarm::database::{self, EventRow, TaskRow, WorkerRow};
use renderfarm::messaging::{RabbitWorkQueue, RemoteWorkQueue};
use renderfarm::models::TaskPriority;

const QUEUE_PREVIEW: i64 = 10;
const EVENT_PREVIEW: i64 = 20;

#[derive(Clone, Copy)]
enum DashboardTab {
  Overview,
  Queue,
  Events,
}

struct App {
  current_tab: DashboardTab,
  workers: Vec<WorkerRow>,
  active_tasks: Vec<TaskRow>,
  queued_tasks: Vec<TaskRow>,
  events: Vec<EventRow>,
  remote_depth: Option<u64>,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Overview,
      workers: vec![],
      active_tasks: vec![],
      queued_tasks: vec![],
      events: vec![],
      remote_depth: None,
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Queue,
      DashboardTab::Queue => DashboardTab::Events,
      DashboardTab::Events => DashboardTab::Overview,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Events,
      DashboardTab::Queue => DashboardTab::Overview,
      DashboardTab::Events => DashboardTab::Queue,
    }
  }

  fn replace_data(&mut self, fresh: App) {
    self.workers = fresh.workers;
    self.active_tasks = fresh.active_tasks;
    self.queued_tasks = fresh.queued_tasks;
    self.events = fresh.events;
    self.remote_depth = fresh.remote_depth;
  }
}

async fn fetch_db_state(pool: &Pool<Postgres>) -> Result<App> {
  let mut app = App::new();
  app.workers = database::list_workers(pool).await?;
  app.active_tasks = database::list_active_tasks(pool, EVENT_PREVIEW).await?;
  app.queued_tasks = database::list_queued_tasks(pool, QUEUE_PREVIEW).await?;
  app.events = database::list_recent_events(pool, EVENT_PREVIEW).await?;
  Ok(app)
}

fn priority_label(rank: i16) -> &'static str {
  TaskPriority::from_rank(rank).map(|p| p.as_str()).unwrap_or("?")
}

fn main() -> Result<()> {
  let config = Config::from_env()?;
  let database_url = config
    .database_url
    .clone()
    .ok_or_else(|| anyhow!("DATABASE_URL must be set for the dashboard"))?;

  let rt = Runtime::new()?;
  let db_pool = Arc::new(rt.block_on(database::setup_database(&database_url))?);
  let remote_queue = match &config.rabbitmq_url {
    Some(url) => Some(Arc::new(
      rt.block_on(RabbitWorkQueue::connect(url, &config.render_queue))
        .context("failed to connect to RabbitMQ")?,
    )),
    None => None,
  };

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let (tx, rx) = std::sync::mpsc::channel::<App>();
  {
    let db_pool = db_pool.clone();
    let remote_queue = remote_queue.clone();
    let handle = rt.handle().clone();
    thread::spawn(move || loop {
      let mut state = handle.block_on(fetch_db_state(&db_pool)).unwrap_or_else(|e| {
        warn!(error = %e, "dashboard refresh failed");
        App::new()
      });
      if let Some(queue) = &remote_queue {
        state.remote_depth = handle.block_on(queue.depth()).ok();
      }
      if tx.send(state).is_err() {
        break;
      }
      thread::sleep(Duration::from_secs(2));
    });
  }

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(fresh) = rx.try_recv() {
      app.replace_data(fresh);
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Overview", "Queue", "Events"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("Render Farm"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Overview => 0,
      DashboardTab::Queue => 1,
      DashboardTab::Events => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Overview => render_overview(f, app, chunks[1]),
    DashboardTab::Queue => render_queue(f, app, chunks[1]),
    DashboardTab::Events => render_events(f, app, chunks[1]),
  }

  let footer = Paragraph::new("←/→: Switch Tabs | q: Quit")
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn render_overview<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
    .split(area);

  let worker_items: Vec<ListItem> = app.workers.iter().map(|w| {
    let status_style = if w.status == "online" {
      Style::default().fg(Color::Green)
    } else {
      Style::default().fg(Color::Red)
    };
    let lines = vec![
      Spans::from(Span::styled(format!("ID: {} ({})", w.id, w.address), Style::default().add_modifier(Modifier::BOLD))),
      Spans::from(Span::styled(format!("Status: {}", w.status), status_style)),
      Spans::from(Span::raw(format!("Tasks: {}/{}", w.current_tasks, w.max_concurrent_tasks))),
      Spans::from(Span::raw(format!("Last heartbeat: {}", w.last_heartbeat.format("%Y-%m-%d %H:%M:%S")))),
    ];
    ListItem::new(lines)
  }).collect();

  let workers_list = List::new(worker_items)
    .block(Block::default().borders(Borders::ALL).title("Worker Nodes"))
    .highlight_style(Style::default().bg(Color::Blue));
  f.render_widget(workers_list, chunks[0]);

  let active: Vec<ListItem> = app.active_tasks.iter().map(|t| {
    ListItem::new(Spans::from(vec![Span::raw(format!(
      "{}: {} ({:.0}%)",
      t.worker_id.as_deref().unwrap_or("-"),
      t.id,
      t.progress * 100.0
    ))]))
  }).collect();
  let tasks_list = List::new(if active.is_empty() { vec![ListItem::new(Spans::from(Span::raw("No active renders")))] } else { active })
    .block(Block::default().borders(Borders::ALL).title("Active Renders"));
  f.render_widget(tasks_list, chunks[1]);
}

fn render_queue<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let task_items: Vec<ListItem> = app.queued_tasks.iter().map(|t| {
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{:<7} ", priority_label(t.priority)), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
      Span::raw(format!("{} | queued since {}", t.id, t.updated_at.format("%H:%M:%S"))),
    ]))
  }).collect();
  let depth = app
    .remote_depth
    .map(|d| d.to_string())
    .unwrap_or_else(|| "n/a".into());
  let header = format!("Next {} Queued Tasks (Remote queue depth: {})", QUEUE_PREVIEW, depth);
  let tasks_list = List::new(task_items)
    .block(Block::default().borders(Borders::ALL).title(header));
  f.render_widget(tasks_list, area);
}

fn render_events<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let event_items: Vec<ListItem> = app.events.iter().map(|e| {
    let subject = match (&e.task_id, &e.worker_id) {
      (Some(task), Some(worker)) => format!("task {} on {}", task, worker),
      (Some(task), None) => format!("task {}", task),
      (None, Some(worker)) => format!("worker {}", worker),
      (None, None) => String::new(),
    };
    ListItem::new(Spans::from(vec![
      Span::styled(e.created_at.format("%Y-%m-%d %H:%M:%S").to_string(), Style::default().fg(Color::Green)),
      Span::raw(" - "),
      Span::styled(e.kind.clone(), Style::default().add_modifier(Modifier::BOLD)),
      Span::raw(format!(" {}", subject)),
    ]))
  }).collect();
  let events_list = List::new(event_items)
    .block(Block::default().borders(Borders::ALL).title("Recent Events"));
  f.render_widget(events_list, area);
}
