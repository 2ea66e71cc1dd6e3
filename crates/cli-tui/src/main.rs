use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use daemon::{config::DaemonConfig, store::TaskStore, task::{Task, TaskStatus}};
use humansize::{format_size, DECIMAL};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::{Disks, System};

struct App {
    tasks: Vec<Task>,
    system: System,
    table_state: TableState,
    should_quit: bool,
    store: TaskStore,
    uploads_dir: PathBuf,
    processed_dir: PathBuf,
}

impl App {
    fn new(store: TaskStore, uploads_dir: PathBuf, processed_dir: PathBuf) -> Self {
        Self {
            tasks: Vec::new(),
            system: System::new(),
            table_state: TableState::default(),
            should_quit: false,
            store,
            uploads_dir,
            processed_dir,
        }
    }

    /// Fraction of the processed-dir disk that is already used (0-100)
    fn get_disk_usage(&self) -> f64 {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| self.processed_dir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());

        match disk {
            Some(d) if d.total_space() > 0 => {
                let used = d.total_space().saturating_sub(d.available_space());
                (used as f64 / d.total_space() as f64) * 100.0
            }
            _ => 0.0,
        }
    }

    fn refresh(&mut self) {
        // Refresh system info
        self.system.refresh_all();

        // Reload tasks from the queue file
        match self.store.snapshot() {
            Ok(mut tasks) => {
                // Sort by creation time (newest first)
                tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                self.tasks = tasks;
            }
            Err(_e) => {
                // Silently fail - the empty table makes the problem visible
                self.tasks = Vec::new();
            }
        }
    }

    fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    fn source_size(&self, task: &Task) -> Option<u64> {
        std::fs::metadata(self.uploads_dir.join(&task.filename))
            .ok()
            .map(|m| m.len())
    }
}

/// Transcoding queue TUI monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load config - if no config specified, try default location first (same as daemon)
    let default_config_path = PathBuf::from("/etc/vaultd/config.json");
    let config_path = if let Some(ref path) = args.config {
        Some(path.as_path())
    } else if default_config_path.exists() {
        Some(default_config_path.as_path())
    } else {
        None
    };

    let cfg = DaemonConfig::load_config(config_path)
        .context("Failed to load configuration")?;

    let store = TaskStore::open(&cfg.queue_file, cfg.max_retries)
        .with_context(|| format!("Failed to open queue file: {}", cfg.queue_file.display()))?;

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(store, cfg.uploads_dir.clone(), cfg.processed_dir.clone());

    // Main event loop
    loop {
        app.refresh();

        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => {
                        app.should_quit = true;
                    }
                    crossterm::event::KeyCode::Char('r') => {
                        app.refresh();
                    }
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let top_height = 3;
    let bottom_height = 3;
    let available_height = size.height.saturating_sub(top_height + bottom_height);

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(top_height),
            Constraint::Length(available_height),
            Constraint::Length(bottom_height),
        ])
        .split(size);

    render_top_bar(f, app, main_chunks[0]);
    render_task_table(f, app, main_chunks[1]);
    render_status_bar(f, app, main_chunks[2]);
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(33),
            Constraint::Percentage(34),
            Constraint::Percentage(33),
        ])
        .split(area);

    let cpu_raw = app.system.global_cpu_usage();
    let cpu_usage = if cpu_raw.is_nan() || cpu_raw.is_infinite() {
        0.0
    } else {
        cpu_raw.clamp(0.0, 100.0)
    };

    let total_memory = app.system.total_memory();
    let used_memory = app.system.used_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        ((used_memory as f64 / total_memory as f64) * 100.0).clamp(0.0, 100.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);

    let disk_usage = app.get_disk_usage().clamp(0.0, 100.0);
    let disk_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Disk (processed)"))
        .gauge_style(Style::default().fg(Color::Magenta))
        .percent(disk_usage as u16)
        .label(format!("{:.1}%", disk_usage));
    f.render_widget(disk_gauge, chunks[2]);
}

fn render_task_table(f: &mut Frame, app: &mut App, area: Rect) {
    if area.height < 3 {
        let error_msg = Paragraph::new("Not enough space")
            .block(Block::default().borders(Borders::ALL).title("Tasks"));
        f.render_widget(error_msg, area);
        return;
    }

    let max_data_rows = (area.height as usize).saturating_sub(3);

    let header = Row::new(vec!["ST", "FILE", "SIZE", "PRIO", "TRY", "TIME", "ERROR"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.tasks.is_empty() {
        vec![Row::new(vec![
            "No tasks".to_string(),
            "queue is empty".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
            "-".to_string(),
        ])
        .height(1)]
    } else {
        let num_rows = max_data_rows.min(20).min(app.tasks.len());
        app.tasks
            .iter()
            .take(num_rows)
            .map(|task| {
                let status_str = match task.status {
                    TaskStatus::Pending => "PEND",
                    TaskStatus::Processing => "RUN",
                    TaskStatus::Completed => "OK",
                    TaskStatus::Error => "FAIL",
                };

                let file_name = truncate_string(&task.filename, 50);

                let size = app
                    .source_size(task)
                    .map(|b| format_size(b, DECIMAL))
                    .unwrap_or_else(|| "-".to_string());

                let tries = format!("{}/{}", task.retries, task.max_retries);

                // Finished tasks show attempt duration, live ones their age
                let time = match (task.started_at, task.completed_at) {
                    (Some(started), Some(finished)) => {
                        format!("{}s", (finished - started).num_seconds())
                    }
                    _ => {
                        let age = Utc::now() - task.created_at;
                        format!("{}s ago", age.num_seconds())
                    }
                };

                let error = truncate_string(task.error_message.as_deref().unwrap_or("-"), 30);

                Row::new(vec![
                    status_str.to_string(),
                    file_name,
                    size,
                    task.priority.to_string(),
                    tries,
                    time,
                    error,
                ])
                .height(1)
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Percentage(38),
        Constraint::Length(10),
        Constraint::Length(5),
        Constraint::Length(5),
        Constraint::Length(9),
        Constraint::Percentage(26),
    ];

    let title = format!("Tasks ({})", app.tasks.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let total = app.tasks.len();
    let processing = app.count_by_status(TaskStatus::Processing);
    let pending = app.count_by_status(TaskStatus::Pending);
    let completed = app.count_by_status(TaskStatus::Completed);
    let failed = app.count_by_status(TaskStatus::Error);

    let dir_display = app.uploads_dir.display().to_string();
    let dir_short = truncate_string(&dir_display, 35);

    let status_text = format!(
        "Total: {} | Processing: {} | Pending: {} | Completed: {} | Error: {} | Uploads: {} | q=quit r=refresh",
        total, processing, pending, completed, failed, dir_short
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .style(Style::default())
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}
