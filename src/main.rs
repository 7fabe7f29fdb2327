mod ui;

use clap::{error::ErrorKind, CommandFactory, Parser};
use crossterm::{
    event::{self, DisableFocusChange, EnableFocusChange, Event, KeyCode, KeyEvent, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    tty::IsTty,
};
use rand::Rng;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    Terminal,
};
use std::{
    error::Error,
    io::{self, stdin},
    path::PathBuf,
    sync::mpsc,
    thread,
    time::Duration,
};

use invigil::{
    app_dirs::AppDirs,
    clock::SystemClock,
    config::{ConfigStore, FileConfigStore},
    guard::{GuardError, PresentationSurface, ProctorEventKind},
    judge::{CodeExecutionClient, ExecutionResult, StaticJudge},
    report::{self, SessionReport},
    session::{SessionEvent, SessionPhase, SessionStateMachine},
    store::SqliteStore,
    submit::{Receipt, ScriptedClient},
};

const TICK_RATE_MS: u64 = 1000;

/// terminal harness for the assessment session controller
#[derive(Parser, Debug, Clone)]
#[clap(
    version,
    about,
    long_about = "Drives a timed, proctored assessment session end to end: gate wait, instructions, deadline-based exam timer, violation tracking, and submission with retries. Sessions persist; rerunning with the same id resumes."
)]
pub struct Cli {
    /// session identifier; reusing an id resumes its persisted deadlines
    #[clap(short = 'i', long, default_value = "demo")]
    session_id: String,

    /// exam duration in seconds (defaults to the config file)
    #[clap(short = 's', long)]
    exam_secs: Option<u64>,

    /// minimum wait before the exam can start, in seconds (defaults to the config file)
    #[clap(short = 'd', long)]
    dwell_secs: Option<u64>,

    /// proctoring violations tolerated before forced submission
    #[clap(short = 't', long)]
    violation_threshold: Option<u32>,

    /// abort instead of degrading when the presentation mode is unavailable
    #[clap(long)]
    require_presentation: bool,

    /// simulate this many transient submission failures before success
    #[clap(long, default_value_t = 0)]
    flaky_submits: u32,

    /// session database path (defaults to the platform state directory)
    #[clap(long)]
    db: Option<PathBuf>,
}

/// Maps the terminal to the enforced presentation mode: the alternate
/// screen is the mode itself, so entry always succeeds, and focus loss is
/// the one signal the platform reports. Simulated signals (the x/t keys)
/// arrive through the same channel.
struct TerminalSurface {
    rx: mpsc::Receiver<ProctorEventKind>,
}

impl PresentationSurface for TerminalSurface {
    fn enter(&mut self) -> Result<(), GuardError> {
        Ok(())
    }

    fn leave(&mut self) {}

    fn poll(&mut self) -> Vec<ProctorEventKind> {
        self.rx.try_iter().collect()
    }
}

type HarnessMachine =
    SessionStateMachine<SqliteStore, SystemClock, TerminalSurface, ScriptedClient>;

pub struct App {
    machine: HarnessMachine,
    judge: StaticJudge,
    last_exec: Option<ExecutionResult>,
    proctor_tx: mpsc::Sender<ProctorEventKind>,
    pass_mark_percent: f64,
}

/// Render-ready view of the session, rebuilt every draw.
pub struct Snapshot {
    pub session_id: String,
    pub phase: SessionPhase,
    pub dwell_remaining: chrono::Duration,
    pub remaining: chrono::Duration,
    pub violations: u32,
    pub end_confirm_pending: bool,
    pub degraded: bool,
    pub answers: usize,
    pub receipt: Option<Receipt>,
    pub error: Option<String>,
    pub pass_mark_percent: f64,
    pub last_exec: Option<ExecutionResult>,
}

impl App {
    fn snapshot(&self) -> Snapshot {
        let machine = &self.machine;
        Snapshot {
            session_id: machine.session_id().to_string(),
            phase: machine.phase(),
            dwell_remaining: machine.dwell_remaining(),
            remaining: machine.remaining(),
            violations: machine.violation_count(),
            end_confirm_pending: machine.end_confirm_pending(),
            degraded: machine.degraded(),
            answers: machine.draft().len(),
            receipt: machine.receipt().cloned(),
            error: machine.error().map(|e| e.to_string()),
            pass_mark_percent: self.pass_mark_percent,
            last_exec: self.last_exec.clone(),
        }
    }

    /// Coding-question feedback only; never touches the session phase.
    fn run_sample(&mut self) {
        if self.machine.phase() != SessionPhase::InProgress {
            return;
        }
        self.last_exec = self.judge.run("print(2 + 2)", "python", "").ok();
    }
}

fn sample_judge() -> StaticJudge {
    StaticJudge::new().with_response(
        "python",
        ExecutionResult {
            stdout: "4\n".into(),
            stderr: String::new(),
            exit_code: 0,
            runtime_ms: 12,
        },
    )
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if !stdin().is_tty() {
        let mut cmd = Cli::command();
        cmd.error(ErrorKind::Io, "stdin must be a tty").exit();
    }

    let mut config = FileConfigStore::new().load();
    if let Some(secs) = cli.exam_secs {
        config.exam_secs = secs;
    }
    if let Some(secs) = cli.dwell_secs {
        config.gate_dwell_secs = secs;
    }
    if let Some(threshold) = cli.violation_threshold {
        config.violation_threshold = threshold;
    }
    if cli.require_presentation {
        config.require_presentation = true;
    }

    let store = match &cli.db {
        Some(path) => SqliteStore::open(path)?,
        None => SqliteStore::new()?,
    };

    let (proctor_tx, proctor_rx) = mpsc::channel();
    let surface = TerminalSurface { rx: proctor_rx };
    let client = ScriptedClient::flaky(cli.flaky_submits)
        .with_score(rand::thread_rng().gen_range(35.0..=98.0));

    let pass_mark_percent = config.pass_mark_percent;
    let machine = SessionStateMachine::new(
        cli.session_id.clone(),
        config,
        store,
        SystemClock,
        surface,
        client,
    )?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableFocusChange)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App {
        machine,
        judge: sample_judge(),
        last_exec: None,
        proctor_tx,
        pass_mark_percent,
    };
    let result = run_session(&mut terminal, &mut app);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), DisableFocusChange, LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result?;

    finalize(&app);
    Ok(())
}

fn run_session<B: Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
) -> Result<(), Box<dyn Error>> {
    let events = get_harness_events(app.proctor_tx.clone());
    terminal.draw(|f| ui::render(f, &app.snapshot()))?;

    loop {
        match events.recv()? {
            HarnessEvent::Tick => {
                app.machine.dispatch(SessionEvent::Tick);
            }
            HarnessEvent::Resize => {}
            HarnessEvent::Key(key) => {
                if key.modifiers.contains(KeyModifiers::CONTROL)
                    && key.code == KeyCode::Char('c')
                {
                    break;
                }
                match key.code {
                    // Leaving mid-session is allowed; persisted deadlines
                    // mean the same id resumes with no extra time.
                    KeyCode::Esc => break,
                    KeyCode::Char('s') => {
                        app.machine.dispatch(SessionEvent::StartRequested);
                    }
                    KeyCode::Char('e') => {
                        app.machine.dispatch(SessionEvent::EndRequested);
                    }
                    KeyCode::Char('y') => {
                        app.machine.dispatch(SessionEvent::EndConfirmed);
                    }
                    KeyCode::Char('n') => {
                        app.machine.dispatch(SessionEvent::EndCancelled);
                    }
                    KeyCode::Char('r') => {
                        // Returning to the enforced mode doubles as the
                        // candidate acknowledging the warning on screen.
                        app.machine.dispatch(SessionEvent::ReacquireRequested);
                        app.machine.acknowledge_violations();
                    }
                    KeyCode::Char('x') => {
                        let _ = app.proctor_tx.send(ProctorEventKind::FullscreenExit);
                    }
                    KeyCode::Char('t') => {
                        let _ = app.proctor_tx.send(ProctorEventKind::TabHidden);
                    }
                    KeyCode::Char('j') => app.run_sample(),
                    KeyCode::Char(c @ '1'..='9') => {
                        app.machine.dispatch(SessionEvent::AnswerChanged {
                            question_id: format!("q{c}"),
                            payload: serde_json::json!({ "choice": c.to_string() }),
                        });
                    }
                    _ => {}
                }
            }
        }
        terminal.draw(|f| ui::render(f, &app.snapshot()))?;
    }

    Ok(())
}

#[derive(Clone)]
enum HarnessEvent {
    Key(KeyEvent),
    Resize,
    Tick,
}

fn get_harness_events(proctor_tx: mpsc::Sender<ProctorEventKind>) -> mpsc::Receiver<HarnessEvent> {
    let (tx, rx) = mpsc::channel();

    let tick_tx = tx.clone();
    thread::spawn(move || loop {
        if tick_tx.send(HarnessEvent::Tick).is_err() {
            break;
        }
        thread::sleep(Duration::from_millis(TICK_RATE_MS))
    });

    thread::spawn(move || loop {
        let evt = match event::read() {
            Ok(Event::Key(key)) => Some(HarnessEvent::Key(key)),
            Ok(Event::Resize(_, _)) => Some(HarnessEvent::Resize),
            Ok(Event::FocusLost) => {
                let _ = proctor_tx.send(ProctorEventKind::WindowBlur);
                None
            }
            Ok(_) => None,
            Err(_) => break,
        };

        if let Some(evt) = evt {
            if tx.send(evt).is_err() {
                break;
            }
        }
    });

    rx
}

fn finalize(app: &App) {
    let machine = &app.machine;
    if !machine.phase().is_terminal() {
        println!(
            "session {} left open; rerun with the same --session-id to resume",
            machine.session_id()
        );
        return;
    }

    let events = machine.proctoring_log();
    if let Some(dir) = AppDirs::report_dir() {
        let session_report = SessionReport {
            session_id: machine.session_id(),
            phase: machine.phase(),
            receipt: machine.receipt(),
            pass_mark_percent: app.pass_mark_percent,
            events: &events,
        };
        let _ = report::append_session_audit(&dir, &session_report);
        let _ = report::write_event_log(&dir, machine.session_id(), &events);
    }

    match machine.phase() {
        SessionPhase::Finished => {
            if let Some(receipt) = machine.receipt() {
                match receipt.score_percent {
                    Some(score) => println!(
                        "submitted: receipt {}, score {score:.1}%",
                        receipt.submission_id
                    ),
                    None => println!("submitted: receipt {}", receipt.submission_id),
                }
            }
            for (kind, count) in report::violation_summary(&events) {
                println!("  {count}x {kind}");
            }
        }
        SessionPhase::Aborted => {
            if let Some(error) = machine.error() {
                eprintln!("session aborted: {error}");
            }
        }
        _ => {}
    }
}
