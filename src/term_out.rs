use std::io::Write as _;
use std::sync::mpsc;
use std::time::Duration;

// A dedicated thread owns stderr: the progress line is redrawn in
// place, and log lines coming through the tracing bridge are printed
// above it so the two never interleave.

pub(crate) fn init(enable_progress: bool) -> Handle {
    let (sender, receiver) = mpsc::channel();

    let join_handle = std::thread::Builder::new()
        .name("status out".into())
        .spawn(move || thread_main(enable_progress, receiver))
        .expect("failed to spawn thread");

    Handle {
        join_handle,
        sender,
    }
}

const REDRAW_PERIOD: Duration = Duration::from_millis(50);

#[derive(Clone)]
struct Progress {
    verb: &'static str,
    rev: u32,
    final_rev: u32,
}

impl Progress {
    /// `Converting: 45% (450/1000)`, or just the revision when the
    /// stream's extent is unknown.
    fn render(&self) -> String {
        if self.final_rev > 0 {
            let pct = u64::from(self.rev) * 100 / u64::from(self.final_rev);
            format!("{}: {pct}% ({}/{})", self.verb, self.rev, self.final_rev)
        } else {
            format!("{}: {}", self.verb, self.rev)
        }
    }
}

enum Command {
    Update(Progress),
    FinishVerb(&'static str),
    PrintRawLine(Vec<u8>),
    Finish,
}

fn thread_main(enable_progress: bool, receiver: mpsc::Receiver<Command>) {
    let mut stderr = std::io::stderr();
    let mut shown: Option<Progress> = None;
    let mut pending: Option<Progress> = None;
    let mut last_draw = std::time::Instant::now()
        .checked_sub(REDRAW_PERIOD)
        .unwrap_or_else(std::time::Instant::now);

    loop {
        let cmd = if pending.is_some() {
            let wait = REDRAW_PERIOD.saturating_sub(last_draw.elapsed());
            if wait.is_zero() {
                Err(mpsc::RecvTimeoutError::Timeout)
            } else {
                receiver.recv_timeout(wait)
            }
        } else {
            receiver.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected)
        };

        match cmd {
            Ok(Command::Update(progress)) => {
                if enable_progress {
                    pending = Some(progress);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Some(progress) = pending.take() {
                    draw_line(&mut stderr, &progress.render());
                    shown = Some(progress);
                    last_draw = std::time::Instant::now();
                }
            }
            Ok(Command::FinishVerb(verb)) => {
                if enable_progress {
                    let line = match pending.take().or_else(|| shown.take()) {
                        Some(progress) => format!("{}, done.", progress.render()),
                        None => format!("{verb}: done."),
                    };
                    shown = None;
                    draw_line(&mut stderr, &line);
                    handle_err(stderr.write_all(b"\n"));
                    handle_err(stderr.flush());
                }
            }
            Ok(Command::PrintRawLine(line)) => {
                if shown.is_some() || pending.is_some() {
                    handle_err(crossterm::queue!(
                        stderr,
                        crossterm::terminal::Clear(crossterm::terminal::ClearType::CurrentLine),
                        crossterm::cursor::MoveToColumn(0),
                    ));
                }
                handle_err(stderr.write_all(&line));
                if let Some(ref progress) = shown {
                    let rendered = progress.render();
                    handle_err(crossterm::queue!(
                        stderr,
                        crossterm::style::Print(rendered),
                    ));
                }
                handle_err(stderr.flush());
            }
            Ok(Command::Finish) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if shown.is_some() {
                    handle_err(stderr.write_all(b"\n"));
                    handle_err(stderr.flush());
                }
                break;
            }
        }
    }
}

fn draw_line(stderr: &mut std::io::Stderr, line: &str) {
    handle_err(crossterm::queue!(
        stderr,
        crossterm::cursor::MoveToColumn(0),
        crossterm::style::Print(line),
        crossterm::terminal::Clear(crossterm::terminal::ClearType::UntilNewLine),
    ));
    handle_err(stderr.flush());
}

fn handle_err<T>(r: std::io::Result<T>) -> T {
    r.expect("stderr write failed")
}

pub(crate) struct Handle {
    join_handle: std::thread::JoinHandle<()>,
    sender: mpsc::Sender<Command>,
}

impl Handle {
    pub(crate) fn finish(self) {
        self.sender
            .send(Command::Finish)
            .expect("status out endpoint closed");
        self.join_handle.join().expect("status out thread panicked");
    }

    pub(crate) fn status_print(&self) -> StatusPrint {
        StatusPrint {
            sender: self.sender.clone(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct StatusPrint {
    sender: mpsc::Sender<Command>,
}

impl StatusPrint {
    pub(crate) fn update(&self, verb: &'static str, rev: u32, final_rev: u32) {
        self.sender
            .send(Command::Update(Progress {
                verb,
                rev,
                final_rev,
            }))
            .expect("status out endpoint closed");
    }

    /// Completes the current verb's progress line with `, done.`.
    pub(crate) fn finish_verb(&self, verb: &'static str) {
        self.sender
            .send(Command::FinishVerb(verb))
            .expect("status out endpoint closed");
    }

    pub(crate) fn print_raw_line(&self, line: Vec<u8>) {
        self.sender
            .send(Command::PrintRawLine(line))
            .expect("status out endpoint closed");
    }
}
