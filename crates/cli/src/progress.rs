//! Cargo-style progress output for blocksync
//!
//! Displays pass results in the familiar cargo format:
//! ```text
//!    Uploaded 3 files (1.20 MiB)
//!  Downloaded 1 file (4 KiB, 2 blocks reused)
//!     Skipped notes.txt: changed during sync
//!      Synced 4 files in 312ms
//! ```

use std::io::Write as _;
use std::path::Path;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use blocksync_core::{FileOutcome, SyncReport};

/// Every spinner lives here so log lines can be printed around them
static MULTI: LazyLock<indicatif::MultiProgress> = LazyLock::new(indicatif::MultiProgress::new);

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const SYNCING: &str = "Syncing";
    const UPLOADED: &str = "Uploaded";
    const DOWNLOADED: &str = "Downloaded";
    const DELETED: &str = "Deleted";
    const ADOPTED: &str = "Adopted";
    const CONFLICTS: &str = "Overwritten";
    const SKIPPED: &str = "Skipped";
    const SYNCED: &str = "Synced";
    const UP_TO_DATE: &str = "Up to date";
}

/// Print a cargo-style status line
fn print_status(status: &str, message: &str, style: &console::Style) {
    MULTI.suspend(|| {
        let mut term = console::Term::stderr();
        let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
    });
}

fn plural(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("{n} {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

fn size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

fn elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

/// Status lines summarizing a pass, in display order
fn summary(report: &SyncReport) -> Vec<(&'static str, String)> {
    let mut lines = Vec::new();

    let uploaded = report.count(&FileOutcome::Uploaded);
    if uploaded > 0 {
        let mut detail = size(report.bytes_uploaded);
        if report.blocks_deduped > 0 {
            detail.push_str(&format!(
                ", {} already on server",
                plural(report.blocks_deduped as usize, "block")
            ));
        }
        lines.push((Status::UPLOADED, format!("{} ({detail})", plural(uploaded, "file"))));
    }

    let downloaded = report.count(&FileOutcome::Downloaded);
    if downloaded > 0 {
        let mut detail = size(report.bytes_downloaded);
        if report.blocks_reused > 0 {
            detail.push_str(&format!(
                ", {} reused",
                plural(report.blocks_reused as usize, "block")
            ));
        }
        lines.push((
            Status::DOWNLOADED,
            format!("{} ({detail})", plural(downloaded, "file")),
        ));
    }

    for (status, outcome) in [
        (Status::DELETED, FileOutcome::Deleted),
        (Status::ADOPTED, FileOutcome::Adopted),
    ] {
        let n = report.count(&outcome);
        if n > 0 {
            lines.push((status, plural(n, "file")));
        }
    }

    let conflicts = report.count(&FileOutcome::ConflictResolved);
    if conflicts > 0 {
        lines.push((
            Status::CONFLICTS,
            format!("{} with the server's version", plural(conflicts, "local change")),
        ));
    }

    for (name, reason) in report.skipped() {
        lines.push((Status::SKIPPED, format!("{name}: {reason}")));
    }
    lines
}

/// Progress display for sync passes
pub struct SyncProgress {
    start: Instant,
}

impl SyncProgress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Spinner shown while a pass runs
    pub fn spinner(&mut self, root: &Path) -> indicatif::ProgressBar {
        self.start = Instant::now();
        let pb = MULTI.add(indicatif::ProgressBar::new_spinner());
        if let Ok(style) =
            indicatif::ProgressStyle::default_spinner().template("{spinner:.green} {msg:>12} {prefix}")
        {
            pb.set_style(style);
        }
        pb.set_message(Status::SYNCING);
        pb.set_prefix(root.display().to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    /// Print the summary of a finished pass
    pub fn finish(&self, report: &SyncReport) {
        let green = console::Style::new().green().bold();
        let yellow = console::Style::new().yellow().bold();

        for (status, message) in summary(report) {
            let style = if status == Status::SKIPPED { &yellow } else { &green };
            print_status(status, &message, style);
        }

        let took = elapsed(self.start.elapsed());
        let changed = report.files.len() - report.skipped().count();
        if report.is_empty() {
            print_status(Status::UP_TO_DATE, &format!("checked in {took}"), &green);
        } else {
            print_status(
                Status::SYNCED,
                &format!("{} in {took}", plural(changed, "file")),
                &green,
            );
        }
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Log writer that keeps tracing output from tearing the spinner
#[derive(Clone, Copy, Default)]
pub struct ProgressWriter;

impl std::io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        MULTI.suspend(|| std::io::stderr().write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for ProgressWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}
