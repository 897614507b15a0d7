//! Patch command - run a full patch attempt with progress bars.

use clap::Args;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use chunkpatch::config::ConfigFile;
use chunkpatch::{AggregateProgress, FailurePolicy, PatchEvent, PatchStage, PatchStats, Patcher};

use crate::commands::common::{build_backend, resolve_version_url};
use crate::error::CliError;

/// Arguments for `chunkpatch patch`.
#[derive(Debug, Args)]
pub struct PatchArgs {
    /// Version descriptor URL (overrides patch.version_url)
    #[arg(long)]
    pub url: Option<String>,

    /// Maximum simultaneous chunk downloads (overrides download.max_concurrent)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Cancel remaining downloads after the first failure
    #[arg(long)]
    pub fail_fast: bool,
}

/// Run the patch command.
pub async fn run(args: PatchArgs, config: &ConfigFile) -> Result<(), CliError> {
    let url = resolve_version_url(args.url, config)?;

    let mut patcher_config = config.to_patcher_config();
    if let Some(concurrency) = args.concurrency {
        patcher_config = patcher_config.with_max_concurrent_downloads(concurrency);
    }
    if args.fail_fast {
        patcher_config = patcher_config.with_failure_policy(FailurePolicy::FailFast);
    }

    let patcher = Patcher::new(patcher_config, build_backend(config)?);
    let mut events = patcher.subscribe();
    let mut progress = patcher.subscribe_progress();

    patcher.init(url).await?;
    let ticket = patcher.begin().await?;
    let attempt = ticket.attempt();

    let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    }) {
        warn!(error = %e, "Could not install Ctrl-C handler");
    }

    let display = ProgressDisplay::new();
    loop {
        tokio::select! {
            Some(()) = interrupt_rx.recv() => {
                display.interrupted();
                patcher.shutdown().await?;
                break;
            }
            received = events.recv() => match received {
                Some(event) if event.attempt() != attempt => continue,
                Some(PatchEvent::Completed { .. }) | None => break,
                Some(event) => display.handle(&event),
            },
            update = progress.recv() => match update {
                Ok(update) if update.attempt == attempt => display.progress(&update.progress),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress display fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    // Resolves to PatcherError::Cancelled after an interrupt.
    let succeeded = ticket.wait().await?;
    let status = patcher.status();
    display.progress(&status.progress);
    display.finish(succeeded);
    print_summary(&status);

    if succeeded {
        Ok(())
    } else {
        Err(CliError::PatchFailed {
            stage: status.stage,
            reason: status.last_error,
        })
    }
}

/// Stage line plus download and mount bars.
struct ProgressDisplay {
    multi: MultiProgress,
    stage: ProgressBar,
    download: ProgressBar,
    mount: ProgressBar,
}

impl ProgressDisplay {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let stage = multi.add(ProgressBar::new_spinner());
        stage.set_style(style_or_default(
            ProgressStyle::default_spinner().template("{spinner:.green} {msg}"),
        ));

        let download = multi.add(ProgressBar::new(0));
        download.set_style(style_or_default(
            ProgressStyle::default_bar()
                .template("  download [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})"),
        ));

        let mount = multi.add(ProgressBar::new(0));
        mount.set_style(style_or_default(
            ProgressStyle::default_bar().template("  mount    [{bar:40.cyan/blue}] {pos}/{len} chunks"),
        ));

        Self {
            multi,
            stage,
            download,
            mount,
        }
    }

    fn handle(&self, event: &PatchEvent) {
        match event {
            PatchEvent::StageChanged { stage, .. } => {
                self.stage.set_message(stage.to_string());
                self.stage.tick();
            }
            PatchEvent::ChunkFinished { progress, .. } if !progress.success => {
                let _ = self.multi.println(format!(
                    "  {} chunk {} failed",
                    style("✗").red(),
                    progress.chunk_id
                ));
            }
            PatchEvent::ChunkFinished { .. } | PatchEvent::Completed { .. } => {}
        }
    }

    fn progress(&self, progress: &AggregateProgress) {
        self.download.set_length(progress.total_bytes_to_download);
        self.download.set_position(progress.bytes_downloaded);
        self.mount.set_length(progress.total_chunks_to_mount as u64);
        self.mount.set_position(progress.chunks_mounted as u64);
    }

    fn interrupted(&self) {
        self.download.abandon();
        self.mount.abandon();
        self.stage.abandon_with_message("Interrupted, cancelling");
    }

    fn finish(&self, succeeded: bool) {
        self.download.finish();
        self.mount.finish();
        if succeeded {
            self.stage.finish_with_message(PatchStage::Complete.to_string());
        } else {
            self.stage.abandon();
        }
    }
}

fn style_or_default(
    style: Result<ProgressStyle, indicatif::style::TemplateError>,
) -> ProgressStyle {
    style
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn print_summary(status: &PatchStats) {
    println!();
    if let Some(build_id) = &status.build_id {
        println!("Build:      {}", build_id);
    }
    println!("Stage:      {}", status.stage);
    println!(
        "Downloaded: {}/{} chunks ({} of {} MB)",
        status.files_downloaded, status.total_files, status.mb_downloaded, status.mb_total
    );
    println!(
        "Mounted:    {}/{} chunks",
        status.progress.chunks_mounted, status.progress.total_chunks_to_mount
    );
    if let Some(error) = &status.last_error {
        println!("Error:      {}", style(error).red());
    }
}
