use clap::Parser;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use dirmon::{
    cli::{Cli, OutputFormat},
    create_monitor, enumerate_files, ChangeEvent, ChannelSink, FileRecord, MonitorController,
    MonitorEvent,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(err) = cli.validate() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }

    cli.setup_logging();
    let config = cli.resolve_config()?;
    let watch_path = cli.get_watch_path();

    if cli.snapshot {
        print_snapshot(&enumerate_files(&watch_path), &cli);
        return Ok(());
    }

    let (sink, rx) = ChannelSink::new();
    let monitor = create_monitor(&config.watcher, Arc::new(sink));
    tracing::info!("Starting dirmon on {} ({})", watch_path.display(), monitor.backend_name());

    monitor.set_directory_path(&watch_path);
    let mut controller = MonitorController::new(Arc::clone(&monitor))
        .with_stop_timeout(config.controller.stop_timeout());
    controller.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    if cli.output == OutputFormat::Text {
        println!("Watching: {}", watch_path.display());
        println!("Press Ctrl+C to quit");
        println!("---");
    }

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(MonitorEvent::Change(event)) => print_event(&event, &cli),
            Ok(MonitorEvent::Snapshot(files)) => print_snapshot(&files, &cli),
            Err(RecvTimeoutError::Timeout) => {
                if !controller.is_running() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !controller.stop(controller.stop_timeout()) {
        tracing::warn!("Watch thread still busy on exit");
    }

    let last_error = monitor.last_error();
    if !last_error.is_empty() {
        eprintln!("Error: {}", last_error);
        std::process::exit(1);
    }

    Ok(())
}

fn print_event(event: &ChangeEvent, cli: &Cli) {
    match cli.output {
        OutputFormat::Json => {
            let line = serde_json::json!({
                "timestamp": chrono::Local::now().to_rfc3339(),
                "event": event,
            });
            println!("{}", line);
        }
        OutputFormat::Compact => {
            let tag = match event {
                ChangeEvent::Added(_) => "A",
                ChangeEvent::Removed(_) => "D",
                ChangeEvent::Modified(_) => "M",
                ChangeEvent::RenamedFrom(_) => "R<",
                ChangeEvent::RenamedTo(_) => "R>",
            };
            println!("{} {}", tag, event.name().display());
        }
        OutputFormat::Text => {
            let time_str = chrono::Local::now().format("%H:%M:%S");
            if cli.no_color {
                println!("[{}] {} {}", time_str, event.label(), event.name().display());
            } else {
                let color = match event {
                    ChangeEvent::Added(_) => "\x1b[32m",    // Green
                    ChangeEvent::Modified(_) => "\x1b[33m", // Yellow
                    ChangeEvent::Removed(_) => "\x1b[31m",  // Red
                    ChangeEvent::RenamedFrom(_) | ChangeEvent::RenamedTo(_) => "\x1b[34m", // Blue
                };
                println!("[{}] {}{}\x1b[0m {}", time_str, color, event.label(), event.name().display());
            }
        }
    }
}

fn print_snapshot(files: &[FileRecord], cli: &Cli) {
    match cli.output {
        OutputFormat::Json => {
            let line = serde_json::json!({
                "timestamp": chrono::Local::now().to_rfc3339(),
                "snapshot": files,
            });
            println!("{}", line);
        }
        OutputFormat::Compact => {
            for file in files {
                println!("= {}", file.relative_path.display());
            }
        }
        OutputFormat::Text => {
            println!("{} files", files.len());
            for file in files {
                let modified: chrono::DateTime<chrono::Local> = file.modified.into();
                println!(
                    "  {}  {:>10}  {}",
                    modified.format("%Y-%m-%d %H:%M:%S"),
                    file.size,
                    file.relative_path.display()
                );
            }
        }
    }
}
