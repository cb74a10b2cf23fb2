use std::env;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use engine::HeadlessEngine;
use memory::{DefaultSystemMemory, MemoryPressureMonitor};
use optimizer::{MemoryOptimizer, MemorySettings};
use storage::JsonPreferences;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ui::{JsonLinesBridge, MemoryOptimizerPanel, UiMessage};

const DEFAULT_PREFS_PATH: &str = "lunetix-prefs.json";
const DEFAULT_URI: &str = "https://example.com";
const DEFAULT_TAB_MEMORY_MB: u64 = 150;
const TICK: Duration = Duration::from_millis(250);

type Panel = MemoryOptimizerPanel<JsonLinesBridge<io::Stdout>>;

fn main() {
    init_tracing();

    let prefs_path = env::var_os("LUNETIX_PREFS")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PREFS_PATH));
    let prefs = Rc::new(JsonPreferences::open_or_default(prefs_path));

    let engine = Rc::new(HeadlessEngine::new());
    let mut optimizer = MemoryOptimizer::new(
        Rc::clone(&engine),
        MemoryPressureMonitor::new(DefaultSystemMemory::new()),
        MemorySettings::new(prefs),
    );
    if let Some(interval) = sweep_interval_override() {
        optimizer = optimizer.with_sweep_interval(interval);
    }
    let optimizer = Rc::new(optimizer);

    let optimizer_for_events = Rc::downgrade(&optimizer);
    engine.subscribe(move |event| {
        if let Some(optimizer) = optimizer_for_events.upgrade() {
            optimizer.on_tab_event(*event);
        }
    });

    open_tabs(&engine);
    optimizer.start();
    info!(level = %optimizer.level(), tabs = optimizer.tab_count(), "lunetix ready");

    let panel = MemoryOptimizerPanel::new(Rc::clone(&optimizer), JsonLinesBridge::new(io::stdout()));
    panel.refresh();

    let commands = spawn_stdin_reader();
    run(&engine, &optimizer, &panel, &commands);
    optimizer.stop();
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stdout carries UI messages.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn sweep_interval_override() -> Option<Duration> {
    let raw = env::var("LUNETIX_SWEEP_SECS").ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            warn!(value = %raw, "ignoring invalid LUNETIX_SWEEP_SECS");
            None
        }
    }
}

/// Opens one tab per command-line URI and brings the first to the front.
fn open_tabs(engine: &HeadlessEngine) {
    let mut uris: Vec<String> = env::args().skip(1).collect();
    if uris.is_empty() {
        uris.push(DEFAULT_URI.to_string());
    }
    let tabs: Vec<_> = uris
        .iter()
        .map(|uri| engine.open_tab(uri, DEFAULT_TAB_MEMORY_MB))
        .collect();
    if let Some(first) = tabs.first() {
        engine.activate(*first);
    }
}

/// Forwards stdin lines to the main thread until input closes.
fn spawn_stdin_reader() -> Receiver<String> {
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if sender.send(line).is_err() {
                break;
            }
        }
    });
    receiver
}

fn run(engine: &HeadlessEngine, optimizer: &MemoryOptimizer, panel: &Panel, commands: &Receiver<String>) {
    loop {
        match commands.recv_timeout(TICK) {
            Ok(line) => handle_line(panel, &line),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                info!("input closed, shutting down");
                return;
            }
        }

        for (tab, result) in engine.complete_pending() {
            optimizer.on_transition_complete(tab, result);
        }
        if optimizer.poll() {
            panel.refresh();
        }
    }
}

fn handle_line(panel: &Panel, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let message: UiMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(err) => {
            warn!(%err, "ignoring malformed UI message");
            return;
        }
    };
    if let Err(err) = panel.handle(message) {
        warn!(%err, "UI message rejected");
    }
}
