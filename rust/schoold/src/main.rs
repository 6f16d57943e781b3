mod backup;
mod clock;
mod config;
mod db;
mod ipc;
mod model;
mod resolver;
mod store;

use env_logger::{Builder, Env};
use std::io::{self, BufRead, Write};

fn init_logger() {
    // stdout carries IPC responses, so logs go to stderr only.
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    let cfg = match config::DaemonConfig::from_env() {
        Ok(v) => v,
        Err(e) => {
            log::error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
        clock: clock::DaemonClock::from_fixed(cfg.fixed_now),
    };
    if let Some(ts) = cfg.fixed_now {
        log::info!("clock pinned at {}", ts.to_rfc3339());
    }
    if let Some(path) = cfg.workspace {
        match db::open_db(&path) {
            Ok(conn) => {
                log::info!("workspace opened: {}", path.display());
                state.db = Some(conn);
                state.workspace = Some(path);
            }
            Err(e) => {
                log::error!("failed to open workspace {}: {:#}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("bad request line: {}", e);
                let resp = ipc::err("", "bad_json", e.to_string(), None);
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    log::info!("stdin closed, exiting");
}
