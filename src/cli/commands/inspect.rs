//! Inspect command - prints persisted connection event history.

use crate::cli::args::{InspectAction, InspectArgs, JournalInspectArgs};
use crate::storage::journal::ConnectionJournal;
use anyhow::{bail, Context, Result};
use std::fs;

pub fn run_inspect(args: InspectArgs) -> Result<()> {
    match args.action {
        InspectAction::Journal(args) => inspect_journal(&args),
    }
}

fn inspect_journal(args: &JournalInspectArgs) -> Result<()> {
    if !args.data_dir.exists() {
        bail!("data dir {} does not exist", args.data_dir.display());
    }
    let mut found = false;
    for entry in fs::read_dir(&args.data_dir)
        .with_context(|| format!("read {}", args.data_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("conn_") {
            continue;
        }
        // A compacted journal may hold the connection only in its snapshot,
        // so the recovered state is folded from both.
        let history = ConnectionJournal::read_history(&entry.path())?;
        let state = history.state();
        let Some(connection) = &state.connection else {
            continue;
        };
        if let Some(filter) = &args.connection {
            if &connection.id != filter {
                continue;
            }
        }
        found = true;
        if args.json {
            if let Some(snapshot) = &history.snapshot {
                println!("{}", serde_json::to_string(snapshot)?);
            }
            for event in &history.events {
                println!("{}", serde_json::to_string(event)?);
            }
        } else {
            println!(
                "connection {} ({}, {:?}, lifecycle {:?})",
                connection.id, connection.connection_type, connection.status, connection.lifecycle
            );
            if let Some(snapshot) = &history.snapshot {
                println!("  snapshot through #{}", snapshot.last_seq);
            }
            for event in &history.events {
                println!(
                    "  #{:>6}  {}  {}",
                    event.seq,
                    event.timestamp.to_rfc3339(),
                    event.payload.label()
                );
            }
        }
    }
    if !found {
        match &args.connection {
            Some(id) => bail!("no journal found for connection '{id}'"),
            None => println!("no connection journals in {}", args.data_dir.display()),
        }
    }
    Ok(())
}
