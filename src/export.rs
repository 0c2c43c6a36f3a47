//! Export a session's chat log as CSV.
//!
//! Columns are `Question`, `Answer`, `Timestamp` (RFC 3339), one row per
//! turn in log order.

use anyhow::Result;
use std::io::Write;
use std::path::Path;

use crate::session::ChatTurn;

pub const EXPORT_FILE_NAME: &str = "chat_history.csv";

pub fn export_turns_csv<W: Write>(turns: &[ChatTurn], writer: W) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(["Question", "Answer", "Timestamp"])?;
    for turn in turns {
        csv.write_record([
            turn.question.as_str(),
            turn.answer.as_str(),
            turn.timestamp.to_rfc3339().as_str(),
        ])?;
    }
    csv.flush()?;
    Ok(())
}

pub fn export_turns_to_string(turns: &[ChatTurn]) -> Result<String> {
    let mut buf = Vec::new();
    export_turns_csv(turns, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

/// Writes the export to `path`, creating parent directories.
pub fn export_turns_to_file(turns: &[ChatTurn], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    export_turns_csv(turns, file)?;
    tracing::info!(rows = turns.len(), path = %path.display(), "chat history exported");
    Ok(())
}
