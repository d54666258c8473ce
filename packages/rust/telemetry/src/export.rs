//! JSON-lines export of phase events for external log shipping.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use phasewatch_shared::{PhasewatchError, Result};
use tracing::info;

use crate::event::PhaseEvent;

/// Write one flat JSON record per event.
pub fn write_jsonl<W: Write>(events: &[PhaseEvent], mut writer: W) -> std::io::Result<()> {
    for event in events {
        serde_json::to_writer(&mut writer, &event.to_record())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()
}

/// Write `events` to `path` as JSON lines, replacing any existing file.
pub fn export_jsonl(events: &[PhaseEvent], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PhasewatchError::io(parent, e))?;
    }
    let file = File::create(path).map_err(|e| PhasewatchError::io(path, e))?;
    write_jsonl(events, BufWriter::new(file)).map_err(|e| PhasewatchError::io(path, e))?;
    info!(path = %path.display(), count = events.len(), "exported phase events");
    Ok(())
}
