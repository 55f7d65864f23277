//! PID file handling and process liveness probes.
//!
//! The PID file is the only state the daemon persists: its process id
//! as ASCII decimal, written at startup and removed on clean shutdown.

use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

/// Write the current process id.
pub fn write(path: &Path) -> io::Result<()> {
    fs::write(path, std::process::id().to_string())?;
    debug!(path = %path.display(), pid = std::process::id(), "Wrote PID file");
    Ok(())
}

/// Read a recorded PID, if the file exists and parses.
pub fn read(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Best-effort removal.
pub fn remove(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Whether a process with this PID exists (signal 0 probe).
pub fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}
