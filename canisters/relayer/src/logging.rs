use std::io;

use tracing::Level;

/// Forwards formatted log lines to the replica's debug log.
struct DebugPrintWriter;

impl io::Write for DebugPrintWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        let line = line.trim_end();
        if !line.is_empty() {
            ic_cdk::api::debug_print(line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Installs the global subscriber. Safe to call again after an upgrade.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_writer(|| DebugPrintWriter)
        .without_time()
        .with_ansi(false)
        .with_target(false)
        .try_init();
}
