use crate::common::error::Result;
use crate::storage::clog::entry::LogEntry;

/// Consumer of log entries during recovery.
///
/// `replay` is invoked once per entry in LSN order; an error aborts the
/// replay and is returned to the caller. `on_done` runs once after the last
/// entry has been applied.
pub trait LogReplayer {
    fn replay(&self, entry: &LogEntry) -> Result<()>;

    fn on_done(&self) -> Result<()> {
        Ok(())
    }
}
