// dbvault/src/backup/drain.rs
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::entities::TaskId;

/// Lines kept verbatim for error messages.
const KEPT_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

#[derive(Debug, Default, Clone)]
pub struct DrainReport {
    pub lines: usize,
    pub first_lines: Vec<String>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.lines == 0
    }

    pub fn summary(&self) -> String {
        let mut summary = self.first_lines.join("\n");
        if self.lines > self.first_lines.len() {
            summary.push_str(&format!(
                "\n... {} more line(s)",
                self.lines - self.first_lines.len()
            ));
        }
        summary
    }
}

/// Reads `reader` to EOF, logging every line.
pub async fn drain<R>(
    reader: R,
    tool: &'static str,
    channel: Channel,
    task_id: TaskId,
) -> io::Result<DrainReport>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut report = DrainReport::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
        match channel {
            Channel::Stdout => debug!(task_id, tool, "{}", line),
            Channel::Stderr => error!(task_id, tool, "stderr: {}", line),
        }
        if report.first_lines.len() < KEPT_LINES {
            report.first_lines.push(line);
        }
        report.lines += 1;
    }
    Ok(report)
}

/// Runs [`drain`] on its own task.
///
/// Child pipes have bounded buffers; each one must be consumed concurrently
/// with the others or the child blocks on a full pipe.
pub fn spawn_drain<R>(
    reader: R,
    tool: &'static str,
    channel: Channel,
    task_id: TaskId,
) -> JoinHandle<io::Result<DrainReport>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(drain(reader, tool, channel, task_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_counts_lines_and_keeps_a_prefix() -> anyhow::Result<()> {
        let text: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let report = spawn_drain(std::io::Cursor::new(text.into_bytes()), "psql", Channel::Stderr, 1)
            .await??;
        assert_eq!(report.lines, 30);
        assert_eq!(report.first_lines.len(), KEPT_LINES);
        assert!(report.summary().ends_with("... 10 more line(s)"));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_channel_reports_nothing() -> anyhow::Result<()> {
        let report = spawn_drain(tokio::io::empty(), "pg_dump", Channel::Stderr, 1).await??;
        assert!(report.is_empty());
        Ok(())
    }
}
