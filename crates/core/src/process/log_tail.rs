//! Poll-based tailing of the engine's log file.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Tracks the read position in a growing file and splits new bytes into lines.
#[derive(Debug, Default)]
pub struct LineCursor {
    offset: u64,
    partial: String,
}

impl LineCursor {
    /// A cursor that skips the first `offset` bytes.
    pub fn starting_at(offset: u64) -> Self {
        Self {
            offset,
            partial: String::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// A file shorter than the cursor was truncated or replaced.
    pub fn observe_len(&mut self, len: u64) {
        if len < self.offset {
            self.offset = 0;
            self.partial.clear();
        }
    }

    /// Consume freshly read bytes, returning every completed line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.offset += bytes.len() as u64;
        self.partial.push_str(&String::from_utf8_lossy(bytes));

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Flush an unterminated trailing line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        let rest = rest.trim_end_matches('\r');
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// Forward lines appended to `path` into `sink` until `stop` fires.
///
/// Content already in the file when tailing starts is skipped. The file may
/// not exist yet. After `stop`, one final read drains whatever the engine
/// wrote last.
pub async fn tail_file(
    path: PathBuf,
    interval: Duration,
    sink: mpsc::UnboundedSender<String>,
    stop: CancellationToken,
) {
    let existing = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    let mut cursor = LineCursor::starting_at(existing);
    loop {
        let stopping = tokio::select! {
            _ = stop.cancelled() => true,
            _ = tokio::time::sleep(interval) => false,
        };

        if let Err(e) = read_new(&path, &mut cursor, &sink).await {
            tracing::trace!(path = %path.display(), error = %e, "Log file not readable yet");
        }

        if stopping || sink.is_closed() {
            break;
        }
    }
    if let Some(line) = cursor.finish() {
        let _ = sink.send(line);
    }
}

async fn read_new(
    path: &PathBuf,
    cursor: &mut LineCursor,
    sink: &mpsc::UnboundedSender<String>,
) -> std::io::Result<()> {
    let len = tokio::fs::metadata(path).await?.len();
    cursor.observe_len(len);
    if len == cursor.offset() {
        return Ok(());
    }

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(cursor.offset())).await?;
    let mut buf = Vec::with_capacity((len - cursor.offset()) as usize);
    file.take(len - cursor.offset()).read_to_end(&mut buf).await?;

    for line in cursor.push(&buf) {
        if sink.send(line).is_err() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[test]
    fn cursor_buffers_partial_lines() {
        let mut cursor = LineCursor::default();
        assert_eq!(cursor.push(b"frame 1\nfra"), vec!["frame 1"]);
        assert_eq!(cursor.push(b"me 2\r\n\n"), vec!["frame 2"]);
        assert_eq!(cursor.offset(), 19);
        assert_eq!(cursor.finish(), None);
    }

    #[test]
    fn shrinking_file_resets_cursor() {
        let mut cursor = LineCursor::default();
        cursor.push(b"one\ntwo\n");
        cursor.observe_len(3);
        assert_eq!(cursor.offset(), 0);
        assert_eq!(cursor.push(b"new\n"), vec!["new"]);
    }

    #[tokio::test]
    async fn tails_appended_lines_and_drains_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.log");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let task = tokio::spawn(tail_file(
            path.clone(),
            Duration::from_millis(10),
            tx,
            stop.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::fs::write(&path, "starting\n").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "starting");

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"frame 10/100\nlast").await.unwrap();
        file.flush().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "frame 10/100");

        stop.cancel();
        task.await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "last");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn earlier_content_is_not_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.log");
        tokio::fs::write(&path, "old run line
").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let task = tokio::spawn(tail_file(
            path.clone(),
            Duration::from_millis(10),
            tx,
            stop.clone(),
        ));
        // Let the tailer record the starting length before appending.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"new run line\n").await.unwrap();
        file.flush().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "new run line");

        stop.cancel();
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
