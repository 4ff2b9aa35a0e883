// Tails a single container's JSON log file
//
// Each line of the file is a Docker json-file entry:
//   {"log":"msg\n","stream":"stderr","time":"2017-03-21T21:28:22.0Z"}
// Lines are decoded into LogRecords and handed to the destination in file
// order. The byte offset of the last consumed line is persisted periodically
// so a restarted tailer resumes where the previous one stopped.

use crate::destination::{Destination, LogRecord, PRIORITY_STDERR, PRIORITY_STDOUT};
use crate::error::{Error, Result};
use crate::offset_store::OffsetStore;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Upper bound on bytes held in memory per read
const MAX_READ_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct TailerConfig {
    /// Pause between file size checks
    pub poll_interval: Duration,
    /// How often the current offset is written to the offset store
    pub persist_interval: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            persist_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Deserialize)]
struct JsonLogLine {
    log: String,
    stream: Stream,
    time: DateTime<Utc>,
}

fn parse_line(line: &[u8], source_id: &str) -> serde_json::Result<LogRecord> {
    let entry: JsonLogLine = serde_json::from_slice(line)?;

    let mut content = entry.log;
    if content.ends_with('\n') {
        content.pop();
        if content.ends_with('\r') {
            content.pop();
        }
    }

    Ok(LogRecord {
        content,
        timestamp: entry.time,
        source_id: source_id.to_string(),
        priority: match entry.stream {
            Stream::Stderr => PRIORITY_STDERR,
            Stream::Stdout => PRIORITY_STDOUT,
        },
    })
}

/// Read position and everything needed to advance it
struct TailState {
    path: PathBuf,
    source_id: String,
    destination: Arc<dyn Destination>,
    offset: u64,
    offset_store: Option<OffsetStore>,
    persisted: Option<u64>,
}

impl TailState {
    async fn poll(&mut self) -> Result<()> {
        let size = match fs::metadata(&self.path).await {
            Ok(m) => m.len(),
            // Removed under us; the watcher decides what happens next
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        // Truncation or copytruncate rotation
        if size < self.offset {
            info!(
                path = %self.path.display(),
                offset = self.offset,
                size,
                "File truncated, resetting position"
            );
            self.offset = 0;
        }

        if size == self.offset {
            return Ok(());
        }

        // Drain the backlog in chunks; a poll ends at a partial line or EOF
        let mut file = File::open(&self.path).await?;
        while self.offset < size {
            let to_read = (size - self.offset).min(MAX_READ_BYTES);
            file.seek(SeekFrom::Start(self.offset)).await?;
            let mut buf = Vec::with_capacity(to_read as usize);
            (&mut file).take(to_read).read_to_end(&mut buf).await?;
            if buf.is_empty() {
                break;
            }

            let complete = match buf.iter().rposition(|&b| b == b'\n') {
                Some(pos) => pos + 1,
                // A single line bigger than the read window can never complete
                None if buf.len() as u64 == MAX_READ_BYTES => buf.len(),
                // Partial trailing line, wait for the writer to finish it
                None => break,
            };

            for line in buf[..complete].split_inclusive(|&b| b == b'\n') {
                self.offset += line.len() as u64;

                let line = line.strip_suffix(b"\n").unwrap_or(line);
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }

                let record = match parse_line(line, &self.source_id) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(
                            path = %self.path.display(),
                            error = %e,
                            "Dropping malformed log line"
                        );
                        continue;
                    }
                };

                if let Err(e) = self.destination.send(record).await {
                    warn!(source_id = %self.source_id, error = %e, "Failed to ship log record");
                }
            }
        }

        Ok(())
    }

    async fn persist(&mut self) {
        let Some(store) = &self.offset_store else {
            return;
        };
        if self.persisted == Some(self.offset) {
            return;
        }

        match store.save(self.offset).await {
            Ok(()) => self.persisted = Some(self.offset),
            // Retried on the next tick
            Err(e) => error!(
                path = %store.path().display(),
                offset = self.offset,
                error = %e,
                "Failed to persist offset"
            ),
        }
    }
}

/// Flips the liveness flag when the task ends, however it ends
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Tailer {
    path: PathBuf,
    source_id: String,
    destination: Arc<dyn Destination>,
    offset_store: Option<OffsetStore>,
    config: TailerConfig,
    state: Option<TailState>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    alive: Arc<AtomicBool>,
}

impl Tailer {
    pub fn new(
        destination: Arc<dyn Destination>,
        path: impl Into<PathBuf>,
        source_id: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(Error::FileNotFound(path));
        }

        Ok(Self {
            path,
            source_id: source_id.into(),
            destination,
            offset_store: None,
            config: TailerConfig::default(),
            state: None,
            cancel: CancellationToken::new(),
            handle: None,
            alive: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_offset_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.offset_store = Some(OffsetStore::new(path));
        self
    }

    pub fn with_config(mut self, config: TailerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve the starting offset: resume from the offset store if it has
    /// a value, otherwise read the file from the beginning.
    pub async fn start(&mut self) -> Result<()> {
        let stored = match &self.offset_store {
            Some(store) => store.load().await?,
            None => None,
        };
        let offset = stored.unwrap_or(0);

        debug!(
            path = %self.path.display(),
            source_id = %self.source_id,
            offset,
            "Tailer starting"
        );

        self.state = Some(TailState {
            path: self.path.clone(),
            source_id: self.source_id.clone(),
            destination: self.destination.clone(),
            offset,
            offset_store: self.offset_store.clone(),
            persisted: stored,
        });
        Ok(())
    }

    /// Spawn the background poll loop. Must follow a successful start().
    pub fn run(&mut self) {
        let Some(state) = self.state.take() else {
            warn!(path = %self.path.display(), "Tailer run without start, ignoring");
            return;
        };

        self.alive.store(true, Ordering::SeqCst);
        let guard = AliveGuard(self.alive.clone());
        let cancel = self.cancel.clone();
        let config = self.config;

        self.handle = Some(tokio::spawn(async move {
            let _guard = guard;
            tail_loop(state, config, cancel).await;
        }));
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(path = %self.path.display(), "Tailer task panicked");
            } else {
                debug!(path = %self.path.display(), "Tailer task was aborted");
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Kill the task without going through stop(), as a crash would
    #[cfg(test)]
    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

async fn tail_loop(mut state: TailState, config: TailerConfig, cancel: CancellationToken) {
    let mut poll = time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut persist = time::interval_at(
        Instant::now() + config.persist_interval,
        config.persist_interval,
    );
    persist.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = persist.tick() => state.persist().await,

            _ = poll.tick() => {
                if let Err(e) = state.poll().await {
                    warn!(path = %state.path.display(), error = %e, "Error reading log file");
                }
            }
        }
    }

    state.persist().await;
    debug!(path = %state.path.display(), offset = state.offset, "Tailer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::testing::ChannelDestination;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};
    use tokio::sync::mpsc::UnboundedReceiver;

    const LOG_ENTRIES: &str = r#"
{"log":"msg1\n","stream":"stderr","time":"2017-03-21T21:28:22.0Z"}
{"log":"msg2\n","stream":"stdout","time":"2017-03-21T21:28:32.0Z"}
{"log":"msg3\n","stream":"stderr","time":"2017-03-21T21:28:42.0Z"}
"#;

    const SINGLE_ENTRY: &str = r#"
{"log":"msg-single\n","stream":"stderr","time":"2017-03-21T21:28:52.0Z"}
"#;

    fn record(content: &str, time: &str, priority: u8) -> LogRecord {
        LogRecord {
            content: content.to_string(),
            timestamp: time.parse().unwrap(),
            source_id: "cont1".to_string(),
            priority,
        }
    }

    fn expected_entries() -> Vec<LogRecord> {
        vec![
            record("msg1", "2017-03-21T21:28:22Z", 27),
            record("msg2", "2017-03-21T21:28:32Z", 30),
            record("msg3", "2017-03-21T21:28:42Z", 27),
        ]
    }

    fn single_record() -> LogRecord {
        record("msg-single", "2017-03-21T21:28:52Z", 27)
    }

    fn fast_config() -> TailerConfig {
        TailerConfig {
            poll_interval: Duration::from_millis(10),
            persist_interval: Duration::from_millis(10),
        }
    }

    fn temp_log(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    async fn recv(rx: &mut UnboundedReceiver<LogRecord>) -> LogRecord {
        time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout waiting for record")
            .expect("channel closed")
    }

    async fn stop_wait(tailer: &mut Tailer) {
        tailer.stop();
        time::timeout(Duration::from_secs(5), tailer.wait())
            .await
            .expect("timeout waiting for tailer to stop");
    }

    fn state_for(path: &Path, destination: Arc<dyn Destination>) -> TailState {
        TailState {
            path: path.to_path_buf(),
            source_id: "cont1".to_string(),
            destination,
            offset: 0,
            offset_store: None,
            persisted: None,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<LogRecord>) -> Vec<LogRecord> {
        let mut records = Vec::new();
        while let Ok(record) = rx.try_recv() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_parse_line_priorities() {
        let stderr = parse_line(
            br#"{"log":"oops\n","stream":"stderr","time":"2017-03-21T21:28:22.123456789Z"}"#,
            "c",
        )
        .unwrap();
        assert_eq!(stderr.priority, 27);
        assert_eq!(stderr.content, "oops");
        assert_eq!(stderr.timestamp.timestamp_subsec_nanos(), 123456789);

        let stdout =
            parse_line(br#"{"log":"ok","stream":"stdout","time":"2017-03-21T21:28:22Z"}"#, "c")
                .unwrap();
        assert_eq!(stdout.priority, 30);
        assert_eq!(stdout.content, "ok");
    }

    #[test]
    fn test_parse_line_rejects_unknown_stream() {
        let result = parse_line(
            br#"{"log":"x\n","stream":"stdin","time":"2017-03-21T21:28:22Z"}"#,
            "c",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file() {
        let (dest, _rx) = ChannelDestination::new();
        let result = Tailer::new(Arc::new(dest), "/tmp/does_not_exist_12345.log", "cont1");
        assert!(matches!(result, Err(Error::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_tailer_emits_existing_lines() {
        let file = temp_log(LOG_ENTRIES);
        let (dest, mut rx) = ChannelDestination::new();

        let mut tailer = Tailer::new(Arc::new(dest), file.path(), "cont1")
            .unwrap()
            .with_config(fast_config());
        tailer.start().await.unwrap();
        tailer.run();

        for expected in expected_entries() {
            assert_eq!(recv(&mut rx).await, expected);
        }
        assert!(tailer.is_alive());

        stop_wait(&mut tailer).await;
        assert!(!tailer.is_alive());
    }

    #[tokio::test]
    async fn test_tailer_picks_up_appended_lines() {
        let mut file = temp_log(LOG_ENTRIES);
        let (dest, mut rx) = ChannelDestination::new();

        let mut tailer = Tailer::new(Arc::new(dest), file.path(), "cont1")
            .unwrap()
            .with_config(fast_config());
        tailer.start().await.unwrap();
        tailer.run();

        for expected in expected_entries() {
            assert_eq!(recv(&mut rx).await, expected);
        }

        file.write_all(SINGLE_ENTRY.as_bytes()).unwrap();
        file.flush().unwrap();
        assert_eq!(recv(&mut rx).await, single_record());

        stop_wait(&mut tailer).await;
    }

    #[tokio::test]
    async fn test_truncate_with_identical_rewrite_emits_once() {
        let file = temp_log(LOG_ENTRIES);
        let (dest, mut rx) = ChannelDestination::new();
        let mut state = state_for(file.path(), Arc::new(dest));

        state.poll().await.unwrap();
        assert_eq!(drain(&mut rx), expected_entries());

        // Shorter content: truncation, read from the start
        std::fs::write(file.path(), SINGLE_ENTRY).unwrap();
        state.poll().await.unwrap();
        assert_eq!(drain(&mut rx), vec![single_record()]);
        assert_eq!(state.offset, SINGLE_ENTRY.len() as u64);

        // Same content, same length, same offset: nothing new to read
        for _ in 0..100 {
            std::fs::write(file.path(), SINGLE_ENTRY).unwrap();
            state.poll().await.unwrap();
        }
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_backlog_drained_in_one_poll() {
        let line = r#"{"log":"backlog line\n","stream":"stdout","time":"2017-03-21T21:28:22Z"}"#;
        let count = (MAX_READ_BYTES as usize / line.len()) * 3;
        let mut content = String::with_capacity(count * (line.len() + 1));
        for _ in 0..count {
            content.push_str(line);
            content.push('\n');
        }

        let file = temp_log(&content);
        let (dest, mut rx) = ChannelDestination::new();
        let mut state = state_for(file.path(), Arc::new(dest));

        state.poll().await.unwrap();
        assert_eq!(drain(&mut rx).len(), count);
        assert_eq!(state.offset, content.len() as u64);
    }

    #[tokio::test]
    async fn test_partial_line_is_held() {
        let full = r#"{"log":"late\n","stream":"stdout","time":"2017-03-21T21:28:22Z"}"#;
        let (head, tail) = full.split_at(20);

        let mut file = temp_log(head);
        let (dest, mut rx) = ChannelDestination::new();
        let mut state = state_for(file.path(), Arc::new(dest));

        state.poll().await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(state.offset, 0);

        writeln!(file, "{}", tail).unwrap();
        file.flush().unwrap();
        state.poll().await.unwrap();

        let records = drain(&mut rx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "late");
        assert_eq!(state.offset, full.len() as u64 + 1);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_dropped() {
        let content = concat!(
            "{\"log\":\"before\\n\",\"stream\":\"stdout\",\"time\":\"2017-03-21T21:28:22Z\"}\n",
            "this is not json\n",
            "{\"log\":\"x\\n\",\"stream\":\"stdin\",\"time\":\"2017-03-21T21:28:22Z\"}\n",
            "{\"log\":\"x\\n\",\"stream\":\"stdout\",\"time\":\"yesterday\"}\n",
            "{\"log\":\"after\\n\",\"stream\":\"stderr\",\"time\":\"2017-03-21T21:28:23Z\"}\n",
        );
        let file = temp_log(content);
        let (dest, mut rx) = ChannelDestination::new();
        let mut state = state_for(file.path(), Arc::new(dest));

        state.poll().await.unwrap();

        let contents: Vec<String> = drain(&mut rx).into_iter().map(|r| r.content).collect();
        assert_eq!(contents, vec!["before", "after"]);
        assert_eq!(state.offset, content.len() as u64);
    }

    #[tokio::test]
    async fn test_restart_does_not_repeat_lines() {
        let mut file = temp_log(LOG_ENTRIES);
        let pos_dir = TempDir::new().unwrap();
        let pos_file = pos_dir.path().join("cont1");
        let (dest, mut rx) = ChannelDestination::new();
        let dest: Arc<dyn Destination> = Arc::new(dest);

        let mut tailer = Tailer::new(dest.clone(), file.path(), "cont1")
            .unwrap()
            .with_offset_store(&pos_file)
            .with_config(fast_config());
        tailer.start().await.unwrap();
        tailer.run();
        for expected in expected_entries() {
            assert_eq!(recv(&mut rx).await, expected);
        }
        stop_wait(&mut tailer).await;

        let persisted = std::fs::read_to_string(&pos_file).unwrap();
        assert_eq!(persisted, LOG_ENTRIES.len().to_string());

        file.write_all(SINGLE_ENTRY.as_bytes()).unwrap();
        file.flush().unwrap();

        let mut tailer = Tailer::new(dest, file.path(), "cont1")
            .unwrap()
            .with_offset_store(&pos_file)
            .with_config(fast_config());
        tailer.start().await.unwrap();
        tailer.run();

        assert_eq!(recv(&mut rx).await, single_record());
        time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        stop_wait(&mut tailer).await;
    }

    #[tokio::test]
    async fn test_offset_persisted_while_running() {
        let file = temp_log(LOG_ENTRIES);
        let pos_dir = TempDir::new().unwrap();
        let pos_file = pos_dir.path().join("cont1");
        let (dest, mut rx) = ChannelDestination::new();

        let mut tailer = Tailer::new(Arc::new(dest), file.path(), "cont1")
            .unwrap()
            .with_offset_store(&pos_file)
            .with_config(fast_config());
        tailer.start().await.unwrap();
        tailer.run();
        for _ in 0..3 {
            recv(&mut rx).await;
        }

        let expected = LOG_ENTRIES.len().to_string();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if std::fs::read_to_string(&pos_file).ok().as_deref() == Some(expected.as_str()) {
                break;
            }
            assert!(Instant::now() < deadline, "timeout waiting for pos file");
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(tailer.is_alive());

        stop_wait(&mut tailer).await;
    }

    #[tokio::test]
    async fn test_failed_persist_is_retried() {
        let file = temp_log(LOG_ENTRIES);
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("pos");
        std::fs::create_dir(&store_dir).unwrap();
        let pos_file = store_dir.join("cont1");
        let (dest, mut rx) = ChannelDestination::new();

        let mut tailer = Tailer::new(Arc::new(dest), file.path(), "cont1")
            .unwrap()
            .with_offset_store(&pos_file)
            .with_config(fast_config());
        tailer.start().await.unwrap();

        // A regular file where the store directory should be makes every save fail
        std::fs::remove_dir(&store_dir).unwrap();
        std::fs::write(&store_dir, "").unwrap();

        tailer.run();
        for _ in 0..3 {
            recv(&mut rx).await;
        }
        time::sleep(Duration::from_millis(50)).await;
        assert!(tailer.is_alive());
        assert!(!pos_file.exists());

        std::fs::remove_file(&store_dir).unwrap();
        std::fs::create_dir(&store_dir).unwrap();

        let expected = LOG_ENTRIES.len().to_string();
        let deadline = Instant::now() + Duration::from_secs(5);
        while std::fs::read_to_string(&pos_file).ok().as_deref() != Some(expected.as_str()) {
            assert!(Instant::now() < deadline, "timeout waiting for pos file");
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(tailer.is_alive());

        stop_wait(&mut tailer).await;
    }

    #[tokio::test]
    async fn test_alive_turns_false_when_task_dies() {
        let file = temp_log(LOG_ENTRIES);
        let (dest, _rx) = ChannelDestination::new();

        let mut tailer = Tailer::new(Arc::new(dest), file.path(), "cont1")
            .unwrap()
            .with_config(fast_config());
        assert!(!tailer.is_alive());
        tailer.start().await.unwrap();
        tailer.run();
        assert!(tailer.is_alive());

        tailer.abort();
        let deadline = Instant::now() + Duration::from_secs(5);
        while tailer.is_alive() {
            assert!(Instant::now() < deadline, "timeout waiting for not alive");
            time::sleep(Duration::from_millis(10)).await;
        }

        // stop/wait on a dead task must be harmless
        stop_wait(&mut tailer).await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let file = temp_log(LOG_ENTRIES);
        let (dest, _rx) = ChannelDestination::new();

        let mut tailer = Tailer::new(Arc::new(dest), file.path(), "cont1")
            .unwrap()
            .with_config(fast_config());
        tailer.start().await.unwrap();
        tailer.run();

        tailer.stop();
        tailer.stop();
        tailer.wait().await;
        tailer.stop();
        tailer.wait().await;
        assert!(!tailer.is_alive());
    }
}
