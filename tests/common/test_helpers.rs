use sessionkeeper::testing::FakeEnsemble;
use sessionkeeper::{Framework, FrameworkBuilder, RetryPolicy};
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

/// In-memory log sink for asserting on emitted `tracing` output.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.contents().lines().filter(|l| l.contains(needle)).map(str::to_string).collect()
    }
}

pub struct LogGuard(Arc<Mutex<Vec<u8>>>);

impl Write for LogGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogGuard;

    fn make_writer(&'a self) -> Self::Writer {
        LogGuard(self.0.clone())
    }
}

/// Install a thread-local subscriber writing into a fresh buffer.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(buffer.clone()))
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .without_time()
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}

/// Wraps a policy and counts the retries it approved.
#[derive(Debug)]
pub struct CountingPolicy<P> {
    inner: P,
    allowed: AtomicU32,
    asked: AtomicU32,
}

impl<P: RetryPolicy> CountingPolicy<P> {
    pub fn new(inner: P) -> Self {
        Self { inner, allowed: AtomicU32::new(0), asked: AtomicU32::new(0) }
    }

    pub fn allowed(&self) -> u32 {
        self.allowed.load(Ordering::SeqCst)
    }

    pub fn asked(&self) -> u32 {
        self.asked.load(Ordering::SeqCst)
    }
}

impl<P: RetryPolicy> RetryPolicy for CountingPolicy<P> {
    fn retry_delay(&self, retry_count: u32, elapsed: Duration) -> Option<Duration> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        let delay = self.inner.retry_delay(retry_count, elapsed);
        if delay.is_some() {
            self.allowed.fetch_add(1, Ordering::SeqCst);
        }
        delay
    }
}

/// Framework builder wired to `ensemble` with short timeouts.
pub fn framework_builder(ensemble: &FakeEnsemble, policy: Arc<dyn RetryPolicy>) -> FrameworkBuilder {
    Framework::builder()
        .connect_string("zk1:2181,zk2:2181")
        .session_factory(Arc::new(ensemble.clone()))
        .retry_policy_arc(policy)
        .session_timeout(Duration::from_secs(6))
        .connection_timeout(Duration::from_secs(3))
}

/// Poll `condition` every 10ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Shared, lockable list for recording callback arguments.
pub fn recorder<T>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}
