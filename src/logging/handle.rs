use std::time::{Duration, Instant};

use tracing_appender::non_blocking::WorkerGuard;

/// Handle для управления lifecycle логирования.
///
/// Держит guard неблокирующего файлового writer'а: пока handle жив, записи
/// уходят в файл, при drop оставшийся буфер сбрасывается.
pub struct LoggingHandle {
    file_guard: Option<WorkerGuard>,
    /// Timeout для flush при shutdown (по умолчанию 5 секунд)
    flush_timeout: Duration,
}

impl LoggingHandle {
    pub fn new(file_guard: Option<WorkerGuard>) -> Self {
        Self {
            file_guard,
            flush_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_flush_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Включена ли запись в файл.
    pub fn has_file_writer(&self) -> bool {
        self.file_guard.is_some()
    }

    /// Сбрасывает файловый буфер и отпускает writer.
    pub fn shutdown(mut self) {
        let Some(guard) = self.file_guard.take() else {
            return;
        };

        tracing::debug!(
            timeout_ms = self.flush_timeout.as_millis() as u64,
            "Flushing file log writer"
        );
        let start = Instant::now();
        drop(guard);

        let elapsed = start.elapsed();
        if elapsed > self.flush_timeout {
            eprintln!(
                "WARNING: Logging shutdown took {}ms (timeout: {}ms)",
                elapsed.as_millis(),
                self.flush_timeout.as_millis()
            );
        }
    }
}

impl std::fmt::Debug for LoggingHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LoggingHandle")
            .field("file_writer", &self.has_file_writer())
            .field("flush_timeout", &self.flush_timeout)
            .finish()
    }
}
