//! Bounded per-service capture of child output.

use crate::config::ServiceId;
use crate::events::{Event, EventBus};
use crate::models::{LogLine, LogSource};
use crate::process::decode_line;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct LogBuffer {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
        }
    }

    fn push(&self, line: LogLine) {
        let Ok(mut lines) = self.lines.lock() else {
            return;
        };
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Up to `n` most recent lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let Ok(lines) = self.lines.lock() else {
            return Vec::new();
        };
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a service's output goes: its buffer and the event bus.
#[derive(Debug, Clone)]
pub struct LogSink {
    service_id: ServiceId,
    buffer: Arc<LogBuffer>,
    bus: EventBus,
}

impl LogSink {
    pub fn new(service_id: ServiceId, buffer: Arc<LogBuffer>, bus: EventBus) -> Self {
        Self {
            service_id,
            buffer,
            bus,
        }
    }

    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    pub fn push(&self, source: LogSource, text: impl Into<String>) {
        let line = LogLine {
            at: Utc::now(),
            source,
            text: text.into(),
        };
        self.buffer.push(line.clone());
        self.bus.publish(Event::LogLine {
            service_id: self.service_id.clone(),
            line,
        });
    }

    /// Recent server output joined for an error message.
    pub fn output_tail(&self, n: usize) -> String {
        let lines: Vec<String> = self
            .buffer
            .tail(n * 4)
            .into_iter()
            .filter(|l| matches!(l.source, LogSource::Stdout | LogSource::Stderr))
            .map(|l| l.text)
            .collect();
        let skip = lines.len().saturating_sub(n);
        lines[skip..].join("\n")
    }

    /// Forward `reader` line by line until EOF. Each decoded line is also sent
    /// to `tap` when one is given; a closed tap is ignored.
    pub fn forward<R>(
        &self,
        reader: R,
        source: LogSource,
        tap: Option<mpsc::UnboundedSender<String>>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            let mut reader = tokio::io::BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = decode_line(&buf);
                        if let Some(tap) = &tap {
                            let _ = tap.send(line.clone());
                        }
                        sink.push(source, line);
                    }
                    Err(e) => {
                        tracing::debug!(service_id = %sink.service_id, error = %e, "output reader closed");
                        break;
                    }
                }
            }
        })
    }
}
