//! Per-batch context passed through every stage: resolved device,
//! cooperative cancellation, configuration and the outward event sink.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::Level;

use crate::{
    config::PipelineConfig,
    core::splitter::{BatchSummary, FileOutcome},
    model::ModelLoader,
    types::{Device, DevicePreference},
};

/// Cooperative stop flag. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub enum PipelineEvent {
    Log {
        level: Level,
        message: String,
    },
    Progress {
        file_index: usize,
        file_count: usize,
        /// Progress within the current file, never decreasing.
        file_fraction: f32,
        overall: f32,
    },
    FileFinished {
        path: PathBuf,
        outcome: FileOutcome,
    },
    BatchFinished(BatchSummary),
}

pub type EventCallback = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

pub struct Session {
    device: Device,
    cancel: CancellationToken,
    config: PipelineConfig,
    events: Option<EventCallback>,
}

impl Session {
    pub fn new(device: Device, config: PipelineConfig) -> Self {
        Self {
            device,
            cancel: CancellationToken::new(),
            config,
            events: None,
        }
    }

    /// Resolves the device once for the whole batch. A GPU request without a
    /// usable GPU falls back to CPU.
    pub fn resolve(
        preference: DevicePreference,
        loader: &dyn ModelLoader,
        config: PipelineConfig,
        events: Option<EventCallback>,
    ) -> Self {
        let mut session = Self::new(Device::Cpu, config);
        session.events = events;
        session.device = match preference {
            DevicePreference::Gpu if loader.gpu_available() => {
                session.info("[*] GPU: acceleration enabled");
                Device::Gpu
            }
            DevicePreference::Gpu => {
                session.warn("[*] GPU: not available, falling back to CPU");
                Device::Cpu
            }
            DevicePreference::Cpu => {
                session.info("[*] CPU: using CPU for processing");
                Device::Cpu
            }
        };
        session
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_events(mut self, events: EventCallback) -> Self {
        self.events = Some(events);
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(cb) = &self.events {
            cb(&event);
        }
    }

    pub fn log(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "{message}");
        self.emit(PipelineEvent::Log { level, message });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message);
    }
}

/// Tracks one file's progress and keeps the reported fraction monotonic.
pub struct FileProgress<'a> {
    session: &'a Session,
    index: usize,
    count: usize,
    fraction: f32,
}

impl<'a> FileProgress<'a> {
    pub fn start(session: &'a Session, index: usize, count: usize) -> Self {
        let progress = Self {
            session,
            index,
            count: count.max(1),
            fraction: 0.0,
        };
        progress.report();
        progress
    }

    pub fn advance(&mut self, fraction: f32) {
        let next = fraction.clamp(0.0, 1.0);
        if next > self.fraction {
            self.fraction = next;
            self.report();
        }
    }

    fn report(&self) {
        self.session.emit(PipelineEvent::Progress {
            file_index: self.index,
            file_count: self.count,
            file_fraction: self.fraction,
            overall: (self.index as f32 + self.fraction) / self.count as f32,
        });
    }
}
