//! Typed event bus.
//!
//! Collaborators report completions by publishing a [`PipelineEvent`] on the
//! inbound channel; the controller is the only consumer. Player-facing
//! notifications go out as [`PlayerEvent`]s on a broadcast channel so any
//! number of observers can subscribe.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use crate::error::{DecryptionError, LoadError, PlaybackError};

/// The three loaders the controller drives, each allowed one request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderKind {
    Playlist,
    Segment,
    Key,
}

impl LoaderKind {
    pub const ALL: [LoaderKind; 3] = [LoaderKind::Playlist, LoaderKind::Segment, LoaderKind::Key];
}

impl fmt::Display for LoaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Playlist => "playlist",
            Self::Segment => "segment",
            Self::Key => "key",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    Video,
    Audio,
}

/// Details of a rescheduled fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryInfo {
    pub url: String,
    /// 1-based attempt number of the upcoming retry.
    pub attempt: u32,
    /// Failures still tolerated after this one.
    pub remaining: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub enum LoaderEvent {
    FetchComplete {
        loader: LoaderKind,
        url: String,
        data: Bytes,
    },
    FetchError {
        loader: LoaderKind,
        url: String,
        error: LoadError,
    },
    /// A loader that retries internally reports an attempt.
    FetchRetry { loader: LoaderKind, info: RetryInfo },
}

#[derive(Debug, Clone)]
pub enum CipherEvent {
    Decrypted { sequence: u64, data: Bytes },
    DecryptError { sequence: u64, error: DecryptionError },
}

#[derive(Debug, Clone)]
pub enum DemuxEvent {
    MetadataParsed(TrackType),
    DemuxComplete {
        video_tracks: usize,
        audio_tracks: usize,
    },
    /// `fatal` is `None` when the demuxer did not say; it is then treated as fatal.
    DemuxError {
        module: String,
        error: String,
        fatal: Option<bool>,
    },
    SeiParsed(Bytes),
}

#[derive(Debug, Clone)]
pub enum RemuxEvent {
    InitSegment(Bytes),
    MediaSegment(Bytes),
    RemuxError {
        module: String,
        error: String,
        fatal: Option<bool>,
    },
}

#[derive(Debug, Clone)]
pub enum BufferEvent {
    /// An append finished.
    SourceUpdateEnd,
    /// `fatal` is `None` when the sink did not say; it is then treated as non-fatal.
    BufferError {
        tag: String,
        error: String,
        fatal: Option<bool>,
    },
    /// The previous playback buffer finished tearing down.
    Destroyed,
}

/// Signals from the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEvent {
    /// Playback stalled for lack of data.
    Waiting,
    Playing,
}

/// Everything the controller reacts to, grouped by producer.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Loader(LoaderEvent),
    Cipher(CipherEvent),
    Demux(DemuxEvent),
    Remux(RemuxEvent),
    Buffer(BufferEvent),
    Media(MediaEvent),
}

impl From<LoaderEvent> for PipelineEvent {
    fn from(e: LoaderEvent) -> Self {
        Self::Loader(e)
    }
}

impl From<CipherEvent> for PipelineEvent {
    fn from(e: CipherEvent) -> Self {
        Self::Cipher(e)
    }
}

impl From<DemuxEvent> for PipelineEvent {
    fn from(e: DemuxEvent) -> Self {
        Self::Demux(e)
    }
}

impl From<RemuxEvent> for PipelineEvent {
    fn from(e: RemuxEvent) -> Self {
        Self::Remux(e)
    }
}

impl From<BufferEvent> for PipelineEvent {
    fn from(e: BufferEvent) -> Self {
        Self::Buffer(e)
    }
}

impl From<MediaEvent> for PipelineEvent {
    fn from(e: MediaEvent) -> Self {
        Self::Media(e)
    }
}

/// Notifications for the embedding player.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Error(PlaybackError),
    Retry {
        loader: LoaderKind,
        info: RetryInfo,
    },
    SeiParsed(Bytes),
    PlaylistRefreshed {
        media_sequence: u64,
        target_duration: Option<f64>,
        new_segments: usize,
    },
    /// A retry budget ran out.
    RetryTimeExceeded,
    EndOfStream,
    RebuildScheduled {
        active_tracks: usize,
        demuxed_tracks: usize,
    },
    RebuildComplete {
        resume_at: f64,
    },
}

/// Handle shared by the controller and every collaborator.
///
/// `publish()` is a sync call and never blocks. Once the controller is torn
/// down the inbound side is closed and published events are dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<PipelineEvent>,
    player_tx: broadcast::Sender<PlayerEvent>,
}

/// Inbound side of the bus, owned by the driver.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<PipelineEvent>,
}

impl EventBus {
    /// Create a bus whose player channel holds `player_capacity` events per subscriber.
    pub fn new(player_capacity: usize) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (player_tx, _) = broadcast::channel(player_capacity.max(1));
        (Self { tx, player_tx }, EventReceiver { rx })
    }

    /// Publish a collaborator event to the controller.
    pub fn publish<E: Into<PipelineEvent>>(&self, event: E) {
        let _ = self.tx.send(event.into());
    }

    /// Notify player subscribers. Dropped silently when nobody listens.
    pub fn emit(&self, event: PlayerEvent) {
        let _ = self.player_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.player_tx.subscribe()
    }
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PipelineEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting events; anything published afterwards is discarded.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
