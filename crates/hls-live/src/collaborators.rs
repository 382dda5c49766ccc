//! Interfaces of the external collaborators the controller drives.
//!
//! Every call here is non-blocking: it starts work and returns. Completion is
//! reported later by publishing an event on the [`EventBus`].

use std::sync::Arc;

use bytes::Bytes;

use crate::error::DecryptionError;
use crate::events::{EventBus, LoaderKind, TrackType};
use crate::parser::{EncryptionMethod, PlaylistParser};
use crate::pipeline::Fragment;
use crate::scheduler::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub loader: LoaderKind,
    pub url: String,
}

/// Fetch transport. Reports `LoaderEvent::FetchComplete` or `FetchError`.
pub trait Loader: Send {
    fn load(&mut self, request: LoadRequest);
}

/// Decryption primitive bound to one key.
/// Reports `CipherEvent::Decrypted` or `DecryptError`.
pub trait Cipher: Send {
    fn decrypt(&mut self, sequence: u64, iv: [u8; 16], data: Bytes);
}

pub trait CipherFactory: Send {
    fn create(
        &self,
        method: &EncryptionMethod,
        key: &Bytes,
        bus: &EventBus,
    ) -> Result<Box<dyn Cipher>, DecryptionError>;
}

/// Transport-stream demuxer together with its track state.
/// Reports `DemuxEvent`s.
pub trait Demuxer: Send {
    fn demux(&mut self, fragment: &Fragment, end_of_list: bool);
    fn destroy(&mut self);
}

pub trait DemuxerFactory: Send {
    fn create(&self, bus: &EventBus) -> Box<dyn Demuxer>;
}

/// Container remuxer fed from the demuxer's tracks. Reports `RemuxEvent`s.
pub trait Remuxer: Send {
    fn remux_metadata(&mut self, track: TrackType);
    fn remux_media(&mut self);
    /// Drop per-stream state after the demuxer has been replaced.
    fn reset(&mut self);
}

/// Opaque handle a viewer attaches to in order to play a buffer's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHandle(pub String);

/// Platform playback buffer. Reports `BufferEvent`s.
pub trait PlaybackBuffer: Send {
    fn add_source_buffers(&mut self, init_segment: &Bytes);
    fn append(&mut self, media_segment: Bytes);
    fn active_track_count(&self) -> usize;
    fn end_of_stream(&mut self);
    /// Start tearing down. Completion is `BufferEvent::Destroyed`.
    fn destroy(&mut self);
    fn source_handle(&self) -> SourceHandle;
}

pub trait BufferFactory: Send {
    fn create(&self, bus: &EventBus) -> Box<dyn PlaybackBuffer>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

impl ReadyState {
    /// The viewer cannot advance with what it has.
    pub fn is_starving(self) -> bool {
        self <= ReadyState::HaveCurrentData
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, position: f64) -> bool {
        position >= self.start && position <= self.end
    }
}

/// The viewer presenting the playback buffer.
pub trait MediaElement: Send {
    fn current_time(&self) -> f64;
    fn set_current_time(&mut self, position: f64);
    fn buffered(&self) -> Vec<TimeRange>;
    fn ready_state(&self) -> ReadyState;
    /// Point the viewer at a (new) buffer output and reload.
    fn attach(&mut self, source: SourceHandle);
    /// `false` once the viewer is gone; the scheduling loop then stops.
    fn is_available(&self) -> bool {
        true
    }
}

/// Everything the controller depends on, built once by the embedder.
pub struct Collaborators {
    pub playlist_loader: Box<dyn Loader>,
    pub segment_loader: Box<dyn Loader>,
    pub key_loader: Box<dyn Loader>,
    pub parser: Box<dyn PlaylistParser>,
    pub cipher_factory: Box<dyn CipherFactory>,
    pub demuxer_factory: Box<dyn DemuxerFactory>,
    pub remuxer: Box<dyn Remuxer>,
    pub buffer_factory: Box<dyn BufferFactory>,
    pub media: Box<dyn MediaElement>,
    pub clock: Arc<dyn Clock>,
}
