// Buffer Lifecycle Manager: tracks the playback buffer and demuxer instances
// and runs the recreate protocol when the track layout changes mid-stream.

use tracing::{debug, info, warn};

use crate::collaborators::{BufferFactory, Demuxer, DemuxerFactory, MediaElement, PlaybackBuffer};
use crate::events::{EventBus, TrackType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    /// A layout mismatch was seen; waiting for the viewer to stall.
    PendingRecreate,
    /// The old buffer is tearing down.
    Recreating,
}

/// Tracks announced by the demuxer since the last (re)build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaInfo {
    pub has_video: bool,
    pub has_audio: bool,
}

impl MediaInfo {
    pub fn record(&mut self, track: TrackType) {
        match track {
            TrackType::Video => self.has_video = true,
            TrackType::Audio => self.has_audio = true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackCheck {
    Consistent,
    /// First mismatch: a rebuild is now pending.
    Mismatch { active: usize, demuxed: usize },
    /// A rebuild is already underway.
    Deferred,
}

pub struct BufferLifecycle {
    state: LifecycleState,
    buffer: Box<dyn PlaybackBuffer>,
    demuxer: Box<dyn Demuxer>,
    buffer_factory: Box<dyn BufferFactory>,
    demuxer_factory: Box<dyn DemuxerFactory>,
    bus: EventBus,
    media_info: MediaInfo,
    /// Seek target applied on the first append after a (re)build.
    initial_seek: Option<f64>,
    appended_since_build: bool,
    rebuilds: u64,
}

impl BufferLifecycle {
    /// Build the first buffer and demuxer and attach the viewer.
    pub fn new(
        buffer_factory: Box<dyn BufferFactory>,
        demuxer_factory: Box<dyn DemuxerFactory>,
        bus: EventBus,
        media: &mut dyn MediaElement,
    ) -> Self {
        let buffer = buffer_factory.create(&bus);
        let demuxer = demuxer_factory.create(&bus);
        media.attach(buffer.source_handle());
        Self {
            state: LifecycleState::Active,
            buffer,
            demuxer,
            buffer_factory,
            demuxer_factory,
            bus,
            media_info: MediaInfo::default(),
            initial_seek: None,
            appended_since_build: false,
            rebuilds: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }

    pub fn buffer_mut(&mut self) -> &mut dyn PlaybackBuffer {
        self.buffer.as_mut()
    }

    pub fn demuxer_mut(&mut self) -> &mut dyn Demuxer {
        self.demuxer.as_mut()
    }

    pub fn media_info(&self) -> MediaInfo {
        self.media_info
    }

    pub fn record_track(&mut self, track: TrackType) {
        self.media_info.record(track);
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Compare a demuxed layout with what the buffer was set up for.
    ///
    /// A buffer with no active tracks accepts any layout.
    pub fn check_tracks(&mut self, video_tracks: usize, audio_tracks: usize) -> TrackCheck {
        if self.state != LifecycleState::Active {
            return TrackCheck::Deferred;
        }
        let active = self.buffer.active_track_count();
        let demuxed = video_tracks + audio_tracks;
        if active == 0 || active == demuxed {
            return TrackCheck::Consistent;
        }
        warn!(active, demuxed, "Track layout changed, buffer recreate pending");
        self.state = LifecycleState::PendingRecreate;
        TrackCheck::Mismatch { active, demuxed }
    }

    /// Remember where to put the playhead once the first fragment since the
    /// last build is appended.
    pub fn note_fragment_start(&mut self, start: f64) {
        if !self.appended_since_build && self.initial_seek.is_none() {
            self.initial_seek = Some(start);
        }
    }

    /// Forward a media segment to the buffer.
    pub fn append(&mut self, media: &mut dyn MediaElement, payload: bytes::Bytes) {
        self.buffer.append(payload);
        if !self.appended_since_build {
            self.appended_since_build = true;
            if let Some(start) = self.initial_seek.take() {
                debug!(position = start, "Positioning playhead at first fragment");
                media.set_current_time(start);
            }
        }
    }

    /// The viewer stalled. Tears the buffer down if a recreate is pending and
    /// no demux is in progress. Returns whether teardown started.
    pub fn on_stall(&mut self, demux_in_flight: bool) -> bool {
        if self.state != LifecycleState::PendingRecreate || demux_in_flight {
            return false;
        }
        info!("Recreating playback buffer");
        self.state = LifecycleState::Recreating;
        self.buffer.destroy();
        true
    }

    /// The old buffer is gone: build fresh instances and re-attach.
    /// Returns `false` when no recreate was in progress.
    pub fn on_destroyed(&mut self, media: &mut dyn MediaElement) -> bool {
        if self.state != LifecycleState::Recreating {
            return false;
        }
        self.demuxer.destroy();
        self.demuxer = self.demuxer_factory.create(&self.bus);
        self.buffer = self.buffer_factory.create(&self.bus);
        self.media_info = MediaInfo::default();
        self.initial_seek = None;
        self.appended_since_build = false;
        media.attach(self.buffer.source_handle());
        self.state = LifecycleState::Active;
        self.rebuilds += 1;
        info!(rebuilds = self.rebuilds, "Playback buffer recreated");
        true
    }

    pub fn end_of_stream(&mut self) {
        self.buffer.end_of_stream();
    }

    /// Release the demuxer and buffer for good.
    pub fn shutdown(&mut self) {
        self.demuxer.destroy();
        if self.state != LifecycleState::Recreating {
            self.buffer.destroy();
        }
    }
}
