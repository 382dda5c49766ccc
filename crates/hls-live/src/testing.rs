//! Recording collaborators and a harness for driving the controller by hand.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::collaborators::{
    BufferFactory, Cipher, CipherFactory, Collaborators, Demuxer, DemuxerFactory, LoadRequest,
    Loader, MediaElement, PlaybackBuffer, ReadyState, Remuxer, SourceHandle, TimeRange,
};
use crate::config::LiveConfig;
use crate::controller::LiveController;
use crate::error::{DecryptionError, HlsLiveError, LoadError};
use crate::events::{EventBus, EventReceiver, LoaderEvent, LoaderKind, PipelineEvent, TrackType};
use crate::parser::{EncryptionMethod, M3u8Parser};
use crate::pipeline::Fragment;
use crate::scheduler::ManualClock;

/// Install a test-friendly tracing subscriber; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
struct BufferRecord {
    active_tracks: usize,
    init_segments: usize,
    appended: usize,
    ended: bool,
    destroyed: bool,
}

#[derive(Debug)]
struct MediaRecord {
    position: f64,
    buffered: Vec<TimeRange>,
    ready_state: ReadyState,
    available: bool,
    seeks: Vec<f64>,
    attached: Vec<SourceHandle>,
}

impl Default for MediaRecord {
    fn default() -> Self {
        Self {
            position: 0.0,
            buffered: Vec::new(),
            ready_state: ReadyState::HaveNothing,
            available: true,
            seeks: Vec::new(),
            attached: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Record {
    loads: Vec<LoadRequest>,
    demuxed: Vec<u64>,
    demuxers_created: usize,
    demuxers_destroyed: usize,
    remux_media: usize,
    remux_metadata: Vec<TrackType>,
    remux_resets: usize,
    decrypts: Vec<u64>,
    ciphers_created: usize,
    buffers: Vec<BufferRecord>,
    media: MediaRecord,
}

/// Shared log every recording collaborator writes to.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<Record>>,
}

impl Recorder {
    pub fn loads(&self) -> Vec<LoadRequest> {
        self.inner.lock().loads.clone()
    }

    pub fn loads_of(&self, kind: LoaderKind) -> Vec<String> {
        self.inner
            .lock()
            .loads
            .iter()
            .filter(|r| r.loader == kind)
            .map(|r| r.url.clone())
            .collect()
    }

    pub fn demuxed(&self) -> Vec<u64> {
        self.inner.lock().demuxed.clone()
    }

    pub fn demuxers_created(&self) -> usize {
        self.inner.lock().demuxers_created
    }

    pub fn demuxers_destroyed(&self) -> usize {
        self.inner.lock().demuxers_destroyed
    }

    pub fn remux_media_calls(&self) -> usize {
        self.inner.lock().remux_media
    }

    pub fn remux_metadata(&self) -> Vec<TrackType> {
        self.inner.lock().remux_metadata.clone()
    }

    pub fn remux_resets(&self) -> usize {
        self.inner.lock().remux_resets
    }

    pub fn decrypts(&self) -> Vec<u64> {
        self.inner.lock().decrypts.clone()
    }

    pub fn ciphers_created(&self) -> usize {
        self.inner.lock().ciphers_created
    }

    pub fn buffers_created(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    pub fn set_active_tracks(&self, buffer: usize, tracks: usize) {
        if let Some(record) = self.inner.lock().buffers.get_mut(buffer) {
            record.active_tracks = tracks;
        }
    }

    pub fn buffer_destroyed(&self, buffer: usize) -> bool {
        self.inner
            .lock()
            .buffers
            .get(buffer)
            .is_some_and(|b| b.destroyed)
    }

    pub fn buffer_ended(&self, buffer: usize) -> bool {
        self.inner.lock().buffers.get(buffer).is_some_and(|b| b.ended)
    }

    pub fn appended(&self, buffer: usize) -> usize {
        self.inner
            .lock()
            .buffers
            .get(buffer)
            .map_or(0, |b| b.appended)
    }

    pub fn init_segments(&self, buffer: usize) -> usize {
        self.inner
            .lock()
            .buffers
            .get(buffer)
            .map_or(0, |b| b.init_segments)
    }

    pub fn seeks(&self) -> Vec<f64> {
        self.inner.lock().media.seeks.clone()
    }

    pub fn attached(&self) -> Vec<SourceHandle> {
        self.inner.lock().media.attached.clone()
    }

    pub fn set_media(&self, position: f64, ranges: &[(f64, f64)], ready_state: ReadyState) {
        let mut record = self.inner.lock();
        record.media.position = position;
        record.media.buffered = ranges.iter().map(|(s, e)| TimeRange::new(*s, *e)).collect();
        record.media.ready_state = ready_state;
    }

    pub fn set_media_available(&self, available: bool) {
        self.inner.lock().media.available = available;
    }
}

pub struct RecordingLoader {
    recorder: Recorder,
}

impl RecordingLoader {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl Loader for RecordingLoader {
    fn load(&mut self, request: LoadRequest) {
        self.recorder.inner.lock().loads.push(request);
    }
}

pub struct RecordingDemuxer {
    recorder: Recorder,
}

impl RecordingDemuxer {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl Demuxer for RecordingDemuxer {
    fn demux(&mut self, fragment: &Fragment, _end_of_list: bool) {
        self.recorder.inner.lock().demuxed.push(fragment.sequence);
    }

    fn destroy(&mut self) {
        self.recorder.inner.lock().demuxers_destroyed += 1;
    }
}

pub struct RecordingDemuxerFactory {
    recorder: Recorder,
}

impl RecordingDemuxerFactory {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl DemuxerFactory for RecordingDemuxerFactory {
    fn create(&self, _bus: &EventBus) -> Box<dyn Demuxer> {
        self.recorder.inner.lock().demuxers_created += 1;
        Box::new(RecordingDemuxer::new(self.recorder.clone()))
    }
}

pub struct RecordingRemuxer {
    recorder: Recorder,
}

impl RecordingRemuxer {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl Remuxer for RecordingRemuxer {
    fn remux_metadata(&mut self, track: TrackType) {
        self.recorder.inner.lock().remux_metadata.push(track);
    }

    fn remux_media(&mut self) {
        self.recorder.inner.lock().remux_media += 1;
    }

    fn reset(&mut self) {
        self.recorder.inner.lock().remux_resets += 1;
    }
}

pub struct RecordingCipher {
    recorder: Recorder,
}

impl Cipher for RecordingCipher {
    fn decrypt(&mut self, sequence: u64, _iv: [u8; 16], _data: Bytes) {
        self.recorder.inner.lock().decrypts.push(sequence);
    }
}

/// Accepts AES-128 keys of the right length, like the real factory.
pub struct RecordingCipherFactory {
    recorder: Recorder,
}

impl RecordingCipherFactory {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl CipherFactory for RecordingCipherFactory {
    fn create(
        &self,
        method: &EncryptionMethod,
        key: &Bytes,
        _bus: &EventBus,
    ) -> Result<Box<dyn Cipher>, DecryptionError> {
        if *method != EncryptionMethod::Aes128 {
            return Err(DecryptionError::UnsupportedMethod(format!("{method:?}")));
        }
        if key.len() != 16 {
            return Err(DecryptionError::InvalidKeyLength(key.len()));
        }
        self.recorder.inner.lock().ciphers_created += 1;
        Ok(Box::new(RecordingCipher {
            recorder: self.recorder.clone(),
        }))
    }
}

pub struct RecordingBuffer {
    recorder: Recorder,
    index: usize,
}

impl RecordingBuffer {
    fn with_record<R>(&self, f: impl FnOnce(&mut BufferRecord) -> R) -> Option<R> {
        self.recorder.inner.lock().buffers.get_mut(self.index).map(f)
    }
}

impl PlaybackBuffer for RecordingBuffer {
    fn add_source_buffers(&mut self, _init_segment: &Bytes) {
        self.with_record(|b| b.init_segments += 1);
    }

    fn append(&mut self, _media_segment: Bytes) {
        self.with_record(|b| b.appended += 1);
    }

    fn active_track_count(&self) -> usize {
        self.with_record(|b| b.active_tracks).unwrap_or_default()
    }

    fn end_of_stream(&mut self) {
        self.with_record(|b| b.ended = true);
    }

    fn destroy(&mut self) {
        self.with_record(|b| b.destroyed = true);
    }

    fn source_handle(&self) -> SourceHandle {
        SourceHandle(format!("blob:buffer-{}", self.index))
    }
}

pub struct RecordingBufferFactory {
    recorder: Recorder,
}

impl RecordingBufferFactory {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl BufferFactory for RecordingBufferFactory {
    fn create(&self, _bus: &EventBus) -> Box<dyn PlaybackBuffer> {
        let index = {
            let mut record = self.recorder.inner.lock();
            record.buffers.push(BufferRecord::default());
            record.buffers.len() - 1
        };
        Box::new(RecordingBuffer {
            recorder: self.recorder.clone(),
            index,
        })
    }
}

pub struct RecordingMedia {
    recorder: Recorder,
}

impl RecordingMedia {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl MediaElement for RecordingMedia {
    fn current_time(&self) -> f64 {
        self.recorder.inner.lock().media.position
    }

    fn set_current_time(&mut self, position: f64) {
        let mut record = self.recorder.inner.lock();
        record.media.position = position;
        record.media.seeks.push(position);
    }

    fn buffered(&self) -> Vec<TimeRange> {
        self.recorder.inner.lock().media.buffered.clone()
    }

    fn ready_state(&self) -> ReadyState {
        self.recorder.inner.lock().media.ready_state
    }

    fn attach(&mut self, source: SourceHandle) {
        self.recorder.inner.lock().media.attached.push(source);
    }

    fn is_available(&self) -> bool {
        self.recorder.inner.lock().media.available
    }
}

/// A controller wired to recording collaborators and a manual clock.
pub struct Harness {
    pub controller: LiveController,
    pub events: EventReceiver,
    pub bus: EventBus,
    pub recorder: Recorder,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(config: LiveConfig) -> Self {
        match Self::try_new(config) {
            Ok(harness) => harness,
            Err(e) => panic!("harness config rejected: {e}"),
        }
    }

    pub fn try_new(config: LiveConfig) -> Result<Self, HlsLiveError> {
        let (bus, events) = EventBus::new(64);
        let recorder = Recorder::default();
        let clock = ManualClock::new();
        let collaborators = Collaborators {
            playlist_loader: Box::new(RecordingLoader::new(recorder.clone())),
            segment_loader: Box::new(RecordingLoader::new(recorder.clone())),
            key_loader: Box::new(RecordingLoader::new(recorder.clone())),
            parser: Box::new(M3u8Parser::new()),
            cipher_factory: Box::new(RecordingCipherFactory::new(recorder.clone())),
            demuxer_factory: Box::new(RecordingDemuxerFactory::new(recorder.clone())),
            remuxer: Box::new(RecordingRemuxer::new(recorder.clone())),
            buffer_factory: Box::new(RecordingBufferFactory::new(recorder.clone())),
            media: Box::new(RecordingMedia::new(recorder.clone())),
            clock: Arc::new(clock.clone()),
        };
        let controller = LiveController::new(config, collaborators, bus.clone())?;
        Ok(Self {
            controller,
            events,
            bus,
            recorder,
            clock,
        })
    }

    /// Hand an event to the controller, then anything it caused to be published.
    pub fn deliver(&mut self, event: impl Into<PipelineEvent>) {
        self.controller.handle_event(event.into());
        while let Some(event) = self.events.try_recv() {
            self.controller.handle_event(event);
        }
    }

    pub fn complete(&mut self, loader: LoaderKind, url: &str, data: &[u8]) {
        self.deliver(LoaderEvent::FetchComplete {
            loader,
            url: url.to_string(),
            data: Bytes::copy_from_slice(data),
        });
    }

    pub fn fail(&mut self, loader: LoaderKind, url: &str, error: LoadError) {
        self.deliver(LoaderEvent::FetchError {
            loader,
            url: url.to_string(),
            error,
        });
    }

    pub fn media_playing(&self, position: f64, ranges: &[(f64, f64)]) {
        self.recorder
            .set_media(position, ranges, ReadyState::HaveEnoughData);
    }

    pub fn media_stalled(&self, position: f64, ranges: &[(f64, f64)]) {
        self.recorder
            .set_media(position, ranges, ReadyState::HaveCurrentData);
    }
}
