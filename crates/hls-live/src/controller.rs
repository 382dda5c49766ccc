//! Live Controller.
//!
//! [`LiveController`] is a synchronous state machine. It is advanced by two
//! inputs only: [`LiveController::tick`] from the scheduling loop and
//! [`LiveController::handle_event`] for every collaborator completion. The
//! async [`driver`](crate::driver) owns it and feeds both.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► load(url) ──► tick / handle_event ... ──► destroy()
//!                ▲                 │
//!                └── master redirect
//! ```
//!
//! Any fatal error tears the controller down. After that every call is a no-op.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{BufferLifecycle, LifecycleState, MediaInfo, TrackCheck};
use crate::collaborators::{Collaborators, MediaElement};
use crate::config::LiveConfig;
use crate::error::{ErrorCategory, ErrorCode, HlsLiveError, LoadError, PlaybackError};
use crate::events::{
    BufferEvent, CipherEvent, DemuxEvent, EventBus, LoaderEvent, LoaderKind, MediaEvent,
    PipelineEvent, PlayerEvent, RemuxEvent, RetryInfo,
};
use crate::parser::{Manifest, PlaylistParser};
use crate::pipeline::PipelineCoordinator;
use crate::playlist::{Playlist, PushOutcome};
use crate::retry::{RetryBudget, RetryDecision, RetryPolicy};
use crate::scheduler::{Clock, Scheduler, ViewerSnapshot};

pub struct LiveController {
    config: LiveConfig,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    parser: Box<dyn PlaylistParser>,
    media: Box<dyn MediaElement>,
    playlist: Playlist,
    retry: RetryPolicy,
    /// Budget for manifests that fetched fine but could not be used.
    content_retry: RetryBudget,
    pipeline: PipelineCoordinator,
    lifecycle: BufferLifecycle,
    scheduler: Scheduler,
    url: Option<String>,
    preload_time: Option<f64>,
    refresh_interval: Duration,
    ended: bool,
    torn_down: bool,
}

impl LiveController {
    /// Validate `config`, build the first playback buffer and attach the viewer.
    pub fn new(
        config: LiveConfig,
        collaborators: Collaborators,
        bus: EventBus,
    ) -> Result<Self, HlsLiveError> {
        config.validate()?;

        let Collaborators {
            playlist_loader,
            segment_loader,
            key_loader,
            parser,
            cipher_factory,
            demuxer_factory,
            remuxer,
            buffer_factory,
            mut media,
            clock,
        } = collaborators;

        let lifecycle =
            BufferLifecycle::new(buffer_factory, demuxer_factory, bus.clone(), media.as_mut());
        let pipeline = PipelineCoordinator::new(
            playlist_loader,
            segment_loader,
            key_loader,
            cipher_factory,
            remuxer,
            bus.clone(),
        );

        Ok(Self {
            retry: RetryPolicy::from_config(&config),
            content_retry: RetryBudget::new(config.retry_times),
            scheduler: Scheduler::new(config.tick_interval),
            preload_time: config.preload_time.map(|p| p.as_secs_f64()),
            refresh_interval: config.default_refresh_interval,
            config,
            bus,
            clock,
            parser,
            media,
            playlist: Playlist::new(),
            pipeline,
            lifecycle,
            url: None,
            ended: false,
            torn_down: false,
        })
    }

    /// Start playing `url`. Any previous stream state is discarded.
    pub fn load(&mut self, url: &str) -> Result<(), HlsLiveError> {
        if self.torn_down {
            return Err(HlsLiveError::TornDown);
        }
        info!(%url, "Loading live playlist");

        self.url = Some(url.to_string());
        self.playlist.reset_sequence();
        self.pipeline.reset();
        self.content_retry.reset();
        self.ended = false;

        if !self.scheduler.start() {
            return Err(HlsLiveError::Cancelled);
        }
        self.scheduler.record_refresh(self.clock.now());
        self.pipeline.refresh_playlist(url);
        Ok(())
    }

    /// One pass of the scheduling loop.
    pub fn tick(&mut self) {
        if self.torn_down || !self.scheduler.is_running() {
            return;
        }
        if !self.media.is_available() {
            info!("Viewer is gone, stopping");
            self.destroy();
            return;
        }

        if self.lifecycle.is_active() {
            self.pipeline.issue_due_retries(self.clock.now());
        } else if self.lifecycle.state() == LifecycleState::PendingRecreate
            && self.media.ready_state().is_starving()
        {
            // Already stalled when the mismatch showed up; no new waiting signal will come.
            self.start_rebuild();
        }

        let snapshot = ViewerSnapshot {
            position: self.media.current_time(),
            buffered: self.media.buffered(),
            ready_state: self.media.ready_state(),
        };
        let plan = self
            .scheduler
            .plan(&snapshot, self.preload_time(), self.config.limit_cache);

        if let Some(position) = plan.seek {
            self.media.set_current_time(position);
        }
        if plan.preload {
            self.preload();
        }
    }

    /// Request at most one thing: the next segment, or else a due playlist refresh.
    fn preload(&mut self) {
        if self.pipeline.is_busy() || !self.lifecycle.is_active() {
            return;
        }

        if let Some(segment) = self.playlist.next_segment().cloned() {
            if let Err(error) = self.playlist.mark_downloading(&segment.url) {
                warn!(%error, "Cannot start segment fetch");
                return;
            }
            debug!(sequence = segment.sequence, url = %segment.url, "Fetching segment");
            self.pipeline.fetch_segment(&segment);
            return;
        }

        if self.playlist.is_ended() {
            return;
        }
        let now = self.clock.now();
        if let Some(url) = self.url.clone()
            && self.scheduler.refresh_due(now, self.refresh_interval)
        {
            trace!(%url, "Refreshing playlist");
            self.scheduler.record_refresh(now);
            self.pipeline.refresh_playlist(&url);
        }
    }

    pub fn handle_event(&mut self, event: PipelineEvent) {
        if self.torn_down {
            trace!("Ignoring event after teardown");
            return;
        }
        match event {
            PipelineEvent::Loader(event) => self.on_loader_event(event),
            PipelineEvent::Cipher(event) => self.on_cipher_event(event),
            PipelineEvent::Demux(event) => self.on_demux_event(event),
            PipelineEvent::Remux(event) => self.on_remux_event(event),
            PipelineEvent::Buffer(event) => self.on_buffer_event(event),
            PipelineEvent::Media(event) => self.on_media_event(event),
        }
    }

    fn on_loader_event(&mut self, event: LoaderEvent) {
        match event {
            LoaderEvent::FetchComplete { loader, url, data } => {
                if !self.pipeline.settle(loader, &url) {
                    debug!(%loader, %url, "Ignoring stale fetch completion");
                    return;
                }
                self.retry.on_success(loader);
                match loader {
                    LoaderKind::Playlist => self.on_playlist_loaded(&url, &data),
                    LoaderKind::Segment => self.on_segment_loaded(&url, data),
                    LoaderKind::Key => self.on_key_loaded(&url, data),
                }
            }
            LoaderEvent::FetchError { loader, url, error } => {
                if !self.pipeline.settle(loader, &url) {
                    debug!(%loader, %url, "Ignoring stale fetch error");
                    return;
                }
                self.on_fetch_failed(loader, url, error);
            }
            LoaderEvent::FetchRetry { loader, info } => {
                self.bus.emit(PlayerEvent::Retry { loader, info });
            }
        }
    }

    fn on_fetch_failed(&mut self, loader: LoaderKind, url: String, error: LoadError) {
        match self.retry.on_failure(loader, &error) {
            RetryDecision::Retry {
                attempt,
                remaining,
                delay,
            } => {
                self.pipeline
                    .schedule_retry(loader, &url, self.clock.now() + delay);
                self.bus.emit(PlayerEvent::Retry {
                    loader,
                    info: RetryInfo {
                        url,
                        attempt,
                        remaining,
                        delay,
                    },
                });
            }
            RetryDecision::Exhausted { attempts } => {
                warn!(%loader, attempts, %error, "Retry budget exhausted");
                self.bus.emit(PlayerEvent::RetryTimeExceeded);
                self.on_loader_failed(loader, error);
            }
            RetryDecision::Terminal => {
                warn!(%loader, %error, "Fetch failed permanently");
                self.on_loader_failed(loader, error);
            }
        }
    }

    fn on_loader_failed(&mut self, loader: LoaderKind, error: LoadError) {
        self.pipeline.abandon(loader);
        if loader == LoaderKind::Playlist && self.playlist.is_loaded() {
            info!("Playlist is no longer reachable, ending stream");
            self.finish_stream();
            return;
        }
        let code = match loader {
            LoaderKind::Key => ErrorCode::KEY,
            _ => error.code(),
        };
        self.report(PlaybackError::new(
            code,
            ErrorCategory::Network,
            &format!("{loader}-loader"),
            &error,
            true,
        ));
    }

    fn on_playlist_loaded(&mut self, url: &str, data: &Bytes) {
        let manifest = match self.parser.parse(data, url) {
            Ok(manifest) => manifest,
            Err(error) => return self.on_unusable_manifest(error),
        };

        match manifest {
            Manifest::Master { variant_uri } => {
                info!(%variant_uri, "Following master playlist");
                if let Err(error) = self.load(&variant_uri) {
                    warn!(%error, "Cannot follow master playlist");
                }
            }
            Manifest::Media(manifest) => {
                let is_live = !manifest.end_list;
                match self.playlist.push_playlist(&manifest, is_live) {
                    Ok(outcome) => self.on_playlist_merged(outcome),
                    Err(error) => self.on_unusable_manifest(error),
                }
            }
        }
    }

    fn on_playlist_merged(&mut self, outcome: PushOutcome) {
        if let Some(target) = self.playlist.target_duration() {
            if let Ok(interval) = Duration::try_from_secs_f64(target)
                && !interval.is_zero()
            {
                self.refresh_interval = interval;
            }
            if self.preload_time.is_none() {
                debug!(preload_time = target, "Preload time derived from target duration");
                self.preload_time = Some(target);
            }
        }

        debug!(
            media_sequence = ?self.playlist.media_sequence(),
            new_segments = outcome.new_segments,
            evicted = outcome.evicted,
            ended = self.playlist.is_ended(),
            "Playlist refreshed"
        );
        self.bus.emit(PlayerEvent::PlaylistRefreshed {
            media_sequence: self.playlist.media_sequence().unwrap_or_default(),
            target_duration: self.playlist.target_duration(),
            new_segments: outcome.new_segments,
        });

        if outcome.key_required {
            self.request_key();
        }
    }

    fn on_unusable_manifest(&mut self, error: crate::error::PlaylistError) {
        self.report(PlaybackError::new(
            ErrorCode::MANIFEST,
            ErrorCategory::Parse,
            "playlist",
            &error,
            false,
        ));
        if self.content_retry.try_spend() {
            debug!(
                remaining = self.content_retry.remaining(),
                "Keeping previous playlist, will poll again"
            );
            return;
        }

        warn!("Manifest retry budget exhausted");
        self.bus.emit(PlayerEvent::RetryTimeExceeded);
        if self.playlist.is_loaded() {
            self.finish_stream();
        } else {
            self.report(PlaybackError::new(
                ErrorCode::MANIFEST,
                ErrorCategory::Parse,
                "playlist",
                "no usable playlist",
                true,
            ));
        }
    }

    fn request_key(&mut self) {
        if let Some(ctx) = self.playlist.encryption()
            && !ctx.has_key()
        {
            let uri = ctx.uri.clone();
            if self.pipeline.fetch_key(&uri) {
                debug!(%uri, "Fetching decryption key");
            }
        }
    }

    fn on_segment_loaded(&mut self, url: &str, data: Bytes) {
        self.content_retry.reset();
        let sequence = self.playlist.segment_by_url(url).map(|s| s.sequence);
        match self.playlist.mark_downloaded(url) {
            Ok(true) => trace!(?sequence, %url, bytes = data.len(), "Segment downloaded"),
            Ok(false) => debug!(?sequence, %url, "Segment was already downloaded"),
            Err(error) => warn!(%error, "Downloaded segment is not tracked"),
        }

        let encryption = self.playlist.encryption().cloned();
        if let Err(error) = self.pipeline.on_segment_data(data, encryption.as_ref()) {
            return self.report(PlaybackError::new(
                ErrorCode::DECRYPT,
                ErrorCategory::Parse,
                "cipher",
                &error,
                true,
            ));
        }
        if self.pipeline.awaiting_key() {
            debug!(?sequence, "Segment held until its key arrives");
        }
        self.pump();
    }

    fn on_key_loaded(&mut self, url: &str, key: Bytes) {
        self.content_retry.reset();
        if !self.playlist.set_key(url, key) {
            debug!(%url, "Key no longer matches the active context");
            self.request_key();
            return;
        }
        let Some(ctx) = self.playlist.encryption().cloned() else {
            return;
        };
        if let Err(error) = self.pipeline.install_key(&ctx) {
            self.report(PlaybackError::new(
                ErrorCode::DECRYPT,
                ErrorCategory::Parse,
                "cipher",
                &error,
                true,
            ));
        }
    }

    fn on_cipher_event(&mut self, event: CipherEvent) {
        match event {
            CipherEvent::Decrypted { sequence, data } => {
                if self.pipeline.on_decrypted(sequence, data) {
                    self.pump();
                } else {
                    debug!(sequence, "Ignoring stale decrypted segment");
                }
            }
            CipherEvent::DecryptError { sequence, error } => {
                warn!(sequence, %error, "Segment decryption failed");
                self.report(PlaybackError::new(
                    ErrorCode::DECRYPT,
                    ErrorCategory::Parse,
                    "cipher",
                    &error,
                    true,
                ));
            }
        }
    }

    fn pump(&mut self) {
        if !self.lifecycle.is_active() {
            return;
        }
        let end_of_list = self.playlist.is_ended();
        self.pipeline
            .pump(self.lifecycle.demuxer_mut(), end_of_list);
    }

    fn on_demux_event(&mut self, event: DemuxEvent) {
        match event {
            DemuxEvent::MetadataParsed(track) => {
                self.lifecycle.record_track(track);
                self.pipeline.remux_metadata(track);
            }
            DemuxEvent::DemuxComplete {
                video_tracks,
                audio_tracks,
            } => self.on_demux_complete(video_tracks, audio_tracks),
            DemuxEvent::DemuxError {
                module,
                error,
                fatal,
            } => {
                let fatal = fatal.unwrap_or(true);
                self.report(PlaybackError::new(
                    ErrorCode::DEMUX,
                    ErrorCategory::Parse,
                    &module,
                    &error,
                    fatal,
                ));
                if !fatal && self.pipeline.demux_in_flight() {
                    if let Some(dropped) = self.pipeline.drop_head() {
                        warn!(sequence = dropped.sequence, "Skipping undemuxable fragment");
                    }
                    self.pump();
                }
            }
            DemuxEvent::SeiParsed(payload) => self.bus.emit(PlayerEvent::SeiParsed(payload)),
        }
    }

    fn on_demux_complete(&mut self, video_tracks: usize, audio_tracks: usize) {
        if !self.pipeline.demux_in_flight() {
            debug!("Ignoring demux completion without a fragment in progress");
            return;
        }
        match self.lifecycle.check_tracks(video_tracks, audio_tracks) {
            TrackCheck::Consistent => {
                if let Some(head) = self.pipeline.head() {
                    self.lifecycle.note_fragment_start(head.start);
                }
                if let Some(done) = self.pipeline.finish_head() {
                    trace!(sequence = done.sequence, "Fragment remuxed");
                }
                self.pump();
            }
            TrackCheck::Mismatch { active, demuxed } => {
                self.pipeline.block_head();
                self.bus.emit(PlayerEvent::RebuildScheduled {
                    active_tracks: active,
                    demuxed_tracks: demuxed,
                });
            }
            TrackCheck::Deferred => self.pipeline.block_head(),
        }
    }

    fn on_remux_event(&mut self, event: RemuxEvent) {
        match event {
            RemuxEvent::InitSegment(payload) => {
                self.lifecycle.buffer_mut().add_source_buffers(&payload);
            }
            RemuxEvent::MediaSegment(payload) => {
                self.lifecycle.append(self.media.as_mut(), payload);
            }
            RemuxEvent::RemuxError {
                module,
                error,
                fatal,
            } => self.report(PlaybackError::new(
                ErrorCode::REMUX,
                ErrorCategory::Parse,
                &module,
                &error,
                fatal.unwrap_or(true),
            )),
        }
    }

    fn on_buffer_event(&mut self, event: BufferEvent) {
        match event {
            BufferEvent::SourceUpdateEnd => self.check_end_of_stream(),
            BufferEvent::BufferError { tag, error, fatal } => self.report(PlaybackError::new(
                ErrorCode::BUFFER,
                ErrorCategory::Buffer,
                &tag,
                &error,
                fatal.unwrap_or(false),
            )),
            BufferEvent::Destroyed => self.on_buffer_destroyed(),
        }
    }

    fn on_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Waiting => {
                if self.lifecycle.state() == LifecycleState::PendingRecreate {
                    self.start_rebuild();
                } else {
                    trace!("Viewer waiting for data");
                }
            }
            MediaEvent::Playing => trace!("Viewer playing"),
        }
    }

    fn start_rebuild(&mut self) {
        if self.lifecycle.on_stall(self.pipeline.demux_in_flight()) {
            debug!("Rebuild started on stall");
        }
    }

    fn on_buffer_destroyed(&mut self) {
        if !self.lifecycle.on_destroyed(self.media.as_mut()) {
            debug!("Ignoring buffer teardown outside a rebuild");
            return;
        }
        self.pipeline.reset_remuxer();

        // The blocked head is re-demuxed from its retained bytes, not refetched.
        let resume_at = self.pipeline.head().map(|f| f.start);
        if let Some(position) = resume_at {
            self.media.set_current_time(position);
        }
        self.pipeline.requeue_head();
        self.pump();

        let resume_at = resume_at.unwrap_or_else(|| self.media.current_time());
        info!(resume_at, "Resuming after rebuild");
        self.bus.emit(PlayerEvent::RebuildComplete { resume_at });
    }

    fn check_end_of_stream(&mut self) {
        if self.ended
            || !self.playlist.is_ended()
            || !self.playlist.last_segment_downloaded()
            || !self.pipeline.is_drained()
        {
            return;
        }
        info!("Playlist ended and fully buffered");
        self.ended = true;
        self.lifecycle.end_of_stream();
        self.bus.emit(PlayerEvent::EndOfStream);
    }

    /// End playback without an error; nothing more will be fetched.
    fn finish_stream(&mut self) {
        self.scheduler.stop();
        if !self.ended {
            self.ended = true;
            self.lifecycle.end_of_stream();
            self.bus.emit(PlayerEvent::EndOfStream);
        }
    }

    fn report(&mut self, error: PlaybackError) {
        let fatal = error.fatal;
        if fatal {
            error!(%error, "Fatal playback error");
        } else {
            warn!(%error, "Playback error");
        }
        self.bus.emit(PlayerEvent::Error(error));
        if fatal {
            self.destroy();
        }
    }

    /// Stop scheduling and drop all outstanding work. Idempotent.
    pub fn destroy(&mut self) {
        if self.torn_down {
            return;
        }
        info!("Tearing down live controller");
        self.torn_down = true;
        self.scheduler.cancel();
        self.pipeline.reset();
        self.lifecycle.shutdown();
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn is_scheduling(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Cancelled when the controller is torn down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.scheduler.token()
    }

    pub fn tick_interval(&self) -> Duration {
        self.scheduler.tick_interval()
    }

    /// Configured preload time, else the first target duration seen, else the default.
    pub fn preload_time(&self) -> f64 {
        self.preload_time
            .unwrap_or_else(|| self.config.default_preload_time.as_secs_f64())
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Tracks announced since the current buffer was built.
    pub fn media_info(&self) -> MediaInfo {
        self.lifecycle.media_info()
    }

    pub fn rebuilds(&self) -> u64 {
        self.lifecycle.rebuilds()
    }

    pub fn queued_fragments(&self) -> usize {
        self.pipeline.queue().len()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}
