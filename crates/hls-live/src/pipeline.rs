// Pipeline Coordinator: sequences fetch -> decrypt -> demux -> remux for one
// segment at a time and keeps the FIFO of fragments awaiting demux.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::collaborators::{Cipher, CipherFactory, Demuxer, LoadRequest, Loader, Remuxer};
use crate::error::DecryptionError;
use crate::events::{EventBus, LoaderKind, TrackType};
use crate::playlist::{EncryptionContext, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStage {
    Queued,
    Demuxing,
    /// Demuxed with a track layout the buffer cannot take; held for a rebuild.
    Blocked,
}

/// Downloaded (and decrypted) segment bytes waiting for the demuxer.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub sequence: u64,
    pub url: String,
    pub start: f64,
    pub duration: f64,
    pub data: Bytes,
    pub stage: FragmentStage,
}

#[derive(Debug, Default)]
pub struct FragmentQueue {
    items: VecDeque<Fragment>,
}

impl FragmentQueue {
    pub fn push(&mut self, fragment: Fragment) {
        self.items.push_back(fragment);
    }

    pub fn head(&self) -> Option<&Fragment> {
        self.items.front()
    }

    fn head_mut(&mut self) -> Option<&mut Fragment> {
        self.items.front_mut()
    }

    fn pop(&mut self) -> Option<Fragment> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderSlot {
    Idle,
    Loading { url: String },
    RetryPending { url: String, due: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchStage {
    Fetching,
    AwaitingKey,
    Decrypting,
}

/// The one segment between "requested" and "queued for demux".
#[derive(Debug)]
struct InFlight {
    sequence: u64,
    url: String,
    start: f64,
    duration: f64,
    encrypted: bool,
    stage: FetchStage,
    data: Option<Bytes>,
}

impl InFlight {
    fn into_fragment(self, data: Bytes) -> Fragment {
        Fragment {
            sequence: self.sequence,
            url: self.url,
            start: self.start,
            duration: self.duration,
            data,
            stage: FragmentStage::Queued,
        }
    }
}

pub struct PipelineCoordinator {
    playlist_loader: Box<dyn Loader>,
    segment_loader: Box<dyn Loader>,
    key_loader: Box<dyn Loader>,
    cipher_factory: Box<dyn CipherFactory>,
    cipher: Option<(String, Box<dyn Cipher>)>,
    remuxer: Box<dyn Remuxer>,
    bus: EventBus,
    slots: HashMap<LoaderKind, LoaderSlot>,
    in_flight: Option<InFlight>,
    queue: FragmentQueue,
}

impl PipelineCoordinator {
    pub fn new(
        playlist_loader: Box<dyn Loader>,
        segment_loader: Box<dyn Loader>,
        key_loader: Box<dyn Loader>,
        cipher_factory: Box<dyn CipherFactory>,
        remuxer: Box<dyn Remuxer>,
        bus: EventBus,
    ) -> Self {
        Self {
            playlist_loader,
            segment_loader,
            key_loader,
            cipher_factory,
            cipher: None,
            remuxer,
            bus,
            slots: LoaderKind::ALL
                .into_iter()
                .map(|kind| (kind, LoaderSlot::Idle))
                .collect(),
            in_flight: None,
            queue: FragmentQueue::default(),
        }
    }

    fn loader_mut(&mut self, kind: LoaderKind) -> &mut dyn Loader {
        match kind {
            LoaderKind::Playlist => self.playlist_loader.as_mut(),
            LoaderKind::Segment => self.segment_loader.as_mut(),
            LoaderKind::Key => self.key_loader.as_mut(),
        }
    }

    pub fn slot(&self, kind: LoaderKind) -> &LoaderSlot {
        self.slots.get(&kind).unwrap_or(&LoaderSlot::Idle)
    }

    fn is_idle(&self, kind: LoaderKind) -> bool {
        *self.slot(kind) == LoaderSlot::Idle
    }

    fn issue(&mut self, kind: LoaderKind, url: &str) {
        trace!(loader = %kind, %url, "Issuing fetch");
        self.slots.insert(kind, LoaderSlot::Loading { url: url.to_string() });
        self.loader_mut(kind).load(LoadRequest {
            loader: kind,
            url: url.to_string(),
        });
    }

    /// A segment or playlist fetch, or a segment still being processed,
    /// suppresses any new request.
    pub fn is_busy(&self) -> bool {
        !self.is_idle(LoaderKind::Playlist)
            || !self.is_idle(LoaderKind::Segment)
            || self.in_flight.is_some()
    }

    pub fn fetch_segment(&mut self, segment: &Segment) {
        self.in_flight = Some(InFlight {
            sequence: segment.sequence,
            url: segment.url.clone(),
            start: segment.start,
            duration: segment.duration,
            encrypted: segment.encrypted,
            stage: FetchStage::Fetching,
            data: None,
        });
        self.issue(LoaderKind::Segment, &segment.url);
    }

    pub fn refresh_playlist(&mut self, url: &str) {
        self.issue(LoaderKind::Playlist, url);
    }

    /// Request a key unless one is already on its way.
    pub fn fetch_key(&mut self, url: &str) -> bool {
        if !self.is_idle(LoaderKind::Key) {
            return false;
        }
        self.issue(LoaderKind::Key, url);
        true
    }

    /// Release the slot for a finished request. Returns `false` for a
    /// completion that does not belong to the outstanding request.
    pub fn settle(&mut self, kind: LoaderKind, url: &str) -> bool {
        match self.slot(kind) {
            LoaderSlot::Loading { url: pending } if pending == url => {
                self.slots.insert(kind, LoaderSlot::Idle);
                true
            }
            _ => false,
        }
    }

    pub fn schedule_retry(&mut self, kind: LoaderKind, url: &str, due: Instant) {
        self.slots.insert(
            kind,
            LoaderSlot::RetryPending {
                url: url.to_string(),
                due,
            },
        );
    }

    /// Reissue every retry whose delay has elapsed. Returns how many were sent.
    pub fn issue_due_retries(&mut self, now: Instant) -> usize {
        let due: Vec<(LoaderKind, String)> = self
            .slots
            .iter()
            .filter_map(|(kind, slot)| match slot {
                LoaderSlot::RetryPending { url, due } if *due <= now => Some((*kind, url.clone())),
                _ => None,
            })
            .collect();
        for (kind, url) in &due {
            debug!(loader = %kind, %url, "Retrying fetch");
            self.issue(*kind, url);
        }
        due.len()
    }

    /// Give up on a loader's request entirely.
    pub fn abandon(&mut self, kind: LoaderKind) {
        self.slots.insert(kind, LoaderSlot::Idle);
        if kind == LoaderKind::Segment {
            self.in_flight = None;
        }
    }

    /// Segment bytes arrived for the in-flight segment.
    ///
    /// Clear segments are queued immediately. Encrypted ones are decrypted
    /// when a cipher for the active key exists, otherwise they wait for it.
    pub fn on_segment_data(
        &mut self,
        data: Bytes,
        encryption: Option<&EncryptionContext>,
    ) -> Result<(), DecryptionError> {
        let Some(mut in_flight) = self.in_flight.take() else {
            warn!("Segment data without an in-flight segment");
            return Ok(());
        };

        if !in_flight.encrypted {
            self.queue.push(in_flight.into_fragment(data));
            return Ok(());
        }

        let ctx = encryption.ok_or(DecryptionError::MissingKey)?;
        match self.cipher.as_mut() {
            Some((uri, cipher)) if *uri == ctx.uri => {
                in_flight.stage = FetchStage::Decrypting;
                cipher.decrypt(in_flight.sequence, ctx.iv_for(in_flight.sequence), data);
            }
            _ => {
                trace!(sequence = in_flight.sequence, "Segment waits for its key");
                in_flight.stage = FetchStage::AwaitingKey;
                in_flight.data = Some(data);
            }
        }
        self.in_flight = Some(in_flight);
        Ok(())
    }

    /// Build a cipher for a freshly fetched key and release a waiting segment.
    pub fn install_key(&mut self, ctx: &EncryptionContext) -> Result<(), DecryptionError> {
        let key = ctx.key.as_ref().ok_or(DecryptionError::MissingKey)?;
        let mut cipher = self.cipher_factory.create(&ctx.method, key, &self.bus)?;
        debug!(uri = %ctx.uri, "Cipher ready");

        if let Some(in_flight) = self.in_flight.as_mut()
            && in_flight.stage == FetchStage::AwaitingKey
            && let Some(data) = in_flight.data.take()
        {
            in_flight.stage = FetchStage::Decrypting;
            cipher.decrypt(in_flight.sequence, ctx.iv_for(in_flight.sequence), data);
        }
        self.cipher = Some((ctx.uri.clone(), cipher));
        Ok(())
    }

    /// Plaintext for the decrypting segment. Returns `false` if it was stale.
    pub fn on_decrypted(&mut self, sequence: u64, data: Bytes) -> bool {
        match self.in_flight.take() {
            Some(in_flight)
                if in_flight.stage == FetchStage::Decrypting && in_flight.sequence == sequence =>
            {
                self.queue.push(in_flight.into_fragment(data));
                true
            }
            other => {
                self.in_flight = other;
                false
            }
        }
    }

    pub fn awaiting_key(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|f| f.stage == FetchStage::AwaitingKey)
    }

    /// Hand the head fragment to the demuxer if it is ready for it.
    pub fn pump(&mut self, demuxer: &mut dyn Demuxer, end_of_list: bool) -> bool {
        match self.queue.head_mut() {
            Some(head) if head.stage == FragmentStage::Queued => {
                head.stage = FragmentStage::Demuxing;
                trace!(sequence = head.sequence, "Demuxing fragment");
                demuxer.demux(head, end_of_list);
                true
            }
            _ => false,
        }
    }

    pub fn demux_in_flight(&self) -> bool {
        self.queue
            .head()
            .is_some_and(|f| f.stage == FragmentStage::Demuxing)
    }

    pub fn head(&self) -> Option<&Fragment> {
        self.queue.head()
    }

    pub fn queue(&self) -> &FragmentQueue {
        &self.queue
    }

    /// The head demuxed cleanly: remux it and drop it from the queue.
    pub fn finish_head(&mut self) -> Option<Fragment> {
        if !self.demux_in_flight() {
            return None;
        }
        self.remuxer.remux_media();
        self.queue.pop()
    }

    pub fn block_head(&mut self) {
        if let Some(head) = self.queue.head_mut() {
            head.stage = FragmentStage::Blocked;
        }
    }

    /// Make a blocked head eligible for demux again.
    pub fn requeue_head(&mut self) {
        if let Some(head) = self.queue.head_mut() {
            head.stage = FragmentStage::Queued;
        }
    }

    pub fn drop_head(&mut self) -> Option<Fragment> {
        self.queue.pop()
    }

    pub fn remux_metadata(&mut self, track: TrackType) {
        self.remuxer.remux_metadata(track);
    }

    pub fn reset_remuxer(&mut self) {
        self.remuxer.reset();
    }

    /// Nothing fetched is left to play out.
    pub fn is_drained(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    /// Forget all outstanding work. Late completions become stale.
    pub fn reset(&mut self) {
        for slot in self.slots.values_mut() {
            *slot = LoaderSlot::Idle;
        }
        self.in_flight = None;
        self.queue.clear();
        self.cipher = None;
    }
}
