// Playlist Tracker: owns the live segment list and answers "what to fetch next".

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::error::PlaylistError;
use crate::parser::{EncryptionMethod, KeyDescriptor, MediaManifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    NotStarted,
    Downloading,
    Downloaded,
}

impl SegmentState {
    fn name(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub sequence: u64,
    pub url: String,
    /// Presentation start on the stream timeline, in seconds.
    pub start: f64,
    pub duration: f64,
    pub encrypted: bool,
    pub state: SegmentState,
}

/// Active decryption parameters for encrypted segments.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionContext {
    pub method: EncryptionMethod,
    pub uri: String,
    pub iv: Option<[u8; 16]>,
    /// Absent until the key loader delivers it.
    pub key: Option<Bytes>,
}

impl EncryptionContext {
    fn from_descriptor(descriptor: &KeyDescriptor) -> Option<Self> {
        if !descriptor.is_encrypting() {
            return None;
        }
        Some(Self {
            method: descriptor.method.clone(),
            uri: descriptor.uri.clone()?,
            iv: descriptor.iv,
            key: None,
        })
    }

    fn describes(&self, descriptor: &KeyDescriptor) -> bool {
        self.method == descriptor.method
            && Some(self.uri.as_str()) == descriptor.uri.as_deref()
            && self.iv == descriptor.iv
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// IV for a segment: the declared one, or the media sequence number as a
    /// big-endian 128-bit value.
    pub fn iv_for(&self, sequence: u64) -> [u8; 16] {
        self.iv.unwrap_or_else(|| {
            let mut iv = [0u8; 16];
            iv[8..].copy_from_slice(&sequence.to_be_bytes());
            iv
        })
    }
}

/// Result of merging a refreshed manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PushOutcome {
    pub new_segments: usize,
    pub evicted: usize,
    /// The active encryption context still needs its key fetched.
    pub key_required: bool,
}

#[derive(Debug, Default)]
pub struct Playlist {
    segments: BTreeMap<u64, Segment>,
    by_url: HashMap<String, u64>,
    target_duration: Option<f64>,
    end_list: bool,
    encryption: Option<EncryptionContext>,
    media_sequence: Option<u64>,
    highest_sequence: Option<u64>,
    /// Timeline position where the next new segment starts.
    next_start: f64,
    loaded: bool,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(&self, manifest: &MediaManifest) -> Result<(), PlaylistError> {
        if let Some(previous) = self.media_sequence
            && manifest.media_sequence < previous
        {
            return Err(PlaylistError::SequenceRegression {
                previous,
                current: manifest.media_sequence,
            });
        }
        for (offset, segment) in manifest.segments.iter().enumerate() {
            let sequence = manifest.media_sequence + offset as u64;
            if segment.uri.trim().is_empty() {
                return Err(PlaylistError::EmptyUri { sequence });
            }
            if !segment.duration.is_finite() || segment.duration < 0.0 {
                return Err(PlaylistError::InvalidDuration {
                    sequence,
                    duration: segment.duration,
                });
            }
        }
        Ok(())
    }

    /// Merge a parsed manifest into the model.
    ///
    /// Existing segments are only confirmed, never replaced. With `is_live`,
    /// downloaded segments that left the manifest window are evicted; segments
    /// that are not yet downloaded are always kept. On error nothing changes.
    pub fn push_playlist(
        &mut self,
        manifest: &MediaManifest,
        is_live: bool,
    ) -> Result<PushOutcome, PlaylistError> {
        self.validate(manifest)?;

        let mut outcome = PushOutcome::default();

        if manifest.target_duration.is_some() {
            self.target_duration = manifest.target_duration;
        }
        self.end_list = manifest.end_list;
        self.media_sequence = Some(manifest.media_sequence);
        self.loaded = true;

        match &manifest.key {
            Some(descriptor) if descriptor.is_encrypting() => {
                let unchanged = self
                    .encryption
                    .as_ref()
                    .is_some_and(|ctx| ctx.describes(descriptor));
                if !unchanged {
                    debug!(uri = ?descriptor.uri, "New encryption context declared");
                    self.encryption = EncryptionContext::from_descriptor(descriptor);
                }
            }
            Some(_) => self.encryption = None,
            None => {}
        }

        for (offset, item) in manifest.segments.iter().enumerate() {
            let sequence = manifest.media_sequence + offset as u64;
            if let Some(existing) = self.segments.get(&sequence) {
                if existing.url != item.uri {
                    warn!(
                        sequence,
                        known = %existing.url,
                        refreshed = %item.uri,
                        "Refresh disagrees on segment URI, keeping the known one"
                    );
                }
                continue;
            }
            if self.highest_sequence.is_some_and(|highest| sequence <= highest) {
                // Already seen and evicted.
                continue;
            }

            let segment = Segment {
                sequence,
                url: item.uri.clone(),
                start: self.next_start,
                duration: item.duration,
                encrypted: item.encrypted,
                state: SegmentState::NotStarted,
            };
            trace!(sequence, start = segment.start, url = %segment.url, "Segment added");
            self.next_start += item.duration;
            self.by_url.insert(segment.url.clone(), sequence);
            self.segments.insert(sequence, segment);
            self.highest_sequence = Some(sequence);
            outcome.new_segments += 1;
        }

        if is_live {
            let window: HashSet<u64> = (0..manifest.segments.len() as u64)
                .map(|offset| manifest.media_sequence + offset)
                .collect();
            let stale: Vec<u64> = self
                .segments
                .values()
                .filter(|s| s.state == SegmentState::Downloaded && !window.contains(&s.sequence))
                .map(|s| s.sequence)
                .collect();
            for sequence in stale {
                if let Some(segment) = self.segments.remove(&sequence) {
                    self.by_url.remove(&segment.url);
                    outcome.evicted += 1;
                }
            }
        }

        outcome.key_required = self.encryption.as_ref().is_some_and(|ctx| !ctx.has_key());
        Ok(outcome)
    }

    /// The earliest segment that has not been requested yet.
    pub fn next_segment(&self) -> Option<&Segment> {
        self.segments
            .values()
            .find(|s| s.state == SegmentState::NotStarted)
    }

    fn transition(
        &mut self,
        url: &str,
        from: SegmentState,
        to: SegmentState,
    ) -> Result<bool, PlaylistError> {
        let sequence = *self
            .by_url
            .get(url)
            .ok_or_else(|| PlaylistError::UnknownSegment(url.to_string()))?;
        let segment = self
            .segments
            .get_mut(&sequence)
            .ok_or_else(|| PlaylistError::UnknownSegment(url.to_string()))?;

        if segment.state == to && to == SegmentState::Downloaded {
            return Ok(false);
        }
        if segment.state != from {
            return Err(PlaylistError::InvalidTransition {
                url: url.to_string(),
                from: segment.state.name(),
                to: to.name(),
            });
        }
        segment.state = to;
        Ok(true)
    }

    pub fn mark_downloading(&mut self, url: &str) -> Result<(), PlaylistError> {
        self.transition(url, SegmentState::NotStarted, SegmentState::Downloading)
            .map(|_| ())
    }

    /// Returns `false` when the segment was already downloaded.
    pub fn mark_downloaded(&mut self, url: &str) -> Result<bool, PlaylistError> {
        self.transition(url, SegmentState::Downloading, SegmentState::Downloaded)
    }

    /// Forget everything for a fresh load.
    pub fn reset_sequence(&mut self) {
        *self = Self::default();
    }

    pub fn segment(&self, sequence: u64) -> Option<&Segment> {
        self.segments.get(&sequence)
    }

    pub fn segment_by_url(&self, url: &str) -> Option<&Segment> {
        self.by_url.get(url).and_then(|seq| self.segments.get(seq))
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn target_duration(&self) -> Option<f64> {
        self.target_duration
    }

    pub fn is_ended(&self) -> bool {
        self.end_list
    }

    /// Whether any manifest has been merged since the last reset.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn media_sequence(&self) -> Option<u64> {
        self.media_sequence
    }

    pub fn encryption(&self) -> Option<&EncryptionContext> {
        self.encryption.as_ref()
    }

    /// Store a fetched key if it belongs to the active context.
    pub fn set_key(&mut self, key_uri: &str, key: Bytes) -> bool {
        match self.encryption.as_mut() {
            Some(ctx) if ctx.uri == key_uri => {
                ctx.key = Some(key);
                true
            }
            _ => false,
        }
    }

    pub fn last_segment_downloaded(&self) -> bool {
        self.segments
            .last_key_value()
            .is_some_and(|(_, s)| s.state == SegmentState::Downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ManifestSegment;
    use proptest::prelude::*;

    fn manifest(media_sequence: u64, count: usize, duration: f64) -> MediaManifest {
        MediaManifest {
            target_duration: Some(duration),
            media_sequence,
            segments: (0..count as u64)
                .map(|i| ManifestSegment {
                    uri: format!("https://example.com/seg{}.ts", media_sequence + i),
                    duration,
                    encrypted: false,
                })
                .collect(),
            end_list: false,
            key: None,
        }
    }

    fn encrypted_manifest(media_sequence: u64, key_uri: &str) -> MediaManifest {
        let mut m = manifest(media_sequence, 2, 4.0);
        for s in &mut m.segments {
            s.encrypted = true;
        }
        m.key = Some(KeyDescriptor {
            method: EncryptionMethod::Aes128,
            uri: Some(key_uri.to_string()),
            iv: None,
        });
        m
    }

    #[test]
    fn push_assigns_cumulative_start_times() {
        let mut playlist = Playlist::new();
        let outcome = playlist.push_playlist(&manifest(0, 3, 4.0), true).unwrap();
        assert_eq!(outcome.new_segments, 3);
        let starts: Vec<f64> = playlist.segments().map(|s| s.start).collect();
        assert_eq!(starts, vec![0.0, 4.0, 8.0]);
        assert_eq!(playlist.target_duration(), Some(4.0));
    }

    #[test]
    fn refresh_appends_and_confirms() {
        let mut playlist = Playlist::new();
        playlist.push_playlist(&manifest(0, 3, 4.0), true).unwrap();
        let outcome = playlist.push_playlist(&manifest(1, 3, 4.0), true).unwrap();
        assert_eq!(outcome.new_segments, 1);
        // seg0 is not downloaded yet, so it survives the window slide.
        assert_eq!(outcome.evicted, 0);
        assert_eq!(playlist.len(), 4);
        assert_eq!(playlist.segment(3).unwrap().start, 12.0);
    }

    #[test]
    fn downloaded_segments_outside_window_are_evicted() {
        let mut playlist = Playlist::new();
        playlist.push_playlist(&manifest(0, 3, 4.0), true).unwrap();
        let url = playlist.next_segment().unwrap().url.clone();
        playlist.mark_downloading(&url).unwrap();
        playlist.mark_downloaded(&url).unwrap();

        let outcome = playlist.push_playlist(&manifest(2, 3, 4.0), true).unwrap();
        assert_eq!(outcome.evicted, 1);
        assert!(playlist.segment(0).is_none());
        assert!(playlist.segment_by_url(&url).is_none());
        // seg1 was never fetched and must not be dropped.
        assert!(playlist.segment(1).is_some());
        assert_eq!(playlist.next_segment().unwrap().sequence, 1);
    }

    #[test]
    fn regression_and_bad_segments_leave_state_untouched() {
        let mut playlist = Playlist::new();
        playlist.push_playlist(&manifest(5, 2, 4.0), true).unwrap();

        let err = playlist.push_playlist(&manifest(3, 4, 4.0), true).unwrap_err();
        assert_eq!(
            err,
            PlaylistError::SequenceRegression {
                previous: 5,
                current: 3
            }
        );

        let mut bad = manifest(6, 3, 4.0);
        bad.segments[2].uri = String::new();
        assert_eq!(
            playlist.push_playlist(&bad, true).unwrap_err(),
            PlaylistError::EmptyUri { sequence: 8 }
        );

        let mut bad = manifest(6, 3, 4.0);
        bad.segments[1].duration = f64::NAN;
        assert!(matches!(
            playlist.push_playlist(&bad, true),
            Err(PlaylistError::InvalidDuration { sequence: 7, .. })
        ));

        assert_eq!(playlist.len(), 2);
        assert_eq!(playlist.media_sequence(), Some(5));
    }

    #[test]
    fn state_transitions_are_one_way() {
        let mut playlist = Playlist::new();
        playlist.push_playlist(&manifest(0, 1, 4.0), true).unwrap();
        let url = "https://example.com/seg0.ts";

        assert!(matches!(
            playlist.mark_downloaded(url),
            Err(PlaylistError::InvalidTransition { .. })
        ));
        playlist.mark_downloading(url).unwrap();
        assert!(matches!(
            playlist.mark_downloading(url),
            Err(PlaylistError::InvalidTransition { .. })
        ));
        assert!(playlist.mark_downloaded(url).unwrap());
        assert!(!playlist.mark_downloaded(url).unwrap());
        assert!(playlist.mark_downloading(url).is_err());
        assert!(playlist.next_segment().is_none());
        assert!(playlist.last_segment_downloaded());
    }

    #[test]
    fn unknown_url_is_reported() {
        let mut playlist = Playlist::new();
        assert!(matches!(
            playlist.mark_downloading("https://nowhere/x.ts"),
            Err(PlaylistError::UnknownSegment(_))
        ));
    }

    #[test]
    fn reset_clears_everything() {
        let mut playlist = Playlist::new();
        playlist
            .push_playlist(&encrypted_manifest(0, "https://example.com/k"), true)
            .unwrap();
        playlist.reset_sequence();
        assert!(playlist.is_empty());
        assert!(playlist.encryption().is_none());
        assert!(!playlist.is_loaded());
        // A fresh source may restart its numbering.
        playlist.push_playlist(&manifest(0, 1, 2.0), true).unwrap();
        assert_eq!(playlist.segment(0).unwrap().start, 0.0);
    }

    #[test]
    fn identical_key_declaration_keeps_fetched_key() {
        let mut playlist = Playlist::new();
        let outcome = playlist
            .push_playlist(&encrypted_manifest(0, "https://example.com/k"), true)
            .unwrap();
        assert!(outcome.key_required);
        assert!(playlist.set_key("https://example.com/k", Bytes::from_static(&[7; 16])));

        let outcome = playlist
            .push_playlist(&encrypted_manifest(1, "https://example.com/k"), true)
            .unwrap();
        assert!(!outcome.key_required);
        assert!(playlist.encryption().unwrap().has_key());

        let outcome = playlist
            .push_playlist(&encrypted_manifest(2, "https://example.com/k2"), true)
            .unwrap();
        assert!(outcome.key_required);
        assert!(!playlist.set_key("https://example.com/k", Bytes::new()));
    }

    #[test]
    fn iv_defaults_to_sequence_number() {
        let ctx = EncryptionContext {
            method: EncryptionMethod::Aes128,
            uri: "k".into(),
            iv: None,
            key: None,
        };
        let iv = ctx.iv_for(0x0102);
        assert_eq!(&iv[..14], &[0u8; 14]);
        assert_eq!(&iv[14..], &[0x01, 0x02]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Sequence numbers stay ordered and every segment walks
        /// not-started -> downloading -> downloaded at most once.
        #[test]
        fn prop_refreshes_keep_order_and_single_download(
            steps in proptest::collection::vec((0u64..3, 1usize..5), 1..12),
        ) {
            let mut playlist = Playlist::new();
            let mut media_sequence = 0u64;
            let mut downloads = HashMap::<u64, u32>::new();

            for (advance, count) in steps {
                media_sequence += advance;
                playlist.push_playlist(&manifest(media_sequence, count, 2.0), true).unwrap();

                let sequences: Vec<u64> = playlist.segments().map(|s| s.sequence).collect();
                let mut sorted = sequences.clone();
                sorted.sort_unstable();
                prop_assert_eq!(&sequences, &sorted);

                if let Some(next) = playlist.next_segment().cloned() {
                    playlist.mark_downloading(&next.url).unwrap();
                    prop_assert!(playlist.mark_downloaded(&next.url).unwrap());
                    prop_assert!(!playlist.mark_downloaded(&next.url).unwrap());
                    *downloads.entry(next.sequence).or_default() += 1;
                }
            }

            prop_assert!(downloads.values().all(|n| *n == 1));
        }
    }
}
