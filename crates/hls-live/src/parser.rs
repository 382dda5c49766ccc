// Playlist parsing: turns manifest text into the model consumed by the tracker.

use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist as M3u8Playlist, parse_playlist_res};
use tracing::{debug, trace};
use url::Url;

use crate::error::PlaylistError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionMethod {
    None,
    Aes128,
    SampleAes,
    Other(String),
}

/// An `EXT-X-KEY` declaration with its URI already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub method: EncryptionMethod,
    pub uri: Option<String>,
    pub iv: Option<[u8; 16]>,
}

impl KeyDescriptor {
    /// Whether segments under this key must be decrypted before demux.
    pub fn is_encrypting(&self) -> bool {
        self.method != EncryptionMethod::None && self.uri.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestSegment {
    pub uri: String,
    pub duration: f64,
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaManifest {
    pub target_duration: Option<f64>,
    pub media_sequence: u64,
    pub segments: Vec<ManifestSegment>,
    pub end_list: bool,
    /// The last key declaration in the manifest, which applies to its tail.
    pub key: Option<KeyDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    /// Multi-variant playlist; playback follows `variant_uri`.
    Master { variant_uri: String },
    Media(MediaManifest),
}

/// Parses manifest bytes fetched from `playlist_url`.
pub trait PlaylistParser: Send {
    fn parse(&self, text: &[u8], playlist_url: &str) -> Result<Manifest, PlaylistError>;
}

/// Default parser backed by `m3u8-rs`.
#[derive(Debug, Clone, Default)]
pub struct M3u8Parser;

impl M3u8Parser {
    pub fn new() -> Self {
        Self
    }

    fn resolve(base: Option<&Url>, uri: &str) -> String {
        match base {
            Some(base) => base
                .join(uri)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| uri.to_string()),
            None => uri.to_string(),
        }
    }

    fn parse_iv(raw: &str) -> Result<[u8; 16], PlaylistError> {
        let digits = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        let bytes = hex::decode(digits).map_err(|_| PlaylistError::InvalidIv(raw.to_string()))?;
        if bytes.len() > 16 {
            return Err(PlaylistError::InvalidIv(raw.to_string()));
        }
        // Short IVs are left-padded with zeros.
        let mut iv = [0u8; 16];
        iv[16 - bytes.len()..].copy_from_slice(&bytes);
        Ok(iv)
    }

    fn convert_key(
        key: &m3u8_rs::Key,
        base: Option<&Url>,
    ) -> Result<KeyDescriptor, PlaylistError> {
        let method = match &key.method {
            KeyMethod::None => EncryptionMethod::None,
            KeyMethod::AES128 => EncryptionMethod::Aes128,
            KeyMethod::SampleAES => EncryptionMethod::SampleAes,
            KeyMethod::Other(other) => EncryptionMethod::Other(other.clone()),
        };
        let iv = key.iv.as_deref().map(Self::parse_iv).transpose()?;
        Ok(KeyDescriptor {
            method,
            uri: key.uri.as_deref().map(|uri| Self::resolve(base, uri)),
            iv,
        })
    }

    fn convert_media(
        playlist: MediaPlaylist,
        base: Option<&Url>,
    ) -> Result<MediaManifest, PlaylistError> {
        let mut current_key: Option<KeyDescriptor> = None;
        let mut segments = Vec::with_capacity(playlist.segments.len());

        for segment in &playlist.segments {
            // A key applies to every following segment until the next declaration.
            if let Some(key) = &segment.key {
                current_key = Some(Self::convert_key(key, base)?);
            }
            segments.push(ManifestSegment {
                uri: Self::resolve(base, &segment.uri),
                duration: f64::from(segment.duration),
                encrypted: current_key.as_ref().is_some_and(KeyDescriptor::is_encrypting),
            });
        }

        let target_duration = (playlist.target_duration > 0).then(|| playlist.target_duration as f64);

        trace!(
            media_sequence = playlist.media_sequence,
            segments = segments.len(),
            end_list = playlist.end_list,
            "Parsed media playlist"
        );

        Ok(MediaManifest {
            target_duration,
            media_sequence: playlist.media_sequence,
            segments,
            end_list: playlist.end_list,
            key: current_key,
        })
    }
}

impl PlaylistParser for M3u8Parser {
    fn parse(&self, text: &[u8], playlist_url: &str) -> Result<Manifest, PlaylistError> {
        std::str::from_utf8(text).map_err(|e| PlaylistError::Encoding(e.to_string()))?;
        let base = Url::parse(playlist_url).ok();

        match parse_playlist_res(text) {
            Ok(M3u8Playlist::MasterPlaylist(master)) => {
                let variant = master.variants.first().ok_or(PlaylistError::NoVariants)?;
                let variant_uri = Self::resolve(base.as_ref(), &variant.uri);
                debug!(%variant_uri, "Master playlist redirects to first variant");
                Ok(Manifest::Master { variant_uri })
            }
            Ok(M3u8Playlist::MediaPlaylist(media)) => {
                Self::convert_media(media, base.as_ref()).map(Manifest::Media)
            }
            Err(e) => Err(PlaylistError::Parse(e.to_string())),
        }
    }
}
