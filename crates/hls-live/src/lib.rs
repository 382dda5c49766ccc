//! # hls-live
//!
//! Playback orchestration for live HLS streams.
//!
//! The crate keeps a sliding live playlist up to date, fetches each segment
//! exactly once, decrypts AES-128 segments, feeds fragments to a demuxer and
//! remuxer strictly in order, and appends the output to a platform playback
//! buffer. When the stream's track layout changes mid-stream the buffer is
//! torn down and rebuilt once playback stalls.
//!
//! Demuxing, remuxing, the playback buffer and the viewer are supplied by the
//! embedder through the traits in [`collaborators`]. An HTTP loader and an
//! AES-128 cipher are provided.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hls_live::{
//!     Aes128CipherFactory, Collaborators, EventBus, HttpLoader, HttpLoaderConfig, LiveConfig,
//!     LiveController, M3u8Parser, SystemClock, driver,
//! };
//! # fn embedder_parts() -> (
//! #     Box<dyn hls_live::DemuxerFactory>,
//! #     Box<dyn hls_live::Remuxer>,
//! #     Box<dyn hls_live::BufferFactory>,
//! #     Box<dyn hls_live::MediaElement>,
//! # ) { unimplemented!() }
//!
//! # async fn example() -> Result<(), hls_live::HlsLiveError> {
//! let (bus, events) = EventBus::new(64);
//! let http = HttpLoader::new(reqwest::Client::new(), bus.clone(), HttpLoaderConfig::default());
//! let (demuxer_factory, remuxer, buffer_factory, media) = embedder_parts();
//!
//! let collaborators = Collaborators {
//!     playlist_loader: Box::new(http.clone()),
//!     segment_loader: Box::new(http.clone()),
//!     key_loader: Box::new(http),
//!     parser: Box::new(M3u8Parser::new()),
//!     cipher_factory: Box::new(Aes128CipherFactory::new(true)),
//!     demuxer_factory,
//!     remuxer,
//!     buffer_factory,
//!     media,
//!     clock: Arc::new(SystemClock),
//! };
//!
//! let mut controller = LiveController::new(LiveConfig::default(), collaborators, bus.clone())?;
//! let mut player_events = bus.subscribe();
//! controller.load("https://example.com/live/index.m3u8")?;
//! let handle = driver::spawn(controller, events);
//!
//! while let Ok(event) = player_events.recv().await {
//!     println!("{event:?}");
//! }
//! handle.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod decryption;
pub mod driver;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod parser;
pub mod pipeline;
pub mod playlist;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{LifecycleState, MediaInfo};
pub use collaborators::{
    BufferFactory, Cipher, CipherFactory, Collaborators, Demuxer, DemuxerFactory, LoadRequest,
    Loader, MediaElement, PlaybackBuffer, ReadyState, Remuxer, SourceHandle, TimeRange,
};
pub use config::{LiveConfig, RetryConfig};
pub use controller::LiveController;
pub use decryption::{Aes128Cipher, Aes128CipherFactory};
pub use error::{
    ConfigError, DecryptionError, ErrorCategory, ErrorCode, HlsLiveError, LoadError,
    PlaybackError, PlaylistError,
};
pub use events::{
    BufferEvent, CipherEvent, DemuxEvent, EventBus, EventReceiver, LoaderEvent, LoaderKind,
    MediaEvent, PipelineEvent, PlayerEvent, RemuxEvent, RetryInfo, TrackType,
};
pub use fetcher::{HttpLoader, HttpLoaderConfig};
pub use parser::{M3u8Parser, Manifest, PlaylistParser};
pub use pipeline::Fragment;
pub use scheduler::{Clock, ManualClock, SystemClock};
