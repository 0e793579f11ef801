// HLS acquisition: playlist, keys, fetch, decrypt, progress and control for one transfer

pub mod artifacts;
pub mod control;
pub mod decryption;
pub mod engine;
pub mod fetcher;
pub mod key;
pub mod playlist;
pub mod progress;
pub mod retry;
pub mod state;

pub use artifacts::{CleanupReport, SegmentStore};
pub use control::TransferControl;
pub use decryption::{Decryptor, decrypt_segment};
pub use engine::{AcquisitionEngine, SharedState, TransferRequest, TransferServices};
pub use fetcher::{FetchResult, SegmentDownloader, SegmentFetcher};
pub use key::{KeyMaterial, KeyResolver, parse_iv};
pub use playlist::{
    KeyDescriptor, ParsedPlaylist, PlaylistDescriptor, Segment, load_playlist, parse_playlist,
};
pub use progress::{ProgressReport, ProgressTracker};
pub use retry::{Attempted, BackoffPolicy, RetryAction, RetryPolicy, retry_with_backoff};
pub use state::{
    SegmentFailure, SegmentOutcome, SegmentResult, TransferSnapshot, TransferState,
    TransferStatus,
};
