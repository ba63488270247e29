// OTA (Over-The-Air) update module

pub mod bundle;
pub mod download;
pub mod error;
pub mod manager;
pub mod partition;
pub mod release;
pub mod session;

pub use download::{DownloadProgress, HeapFloor, RetryPolicy, StreamDownloader, Transfer};
pub use error::OtaError;
pub use manager::{OtaManager, OtaState, UpdateContext, UpdateDescriptor, UpdateOutcome};
pub use partition::PartitionSelector;
pub use session::UpdateSession;

// OTA update flow:
// 1. Check for updates (manifest, falling back to the release API)
// 2. Download firmware into the inactive OTA slot
// 3. Download the filesystem image (separately or from the same bundle)
// 4. Set boot partition and record the version for its label
// 5. Restart; the boot validator confirms or rolls back the new image
