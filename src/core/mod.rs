pub mod archive;
pub mod mirror;
pub mod orchestrator;
pub mod ownership;
pub mod passphrase;
pub mod prompt;
pub mod transfer;
pub mod volume;

pub use archive::{ArchiveArtifact, ArchiveBuilder, ArchiveKind, BuildOutcome};
pub use mirror::{MirrorStage, MirrorSummary};
pub use orchestrator::{Interrupted, Orchestrator, RunLock, RunMode};
pub use ownership::{FileOwner, resolve_owner};
pub use passphrase::Passphrase;
pub use prompt::{Prompter, ScriptedPrompter, TerminalPrompter};
pub use transfer::{TransferError, TransferStage};
pub use volume::{EncryptedVolume, MountTable, VolumeError};
