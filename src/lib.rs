//! luksbak — periodic encrypted-backup orchestration.
//!
//! Brings a LUKS volume online, archives configured directories through a
//! streaming `tar | pv | gzip` pipeline, copies the artifact onto the volume
//! and/or ships a gpg-encrypted copy to a remote host, mirrors further
//! directories with delete-aware rsync, and takes the volume offline again.
//! The volume is never left mounted and no staged archive outlives a run,
//! interrupted or not.

pub mod config;
pub mod context;
pub mod core;
pub mod logging;
pub mod runner;
