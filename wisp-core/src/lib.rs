//! Shared building blocks for the wisp workspace.
//!
//! Everything here is policy-free: the resolved configuration record, the
//! session-lock gate observed by connection tasks, well-known socket names
//! and limits, and the two collaborator seams the pinentry depends on (the
//! OS credential vault and the native credential prompt).

pub mod config;
pub mod gate;
pub mod names;
pub mod prompt;
pub mod vault;

pub use config::Config;
pub use gate::SessionGate;
pub use prompt::{ConfirmRequest, PinPrompt, PinRequest, PinResponse, PromptError};
pub use vault::{CredentialVault, MemoryVault, VaultError};
