//! Native credential prompt seam.
//!
//! The pinentry never draws UI itself; it hands a [`PinRequest`] or
//! [`ConfirmRequest`] to whatever implements [`PinPrompt`] — a Windows
//! CredUI dialog, a helper subprocess, or a test double.

use async_trait::async_trait;
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// The user dismissed the dialog.
    #[error("operation canceled")]
    Canceled,

    #[error("prompt failed: {0}")]
    Failed(String),
}

/// A passphrase dialog request.
#[derive(Debug, Clone, Default)]
pub struct PinRequest {
    /// Window title.
    pub title: String,
    /// Long description of what is being asked for.
    pub description: String,
    /// Short label next to the input field.
    pub prompt: String,
    /// Error text from a previous attempt, shown above the description.
    pub error: String,
    /// Offer a "remember this" checkbox.
    pub offer_save: bool,
}

/// The user's answer to a [`PinRequest`].
pub struct PinResponse {
    pub password: Zeroizing<String>,
    /// The user ticked the "remember this" checkbox.
    pub save_requested: bool,
}

impl std::fmt::Debug for PinResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinResponse")
            .field("password", &"[redacted]")
            .field("save_requested", &self.save_requested)
            .finish()
    }
}

/// A yes/no or acknowledge-only dialog request.
#[derive(Debug, Clone, Default)]
pub struct ConfirmRequest {
    pub title: String,
    pub description: String,
    pub prompt: String,
    /// Show a single OK button instead of yes/no.
    pub one_button: bool,
}

/// The native dialog surface.
#[async_trait]
pub trait PinPrompt: Send + Sync {
    /// Ask for a passphrase.  [`PromptError::Canceled`] when dismissed.
    async fn prompt_pin(&self, request: &PinRequest) -> Result<PinResponse, PromptError>;

    /// Ask for confirmation; `false` means declined.  One-button requests
    /// always come back `true` once acknowledged.
    async fn confirm(&self, request: &ConfirmRequest) -> Result<bool, PromptError>;
}
