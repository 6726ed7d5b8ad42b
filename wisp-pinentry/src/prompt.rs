//! Subprocess prompt launcher.
//!
//! The dialog is an external helper program speaking JSON over its stdio:
//! one request object on stdin, one response object on stdout.
//!
//! **Exit codes**: 0 = confirmed, 1 = cancelled, anything else = helper
//! failure.
//!
//! Pin request/response:
//! ```json
//! {"kind":"pin","title":"…","description":"…","prompt":"…","error":"…","offer_save":true}
//! {"password":"hunter2","save":true}
//! ```
//!
//! Confirm request (response body is ignored, the exit code answers):
//! ```json
//! {"kind":"confirm","title":"…","description":"…","prompt":"…","one_button":false}
//! ```

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use zeroize::Zeroizing;

use wisp_core::config::PinDialogConfig;
use wisp_core::{ConfirmRequest, PinPrompt, PinRequest, PinResponse, PromptError};

/// Helper used when the configuration names none.
const DEFAULT_HELPER: &str = "wisp-dialog";

#[derive(Debug, Serialize)]
struct HelperRequest<'a> {
    kind: &'static str,
    title: &'a str,
    description: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    error: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    offer_save: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    one_button: bool,
}

#[derive(Deserialize)]
struct HelperResponse {
    #[serde(default)]
    password: String,
    #[serde(default)]
    save: bool,
}

/// [`PinPrompt`] over a helper subprocess.
pub struct ExecPrompt {
    program: String,
    args: Vec<String>,
}

impl ExecPrompt {
    pub fn from_config(cfg: &PinDialogConfig) -> Self {
        let program = if cfg.program.is_empty() {
            DEFAULT_HELPER.to_string()
        } else {
            cfg.program.clone()
        };
        Self {
            program,
            args: cfg.args.clone(),
        }
    }

    /// Run the helper once.  `Ok(None)` means the user cancelled.
    async fn run(&self, request: &HelperRequest<'_>) -> Result<Option<Vec<u8>>, PromptError> {
        let payload =
            serde_json::to_vec(request).map_err(|err| PromptError::Failed(err.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| PromptError::Failed(format!("cannot run {}: {err}", self.program)))?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin
            .write_all(&payload)
            .await
            .map_err(|err| PromptError::Failed(format!("writing to helper: {err}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| PromptError::Failed(format!("waiting for helper: {err}")))?;

        match output.status.code() {
            Some(0) => Ok(Some(output.stdout)),
            Some(1) => {
                debug!(program = %self.program, "helper reported cancellation");
                Ok(None)
            }
            status => Err(PromptError::Failed(format!(
                "helper {} exited with {status:?}",
                self.program
            ))),
        }
    }
}

#[async_trait]
impl PinPrompt for ExecPrompt {
    async fn prompt_pin(&self, request: &PinRequest) -> Result<PinResponse, PromptError> {
        let helper_request = HelperRequest {
            kind: "pin",
            title: &request.title,
            description: &request.description,
            prompt: &request.prompt,
            error: &request.error,
            offer_save: request.offer_save,
            one_button: false,
        };
        let stdout = self
            .run(&helper_request)
            .await?
            .ok_or(PromptError::Canceled)?;
        let response: HelperResponse = serde_json::from_slice(&stdout)
            .map_err(|err| PromptError::Failed(format!("bad helper response: {err}")))?;
        Ok(PinResponse {
            password: Zeroizing::new(response.password),
            save_requested: response.save,
        })
    }

    async fn confirm(&self, request: &ConfirmRequest) -> Result<bool, PromptError> {
        let helper_request = HelperRequest {
            kind: "confirm",
            title: &request.title,
            description: &request.description,
            prompt: &request.prompt,
            error: "",
            offer_save: false,
            one_button: request.one_button,
        };
        // a one-button dialog acknowledges; a cancelled yes/no means "no"
        Ok(self.run(&helper_request).await?.is_some() || request.one_button)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_request_serialization_drops_empty_fields() {
        let request = HelperRequest {
            kind: "pin",
            title: "t",
            description: "d",
            prompt: "p",
            error: "",
            offer_save: true,
            one_button: false,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("error"));
        assert!(!json.contains("one_button"));
        assert!(json.contains("\"offer_save\":true"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_round_trips_through_a_shell_helper() {
        // a stand-in helper: reads stdin, answers a fixed password
        let prompt = ExecPrompt {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"cat >/dev/null; printf '{"password":"from-helper","save":true}'"#.to_string(),
            ],
        };
        let response = prompt
            .prompt_pin(&PinRequest {
                prompt: "PIN:".to_string(),
                ..PinRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(response.password.as_str(), "from-helper");
        assert!(response.save_requested);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_one_is_cancellation() {
        let prompt = ExecPrompt {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "cat >/dev/null; exit 1".to_string()],
        };
        let err = prompt.prompt_pin(&PinRequest::default()).await.unwrap_err();
        assert!(matches!(err, PromptError::Canceled));

        let prompt = ExecPrompt {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "cat >/dev/null; exit 1".to_string()],
        };
        let confirmed = prompt.confirm(&ConfirmRequest::default()).await.unwrap();
        assert!(!confirmed);
    }

    #[tokio::test]
    async fn missing_helper_is_a_failure() {
        let prompt = ExecPrompt {
            program: "/nonexistent/wisp-dialog".to_string(),
            args: vec![],
        };
        let err = prompt.prompt_pin(&PinRequest::default()).await.unwrap_err();
        assert!(matches!(err, PromptError::Failed(_)));
    }
}
