//! The pinentry command set.
//!
//! An Assuan server whose per-connection state is [`Settings`]; the dialog
//! itself is behind [`PinPrompt`] and passphrase caching behind
//! [`CredentialVault`].  `GETPIN` consults the cache first when the
//! upstream allows it, runs the ask-twice loop when a repeat prompt is set,
//! and stores the result when the user asked for that.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use wisp_assuan::error::{ProtocolError, codes};
use wisp_assuan::pipe::BoxedPipe;
use wisp_assuan::server::{Handler, Proto, handler_fn};
use wisp_core::{
    ConfirmRequest, CredentialVault, PinPrompt, PinRequest, PromptError, VaultError,
};

use crate::settings::Settings;

const GREETING: &str = "wisp-pinentry ready";
const FLAVOR: &str = "wisp";

fn canceled() -> wisp_assuan::Error {
    ProtocolError::pinentry(codes::CANCELED, "operation canceled").into()
}

fn prompt_failed(err: PromptError) -> wisp_assuan::Error {
    match err {
        PromptError::Canceled => canceled(),
        PromptError::Failed(msg) => {
            ProtocolError::pinentry(codes::ASS_GENERAL, format!("prompt failed: {msg}")).into()
        }
    }
}

/// The pinentry protocol with its collaborators bound.
pub struct PinentryServer {
    vault: Arc<dyn CredentialVault>,
    prompt: Arc<dyn PinPrompt>,
    vault_prefix: String,
    version: String,
    defaults: Settings,
}

impl PinentryServer {
    pub fn new(
        vault: Arc<dyn CredentialVault>,
        prompt: Arc<dyn PinPrompt>,
        vault_prefix: impl Into<String>,
        version: impl Into<String>,
        defaults: Settings,
    ) -> Arc<Self> {
        Arc::new(Self {
            vault,
            prompt,
            vault_prefix: vault_prefix.into(),
            version: version.into(),
            defaults,
        })
    }

    /// Vault name for a `SETKEYINFO` value.
    fn credential_name(&self, key: &str) -> String {
        format!("{}={}", self.vault_prefix, key)
    }

    /// Build the protocol table.  One table serves any number of
    /// connections; each gets a fresh copy of the defaults.
    pub fn proto(self: &Arc<Self>) -> Proto<Settings> {
        let defaults = self.defaults.clone();
        let reset_defaults = self.defaults.clone();

        let proto = Proto::new(GREETING, move || defaults.clone())
            .handler("SETDESC", setter(|s, v| s.desc = v.to_string()))
            .handler("SETPROMPT", setter(|s, v| s.prompt = v.to_string()))
            .handler("SETREPEAT", setter(|s, v| s.repeat_prompt = v.to_string()))
            .handler("SETREPEATERROR", setter(|s, v| s.repeat_error = v.to_string()))
            .handler("SETERROR", setter(|s, v| s.error = v.to_string()))
            .handler("SETOK", setter(|s, v| s.ok_btn = v.to_string()))
            .handler("SETNOTOK", setter(|s, v| s.not_ok_btn = v.to_string()))
            .handler("SETCANCEL", setter(|s, v| s.cancel_btn = v.to_string()))
            .handler("SETTITLE", setter(|s, v| s.title = v.to_string()))
            .handler("SETQUALITYBAR", setter(|s, v| s.quality_bar = v.to_string()))
            .handler(
                "SETQUALITYBAR_TT",
                setter(|s, v| s.quality_bar_tooltip = v.to_string()),
            )
            .handler("SETGENPIN", setter(|s, v| s.gen_pin_label = v.to_string()))
            .handler("SETGENPIN_TT", setter(|s, v| s.gen_pin_tooltip = v.to_string()))
            .handler(
                "SETKEYINFO",
                setter(|s, v| {
                    if v.is_empty() || v == "--clear" {
                        s.key_info.clear();
                    } else {
                        s.key_info = v.to_string();
                    }
                }),
            )
            .handler(
                "SETTIMEOUT",
                handler_fn(|_pipe, state: &mut Settings, params| {
                    Box::pin(async move {
                        let seconds: i64 = params.trim().parse().map_err(|_| {
                            wisp_assuan::Error::from(ProtocolError::pinentry(
                                codes::ASS_INV_VALUE,
                                "invalid timeout value",
                            ))
                        })?;
                        state.timeout = Duration::from_secs(seconds.max(0) as u64);
                        Ok(())
                    })
                }),
            )
            .handler(
                "RESET",
                handler_fn(move |_pipe, state: &mut Settings, _params| {
                    let defaults = reset_defaults.clone();
                    Box::pin(async move {
                        *state = defaults;
                        Ok(())
                    })
                }),
            )
            .set_option(set_option);

        let srv = Arc::clone(self);
        let proto = proto.handler(
            "GETINFO",
            handler_fn(move |pipe, _state: &mut Settings, params| {
                let srv = Arc::clone(&srv);
                Box::pin(async move { srv.getinfo(pipe, params).await })
            }),
        );

        let srv = Arc::clone(self);
        let proto = proto.handler(
            "CLEARPASSPHRASE",
            handler_fn(move |_pipe, _state: &mut Settings, params| {
                let srv = Arc::clone(&srv);
                Box::pin(async move { srv.clear_passphrase(params).await })
            }),
        );

        let srv = Arc::clone(self);
        let proto = proto.handler(
            "GETPIN",
            handler_fn(move |pipe, state: &mut Settings, params| {
                let srv = Arc::clone(&srv);
                Box::pin(async move { srv.getpin(pipe, state, params).await })
            }),
        );

        let srv = Arc::clone(self);
        let proto = proto.handler(
            "CONFIRM",
            handler_fn(move |_pipe, state: &mut Settings, params| {
                let srv = Arc::clone(&srv);
                Box::pin(async move { srv.confirm(state, params).await })
            }),
        );

        let srv = Arc::clone(self);
        proto.handler(
            "MESSAGE",
            handler_fn(move |_pipe, state: &mut Settings, params| {
                let srv = Arc::clone(&srv);
                Box::pin(async move { srv.message(state, params).await })
            }),
        )
    }

    async fn getinfo(&self, pipe: &mut BoxedPipe, params: &str) -> Result<(), wisp_assuan::Error> {
        let value = match params.trim() {
            "flavor" => FLAVOR.to_string(),
            "version" => self.version.clone(),
            // gnupg_allow_set_foreground_window cannot use our real pid;
            // -1 inhibits the handoff instead of failing it
            "pid" => "-1".to_string(),
            "ttyinfo" => "- - -".to_string(),
            other => {
                return Err(ProtocolError::pinentry(
                    codes::ASS_PARAMETER,
                    format!("GETINFO unknown parameter value: {other}"),
                )
                .into());
            }
        };
        pipe.write_data(value.as_bytes()).await
    }

    async fn clear_passphrase(&self, params: &str) -> Result<(), wisp_assuan::Error> {
        let key = params.trim();
        let name = self.credential_name(key);
        match self.vault.delete(&name).await {
            Ok(()) => Ok(()),
            Err(VaultError::Delete(msg)) => {
                warn!(%name, "cannot delete credential: {msg}");
                Err(ProtocolError::pinentry(
                    codes::ASS_INV_VALUE,
                    "CLEARPASSPHRASE cannot delete credential",
                )
                .into())
            }
            Err(err) => {
                warn!(%name, "vault access failed: {err}");
                Err(ProtocolError::pinentry(
                    codes::ASS_GENERAL,
                    "CLEARPASSPHRASE cannot access vault",
                )
                .into())
            }
        }
    }

    async fn getpin(
        &self,
        pipe: &mut BoxedPipe,
        state: &mut Settings,
        params: &str,
    ) -> Result<(), wisp_assuan::Error> {
        state.cmd_args = params.to_string();
        debug!(desc = %state.desc, repeat = !state.repeat_prompt.is_empty(), "GETPIN");

        // the upstream calls this "reading from the password cache"; only a
        // clean first attempt qualifies
        if state.error.is_empty() && state.repeat_prompt.is_empty() && state.cache_allowed() {
            match self.vault.lookup(&self.credential_name(&state.key_info)).await {
                Ok(Some(cached)) if !cached.is_empty() => {
                    pipe.write_status("PASSWORD_FROM_CACHE").await?;
                    return pipe.write_data(&cached).await;
                }
                Ok(_) => {}
                Err(err) => {
                    // a broken vault must not block the dialog, but caching
                    // is off for the rest of this connection
                    warn!("vault lookup failed: {err}");
                    state.opts.allow_external_password_cache = false;
                }
            }
        }

        let offer_save = state.cache_allowed();
        let mut attempt = 0u32;
        let (password, save_requested) = loop {
            let error_text = if attempt == 0 {
                state.error.clone()
            } else {
                state.repeat_error_text().to_string()
            };
            attempt += 1;

            let first = self
                .prompt
                .prompt_pin(&PinRequest {
                    title: state.title.clone(),
                    description: state.desc.clone(),
                    prompt: state.prompt.clone(),
                    error: error_text,
                    offer_save,
                })
                .await
                .map_err(prompt_failed)?;

            if state.repeat_prompt.is_empty() {
                break (first.password, first.save_requested);
            }

            let second = self
                .prompt
                .prompt_pin(&PinRequest {
                    title: state.title.clone(),
                    description: state.desc.clone(),
                    prompt: state.repeat_prompt.clone(),
                    error: String::new(),
                    offer_save: false,
                })
                .await
                .map_err(prompt_failed)?;

            if first.password.as_str() == second.password.as_str() {
                pipe.write_status("PIN_REPEATED").await?;
                break (first.password, first.save_requested);
            }
        };

        // an empty password is never worth caching
        if offer_save && save_requested && !password.is_empty() {
            let name = self.credential_name(&state.key_info);
            if let Err(err) = self.vault.store(&name, password.as_bytes()).await {
                warn!(%name, "unable to store credential: {err}");
            }
        }
        pipe.write_data(password.as_bytes()).await
    }

    async fn confirm(&self, state: &mut Settings, params: &str) -> Result<(), wisp_assuan::Error> {
        state.cmd_args = params.to_string();
        let one_button = params.trim() == "--one-button";
        debug!(one_button, "CONFIRM");
        let confirmed = self
            .prompt
            .confirm(&ConfirmRequest {
                title: state.title.clone(),
                description: state.desc.clone(),
                prompt: state.prompt.clone(),
                one_button,
            })
            .await
            .map_err(prompt_failed)?;
        if confirmed { Ok(()) } else { Err(canceled()) }
    }

    async fn message(&self, state: &mut Settings, params: &str) -> Result<(), wisp_assuan::Error> {
        state.cmd_args = params.to_string();
        debug!("MESSAGE");
        if let Err(err) = self
            .prompt
            .confirm(&ConfirmRequest {
                title: state.title.clone(),
                description: state.desc.clone(),
                prompt: state.prompt.clone(),
                one_button: true,
            })
            .await
        {
            // an acknowledgment box has no failure mode worth reporting
            debug!("message dialog failed: {err}");
        }
        Ok(())
    }
}

/// A plain field setter as a command handler.
fn setter(
    apply: impl Fn(&mut Settings, &str) + Copy + Send + Sync + 'static,
) -> Handler<Settings> {
    handler_fn(move |_pipe, state, params| {
        Box::pin(async move {
            apply(state, params);
            Ok(())
        })
    })
}

/// `OPTION` handling: the known set mutates [`Settings::opts`], anything
/// starting with `default-` is silently accepted, the rest is refused.
fn set_option(state: &mut Settings, key: &str, value: &str) -> Result<(), wisp_assuan::Error> {
    match key {
        "grab" => state.opts.grab = true,
        "no-grab" => state.opts.grab = false,
        "ttytype" => state.opts.tty_type = value.to_string(),
        "ttyname" => state.opts.tty_name = value.to_string(),
        "ttyalert" => state.opts.tty_alert = value.to_string(),
        "lc-ctype" => state.opts.lc_ctype = value.to_string(),
        "lc-messages" => state.opts.lc_messages = value.to_string(),
        "owner" => state.opts.owner = value.to_string(),
        "touch-file" => state.opts.touch_file = value.to_string(),
        "parent-wid" => state.opts.parent_wid = value.to_string(),
        "invisible-char" => state.opts.invisible_char = value.to_string(),
        "allow-external-password-cache" => state.opts.allow_external_password_cache = true,
        _ if key.starts_with("default-") => {}
        _ => {
            return Err(ProtocolError::pinentry(
                codes::UNKNOWN_OPTION,
                format!("unknown option: {key}"),
            )
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use zeroize::Zeroizing;

    use wisp_core::{MemoryVault, PinResponse};

    #[derive(Default)]
    struct ScriptedPrompt {
        pins: Mutex<VecDeque<Result<(String, bool), PromptError>>>,
        confirms: Mutex<VecDeque<Result<bool, PromptError>>>,
        pin_requests: Mutex<Vec<PinRequest>>,
        confirm_requests: Mutex<Vec<ConfirmRequest>>,
    }

    impl ScriptedPrompt {
        fn pin(self, password: &str, save: bool) -> Self {
            self.pins
                .lock()
                .unwrap()
                .push_back(Ok((password.to_string(), save)));
            self
        }

        fn pin_canceled(self) -> Self {
            self.pins.lock().unwrap().push_back(Err(PromptError::Canceled));
            self
        }

        fn confirmation(self, answer: bool) -> Self {
            self.confirms.lock().unwrap().push_back(Ok(answer));
            self
        }
    }

    #[async_trait]
    impl PinPrompt for ScriptedPrompt {
        async fn prompt_pin(&self, request: &PinRequest) -> Result<PinResponse, PromptError> {
            self.pin_requests.lock().unwrap().push(request.clone());
            let (password, save_requested) = self
                .pins
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected pin prompt")?;
            Ok(PinResponse {
                password: Zeroizing::new(password),
                save_requested,
            })
        }

        async fn confirm(&self, request: &ConfirmRequest) -> Result<bool, PromptError> {
            self.confirm_requests.lock().unwrap().push(request.clone());
            self.confirms
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected confirm prompt")
        }
    }

    struct Fixture {
        vault: Arc<MemoryVault>,
        prompt: Arc<ScriptedPrompt>,
        server: Arc<PinentryServer>,
    }

    fn fixture(prompt: ScriptedPrompt) -> Fixture {
        let vault = Arc::new(MemoryVault::new());
        let prompt = Arc::new(prompt);
        let server = PinentryServer::new(
            Arc::clone(&vault) as Arc<dyn CredentialVault>,
            Arc::clone(&prompt) as Arc<dyn PinPrompt>,
            "GnuPG:PinGO",
            "0.3.0",
            Settings::default(),
        );
        Fixture { vault, prompt, server }
    }

    async fn run_script(fixture: &Fixture, input: &str) -> String {
        let proto = fixture.server.proto();
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (mut peer_read, mut peer_write) = tokio::io::split(theirs);
        let serve = wisp_assuan::server::serve(ours, &proto);
        let drive = async {
            peer_write.write_all(input.as_bytes()).await.unwrap();
            peer_write.shutdown().await.unwrap();
            let mut out = Vec::new();
            peer_read.read_to_end(&mut out).await.unwrap();
            String::from_utf8(out).unwrap()
        };
        let (res, out) = tokio::join!(serve, drive);
        res.unwrap();
        out
    }

    #[tokio::test]
    async fn getpin_returns_password_as_data() {
        let fx = fixture(ScriptedPrompt::default().pin("hunter2", false));
        let out = run_script(
            &fx,
            "SETDESC Unlock the key\nSETPROMPT Passphrase:\nGETPIN\nBYE\n",
        )
        .await;
        assert!(out.contains("D hunter2\nOK\n"), "got {out:?}");
        let seen = fx.prompt.pin_requests.lock().unwrap();
        assert_eq!(seen[0].description, "Unlock the key");
        assert_eq!(seen[0].prompt, "Passphrase:");
        assert!(!seen[0].offer_save);
    }

    #[tokio::test]
    async fn getpin_cache_hit_skips_the_prompt() {
        let fx = fixture(ScriptedPrompt::default());
        fx.vault
            .store("GnuPG:PinGO=n/KEY", b"cached-secret")
            .await
            .unwrap();
        let out = run_script(
            &fx,
            "OPTION allow-external-password-cache\nSETKEYINFO n/KEY\nGETPIN\nBYE\n",
        )
        .await;
        assert!(
            out.contains("S PASSWORD_FROM_CACHE\nD cached-secret\nOK\n"),
            "got {out:?}"
        );
        assert!(fx.prompt.pin_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn getpin_cache_miss_prompts_and_stores_on_request() {
        let fx = fixture(ScriptedPrompt::default().pin("fresh-pass", true));
        let out = run_script(
            &fx,
            "OPTION allow-external-password-cache\nSETKEYINFO n/NEW\nGETPIN\nBYE\n",
        )
        .await;
        assert!(out.contains("D fresh-pass\nOK\n"), "got {out:?}");
        assert!(!out.contains("PASSWORD_FROM_CACHE"));
        let stored = fx.vault.lookup("GnuPG:PinGO=n/NEW").await.unwrap().unwrap();
        assert_eq!(stored.as_slice(), b"fresh-pass");
        // the dialog offered the save checkbox
        assert!(fx.prompt.pin_requests.lock().unwrap()[0].offer_save);
    }

    #[tokio::test]
    async fn getpin_repeat_loop_until_match() {
        let fx = fixture(
            ScriptedPrompt::default()
                .pin("first", false)
                .pin("mismatch", false)
                .pin("second", false)
                .pin("second", false),
        );
        let out = run_script(&fx, "SETREPEAT Repeat:\nGETPIN\nBYE\n").await;
        assert!(out.contains("S PIN_REPEATED\nD second\nOK\n"), "got {out:?}");

        let seen = fx.prompt.pin_requests.lock().unwrap();
        assert_eq!(seen.len(), 4);
        // second round shows the default mismatch error on the first dialog
        assert_eq!(seen[2].error, "Does not match - try again");
        assert_eq!(seen[1].prompt, "Repeat:");
    }

    #[tokio::test]
    async fn getpin_cancel_maps_to_protocol_error() {
        let fx = fixture(ScriptedPrompt::default().pin_canceled());
        let out = run_script(&fx, "GETPIN\nNOP\nBYE\n").await;
        assert!(
            out.contains("ERR 83886179 operation canceled <pinentry>"),
            "got {out:?}"
        );
        // the session survives the cancellation
        assert!(out.ends_with("OK\nOK\n"), "got {out:?}");
    }

    #[tokio::test]
    async fn empty_password_is_not_cached() {
        let fx = fixture(ScriptedPrompt::default().pin("", true));
        let out = run_script(
            &fx,
            "OPTION allow-external-password-cache\nSETKEYINFO n/E\nGETPIN\nBYE\n",
        )
        .await;
        assert!(out.contains("OK\n"), "got {out:?}");
        assert!(fx.vault.lookup("GnuPG:PinGO=n/E").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn confirm_yes_no_and_one_button() {
        let fx = fixture(ScriptedPrompt::default().confirmation(true).confirmation(false));
        let out = run_script(&fx, "CONFIRM\nCONFIRM\nBYE\n").await;
        assert!(out.contains("OK\nERR 83886179 operation canceled <pinentry>"), "got {out:?}");

        let fx = fixture(ScriptedPrompt::default().confirmation(true));
        let _ = run_script(&fx, "CONFIRM --one-button\nBYE\n").await;
        assert!(fx.prompt.confirm_requests.lock().unwrap()[0].one_button);
    }

    #[tokio::test]
    async fn message_acknowledges_regardless_of_answer() {
        let fx = fixture(ScriptedPrompt::default().confirmation(false));
        let out = run_script(&fx, "SETDESC Note\nMESSAGE\nBYE\n").await;
        assert!(!out.contains("ERR"), "got {out:?}");
        let seen = fx.prompt.confirm_requests.lock().unwrap();
        assert!(seen[0].one_button);
        assert_eq!(seen[0].description, "Note");
    }

    #[tokio::test]
    async fn clearpassphrase_deletes_and_tolerates_absent() {
        let fx = fixture(ScriptedPrompt::default());
        fx.vault.store("GnuPG:PinGO=n/X", b"gone").await.unwrap();
        let out = run_script(&fx, "CLEARPASSPHRASE n/X\nCLEARPASSPHRASE n/X\nBYE\n").await;
        assert!(!out.contains("ERR"), "got {out:?}");
        assert!(fx.vault.lookup("GnuPG:PinGO=n/X").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn getinfo_answers() {
        let fx = fixture(ScriptedPrompt::default());
        let out = run_script(&fx, "GETINFO pid\nGETINFO flavor\nGETINFO version\nGETINFO ttyinfo\nBYE\n").await;
        assert!(out.contains("D -1\nOK\n"), "got {out:?}");
        assert!(out.contains("D wisp\nOK\n"), "got {out:?}");
        assert!(out.contains("D 0.3.0\nOK\n"), "got {out:?}");
        assert!(out.contains("D - - -\nOK\n"), "got {out:?}");

        let out = run_script(&fx, "GETINFO nonsense\nBYE\n").await;
        assert!(out.contains("GETINFO unknown parameter value"), "got {out:?}");
    }

    #[tokio::test]
    async fn settimeout_validates_its_argument() {
        let fx = fixture(ScriptedPrompt::default());
        let out = run_script(&fx, "SETTIMEOUT 30\nSETTIMEOUT soon\nBYE\n").await;
        assert!(out.contains("invalid timeout value"), "got {out:?}");
        // the first SETTIMEOUT succeeded
        assert!(out.starts_with(&format!("OK {GREETING}\nOK\n")), "got {out:?}");
    }

    #[tokio::test]
    async fn unknown_option_is_refused_but_defaults_pass() {
        let fx = fixture(ScriptedPrompt::default());
        let out = run_script(
            &fx,
            "OPTION default-ok OK\nOPTION ttyname=/dev/pts/3\nOPTION frobnicate=1\nBYE\n",
        )
        .await;
        assert!(out.contains("unknown option: frobnicate"), "got {out:?}");
        let ok_count = out.matches("\nOK").count();
        assert!(ok_count >= 3, "got {out:?}");
    }

    #[tokio::test]
    async fn reset_restores_defaults_for_the_connection() {
        let fx = fixture(
            ScriptedPrompt::default().pin("after-reset", false),
        );
        let out = run_script(
            &fx,
            "SETDESC changed\nSETPROMPT changed\nSETREPEAT changed\nRESET\nGETPIN\nBYE\n",
        )
        .await;
        assert!(out.contains("D after-reset\nOK\n"), "got {out:?}");
        // one prompt only: RESET cleared the repeat prompt, and the dialog
        // saw default (empty) texts
        let seen = fx.prompt.pin_requests.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].description, "");
        assert_eq!(seen[0].prompt, "");
    }

    #[tokio::test]
    async fn second_connection_starts_from_defaults() {
        let fx = fixture(ScriptedPrompt::default().pin("fresh", false));
        let _ = run_script(&fx, "SETDESC sticky\nBYE\n").await;
        let _ = run_script(&fx, "GETPIN\nBYE\n").await;
        let seen = fx.prompt.pin_requests.lock().unwrap();
        assert_eq!(seen[0].description, "");
    }
}
