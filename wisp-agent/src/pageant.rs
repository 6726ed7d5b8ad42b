//! SSH-agent framing bridge to the host agent.
//!
//! One side is plain ssh-agent wire framing (4-byte big-endian length, then
//! payload).  The other side is Pageant's RPC: a named shared-memory
//! mapping plus a `WM_COPYDATA` message to its hidden top-level window.
//! The frame loop is portable and testable; the Win32 RPC lives behind
//! [`HostAgent`].

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use wisp_core::SessionGate;
use wisp_core::names::MAX_AGENT_MSG_LEN;

/// `SSH_AGENT_FAILURE` message type, sent as a whole 1-byte payload.
pub const SSH_AGENT_FAILURE: u8 = 5;
/// `SSH_AGENT_SUCCESS` message type, sent as a whole 1-byte payload.
pub const SSH_AGENT_SUCCESS: u8 = 6;

/// Failures of the host-agent RPC.  These are reported to the SSH peer as
/// an agent failure rather than terminating the connection.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("could not find Pageant window")]
    WindowNotFound,

    #[error("WM_COPYDATA was not accepted by the host agent")]
    CopyDataFailed,

    #[error("host RPC failed: {0}")]
    Rpc(String),

    #[error("host agent response of {0} bytes exceeds the message cap")]
    ResponseTooLarge(usize),
}

/// One request/response exchange with the host SSH agent.
///
/// `query` blocks (the window message does not return until the agent is
/// done); callers move it off the async runtime.
pub trait HostAgent: Send + Sync {
    fn query(&self, request: &[u8]) -> Result<Vec<u8>, HostError>;
}

/// Errors that terminate an SSH bridge connection.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request size is 0")]
    EmptyRequest,

    #[error("request of {0} bytes exceeds the message cap")]
    RequestTooLarge(u32),

    #[error("reply of {0} bytes exceeds the message cap")]
    ResponseTooLarge(usize),
}

/// Serve ssh-agent framing on `stream` until EOF, forwarding each request
/// to `agent`.
///
/// While the session gate is locked every request is answered with a single
/// `SSH_AGENT_FAILURE` byte and the connection stays open.
pub async fn serve_ssh<S>(
    mut stream: S,
    gate: SessionGate,
    agent: Arc<dyn HostAgent>,
) -> Result<(), BridgeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut length = [0u8; 4];
    loop {
        match stream.read_exact(&mut length).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(length);
        if len == 0 {
            return Err(BridgeError::EmptyRequest);
        }
        if len as usize > MAX_AGENT_MSG_LEN - 4 {
            return Err(BridgeError::RequestTooLarge(len));
        }

        let mut request = vec![0u8; len as usize];
        stream.read_exact(&mut request).await?;

        let response = if gate.is_locked() {
            debug!("session is locked, failing ssh request");
            vec![SSH_AGENT_FAILURE]
        } else {
            let agent = Arc::clone(&agent);
            let result = tokio::task::spawn_blocking(move || agent.query(&request))
                .await
                .expect("host agent query panicked");
            match result {
                Ok(response) => {
                    if response.len() > MAX_AGENT_MSG_LEN - 4 {
                        return Err(BridgeError::ResponseTooLarge(response.len()));
                    }
                    if response.is_empty() {
                        vec![SSH_AGENT_SUCCESS]
                    } else {
                        response
                    }
                }
                // an oversize reply means the mapping contents cannot be
                // trusted; this is not a per-request failure
                Err(HostError::ResponseTooLarge(len)) => {
                    return Err(BridgeError::ResponseTooLarge(len));
                }
                Err(err) => {
                    warn!("host agent request failed: {err}");
                    vec![SSH_AGENT_FAILURE]
                }
            }
        };

        stream
            .write_all(&(response.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(&response).await?;
        stream.flush().await?;
    }
}

/// The platform's host agent, or a stub that reports the agent missing.
pub fn default_host_agent() -> Arc<dyn HostAgent> {
    #[cfg(windows)]
    {
        Arc::new(win::PageantAgent::new())
    }
    #[cfg(not(windows))]
    {
        struct NoHostAgent;
        impl HostAgent for NoHostAgent {
            fn query(&self, _request: &[u8]) -> Result<Vec<u8>, HostError> {
                Err(HostError::WindowNotFound)
            }
        }
        Arc::new(NoHostAgent)
    }
}

#[cfg(windows)]
mod win {
    //! Pageant RPC: `pgnt%08x` file mapping + `WM_COPYDATA`.

    use std::sync::atomic::{AtomicU64, Ordering};

    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE, LocalFree};
    use windows_sys::Win32::Security::Authorization::{
        ConvertSidToStringSidW, ConvertStringSecurityDescriptorToSecurityDescriptorW,
        SDDL_REVISION_1,
    };
    use windows_sys::Win32::Security::{
        GetTokenInformation, SECURITY_ATTRIBUTES, TOKEN_QUERY, TOKEN_USER, TokenUser,
    };
    use windows_sys::Win32::System::DataExchange::COPYDATASTRUCT;
    use windows_sys::Win32::System::Memory::{
        CreateFileMappingW, FILE_MAP_WRITE, MapViewOfFile, PAGE_READWRITE, UnmapViewOfFile,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
    use windows_sys::Win32::UI::WindowsAndMessaging::{FindWindowW, SendMessageW, WM_COPYDATA};

    use super::{HostAgent, HostError};
    use wisp_core::names::MAX_AGENT_MSG_LEN;

    const PAGEANT_COPYDATA_ID: usize = 0x804e50ba;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn last_error(what: &str) -> HostError {
        HostError::Rpc(format!("{what}: {}", std::io::Error::last_os_error()))
    }

    /// Security attributes owning the mapping to the current user, handle
    /// inheritable, so Pageant running as the same user can open it.
    struct OwnedSecurityAttributes {
        attributes: SECURITY_ATTRIBUTES,
    }

    impl OwnedSecurityAttributes {
        fn for_current_user() -> Result<Self, HostError> {
            unsafe {
                let mut token = std::ptr::null_mut();
                if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
                    return Err(last_error("OpenProcessToken"));
                }
                let mut needed = 0u32;
                GetTokenInformation(token, TokenUser, std::ptr::null_mut(), 0, &mut needed);
                let mut buf = vec![0u8; needed as usize];
                let ok = GetTokenInformation(
                    token,
                    TokenUser,
                    buf.as_mut_ptr().cast(),
                    needed,
                    &mut needed,
                );
                CloseHandle(token);
                if ok == 0 {
                    return Err(last_error("GetTokenInformation"));
                }
                let user = &*buf.as_ptr().cast::<TOKEN_USER>();

                let mut sid_string = std::ptr::null_mut();
                if ConvertSidToStringSidW(user.User.Sid, &mut sid_string) == 0 {
                    return Err(last_error("ConvertSidToStringSid"));
                }
                let len = (0..).find(|i| *sid_string.add(*i) == 0).unwrap_or(0);
                let sid = String::from_utf16_lossy(std::slice::from_raw_parts(sid_string, len));
                LocalFree(sid_string.cast());

                let sddl = wide(&format!("O:{sid}"));
                let mut descriptor = std::ptr::null_mut();
                if ConvertStringSecurityDescriptorToSecurityDescriptorW(
                    sddl.as_ptr(),
                    SDDL_REVISION_1,
                    &mut descriptor,
                    std::ptr::null_mut(),
                ) == 0
                {
                    return Err(last_error("ConvertStringSecurityDescriptor"));
                }

                Ok(Self {
                    attributes: SECURITY_ATTRIBUTES {
                        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                        lpSecurityDescriptor: descriptor,
                        bInheritHandle: 1,
                    },
                })
            }
        }
    }

    impl Drop for OwnedSecurityAttributes {
        fn drop(&mut self) {
            unsafe {
                LocalFree(self.attributes.lpSecurityDescriptor);
            }
        }
    }

    /// Host agent speaking Pageant's shared-memory protocol.
    pub struct PageantAgent {
        map_counter: AtomicU64,
    }

    impl PageantAgent {
        pub fn new() -> Self {
            Self {
                map_counter: AtomicU64::new(0),
            }
        }
    }

    impl Default for PageantAgent {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HostAgent for PageantAgent {
        fn query(&self, request: &[u8]) -> Result<Vec<u8>, HostError> {
            let window_name = wide("Pageant");
            // class and window name are both "Pageant"
            let hwnd = unsafe { FindWindowW(window_name.as_ptr(), window_name.as_ptr()) };
            if hwnd.is_null() {
                return Err(HostError::WindowNotFound);
            }

            let map_name = format!(
                "pgnt{:08x}",
                self.map_counter.fetch_add(1, Ordering::SeqCst) + 1
            );
            let security = OwnedSecurityAttributes::for_current_user()?;

            unsafe {
                let mapping = CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    &security.attributes as *const _ as *mut _,
                    PAGE_READWRITE,
                    0,
                    MAX_AGENT_MSG_LEN as u32,
                    wide(&map_name).as_ptr(),
                );
                if mapping.is_null() {
                    return Err(last_error("CreateFileMapping"));
                }

                let view = MapViewOfFile(mapping, FILE_MAP_WRITE, 0, 0, 0);
                if view.Value.is_null() {
                    CloseHandle(mapping);
                    return Err(last_error("MapViewOfFile"));
                }
                let shared = view.Value.cast::<u8>();

                std::ptr::copy_nonoverlapping(
                    (request.len() as u32).to_be_bytes().as_ptr(),
                    shared,
                    4,
                );
                std::ptr::copy_nonoverlapping(request.as_ptr(), shared.add(4), request.len());

                let map_name_c = std::ffi::CString::new(map_name).expect("no NUL in map name");
                let cds = COPYDATASTRUCT {
                    dwData: PAGEANT_COPYDATA_ID,
                    cbData: map_name_c.as_bytes_with_nul().len() as u32,
                    lpData: map_name_c.as_ptr() as *mut _,
                };
                let accepted =
                    SendMessageW(hwnd, WM_COPYDATA, 0, &cds as *const _ as isize);

                let result = if accepted == 0 {
                    Err(HostError::CopyDataFailed)
                } else {
                    let mut length = [0u8; 4];
                    std::ptr::copy_nonoverlapping(shared, length.as_mut_ptr(), 4);
                    let len = u32::from_be_bytes(length) as usize;
                    if len > MAX_AGENT_MSG_LEN - 4 {
                        Err(HostError::ResponseTooLarge(len))
                    } else {
                        let mut response = vec![0u8; len];
                        std::ptr::copy_nonoverlapping(
                            shared.add(4),
                            response.as_mut_ptr(),
                            len,
                        );
                        Ok(response)
                    }
                };

                UnmapViewOfFile(view);
                CloseHandle(mapping);
                result
            }
        }
    }
}
