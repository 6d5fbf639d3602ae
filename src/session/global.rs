//! Optional process-wide session picked up by [`Observable::subscribe`].
//!
//! [`Observable::subscribe`]: crate::Observable::subscribe

use super::Session;
use crate::config::SpyConfig;
use crate::error::{Result, SpyError};
use parking_lot::{const_mutex, Mutex};

static INSTALLED: Mutex<Option<Session>> = const_mutex(None);

/// Creates a session and installs it process-wide.
///
/// Fails with [`SpyError::SessionConflict`] while another installed session
/// is active.
pub fn install(config: SpyConfig) -> Result<Session> {
    let mut installed = INSTALLED.lock();
    if installed.as_ref().is_some_and(Session::is_active) {
        return Err(SpyError::SessionConflict);
    }

    let session = Session::new(config);
    *installed = Some(session.clone());
    tracing::debug!("session installed");
    Ok(session)
}

/// The installed session, if it is still active.
pub fn installed() -> Option<Session> {
    INSTALLED.lock().as_ref().filter(|s| s.is_active()).cloned()
}

/// Uninstalls `session` if it is the installed one.
pub(crate) fn release(session: &Session) {
    let mut installed = INSTALLED.lock();
    if installed.as_ref().is_some_and(|s| s.ptr_eq(session)) {
        *installed = None;
        tracing::debug!("session uninstalled");
    }
}
