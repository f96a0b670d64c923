//! Connection state machine — pure transition logic.
//!
//! ```text
//! UNDEFINED -> CONNECTION_REQUESTED -> AUTHENTICATED -> ACTIVE
//!        \______________\__________________\_____________\___> CLOSED | DISABLED
//! ```
//!
//! Nothing here touches shared state. The store calls these functions while
//! holding the token's lock and commits whatever they return.

use seb_protocol::{ClientConnection, ConnectionStatus, ConnectionUpdate, SessionError};

/// Parameters of an establish call.
#[derive(Debug, Clone, Default)]
pub struct EstablishRequest {
    pub institution_id: u64,
    pub exam_id: Option<u64>,
    pub client_address: String,
    pub user_session_id: Option<String>,
    pub client_id_tag: Option<String>,
}

/// Status reached by establishing from `current`.
pub fn establish_target(current: ConnectionStatus) -> Result<ConnectionStatus, SessionError> {
    match current {
        ConnectionStatus::ConnectionRequested => Ok(ConnectionStatus::Authenticated),
        ConnectionStatus::Authenticated => Ok(ConnectionStatus::Active),
        other => Err(SessionError::state_conflict(format!("cannot establish a connection in state {other}"))),
    }
}

/// Status reached by closing from `current`. `None` means already closed.
pub fn close_target(current: ConnectionStatus) -> Result<Option<ConnectionStatus>, SessionError> {
    match current {
        ConnectionStatus::Closed => Ok(None),
        ConnectionStatus::Disabled => Err(SessionError::state_conflict("cannot close a disabled connection")),
        _ => Ok(Some(ConnectionStatus::Closed)),
    }
}

/// Status reached by disabling from `current`. `None` means already disabled.
pub fn disable_target(current: ConnectionStatus) -> Result<Option<ConnectionStatus>, SessionError> {
    match current {
        ConnectionStatus::Undefined | ConnectionStatus::ConnectionRequested => Ok(Some(ConnectionStatus::Disabled)),
        ConnectionStatus::Disabled => Ok(None),
        other => Err(SessionError::state_conflict(format!("cannot disable a connection in state {other}"))),
    }
}

fn check_institution(connection: &ClientConnection, institution_id: u64) -> Result<(), SessionError> {
    if connection.institution_id != institution_id {
        return Err(SessionError::state_conflict(format!(
            "connection {} does not belong to institution {institution_id}",
            connection.connection_token
        )));
    }
    Ok(())
}

/// Merge optional fields without touching status.
///
/// On a VDI exam an address different from the recorded one is kept as the
/// virtual address; otherwise the new address replaces the old.
pub fn apply_update(current: &ClientConnection, update: &ConnectionUpdate, vdi: bool) -> Result<ClientConnection, SessionError> {
    if current.status.is_terminal() {
        return Err(SessionError::state_conflict(format!(
            "cannot update a connection in state {}",
            current.status
        )));
    }
    if let (Some(bound), Some(requested)) = (current.exam_id, update.exam_id) {
        if bound != requested && current.status.is_established() {
            return Err(SessionError::state_conflict(format!(
                "connection is bound to exam {bound}, cannot switch to {requested}"
            )));
        }
    }

    let mut next = current.clone();
    if update.exam_id.is_some() {
        next.exam_id = update.exam_id;
    }
    if update.user_session_id.is_some() {
        next.user_session_id = update.user_session_id.clone();
    }
    if let Some(address) = &update.client_address {
        if address != &current.client_address {
            if vdi {
                next.virtual_client_address = Some(address.clone());
            } else {
                next.client_address = address.clone();
            }
        }
    }
    if update.seb_version.is_some() {
        next.seb_version = update.seb_version.clone();
    }
    if update.os_name.is_some() {
        next.os_name = update.os_name.clone();
    }
    if update.machine_name.is_some() {
        next.machine_name = update.machine_name.clone();
    }
    if update.client_id_tag.is_some() {
        next.client_id_tag = update.client_id_tag.clone();
    }
    Ok(next)
}

/// Establish: advance the status and bind session details.
///
/// `vdi_of` answers whether a given exam is VDI-typed; it is consulted for
/// the exam the connection ends up bound to.
pub fn apply_establish(
    current: &ClientConnection,
    request: &EstablishRequest,
    vdi_of: impl Fn(u64) -> bool,
) -> Result<ClientConnection, SessionError> {
    check_institution(current, request.institution_id)?;
    let target = establish_target(current.status)?;

    let exam_id = match (current.exam_id, request.exam_id) {
        (Some(bound), Some(requested)) if bound != requested => {
            return Err(SessionError::state_conflict(format!(
                "connection is bound to exam {bound}, not {requested}"
            )));
        }
        (Some(bound), _) => bound,
        (None, Some(requested)) => requested,
        (None, None) => return Err(SessionError::MissingExam(current.connection_token.clone())),
    };

    let mut next = current.clone();
    if !current.matches_address(&request.client_address) {
        if !vdi_of(exam_id) {
            return Err(SessionError::state_conflict(format!(
                "client address {} does not match the address this connection was created from",
                request.client_address
            )));
        }
        next.virtual_client_address = Some(request.client_address.clone());
    }

    next.exam_id = Some(exam_id);
    next.status = target;
    if request.user_session_id.is_some() {
        next.user_session_id = request.user_session_id.clone();
    }
    if request.client_id_tag.is_some() {
        next.client_id_tag = request.client_id_tag.clone();
    }
    Ok(next)
}

/// Close. `None` when the connection is already closed.
pub fn apply_close(current: &ClientConnection, institution_id: u64) -> Result<Option<ClientConnection>, SessionError> {
    check_institution(current, institution_id)?;
    Ok(close_target(current.status)?.map(|status| ClientConnection { status, ..current.clone() }))
}

/// Close on behalf of the server (exam end); no institution check.
pub fn apply_server_close(current: &ClientConnection) -> Result<Option<ClientConnection>, SessionError> {
    Ok(close_target(current.status)?.map(|status| ClientConnection { status, ..current.clone() }))
}

/// Disable. `None` when the connection is already disabled.
pub fn apply_disable(current: &ClientConnection, institution_id: Option<u64>) -> Result<Option<ClientConnection>, SessionError> {
    if let Some(institution_id) = institution_id {
        check_institution(current, institution_id)?;
    }
    Ok(disable_target(current.status)?.map(|status| ClientConnection { status, ..current.clone() }))
}
