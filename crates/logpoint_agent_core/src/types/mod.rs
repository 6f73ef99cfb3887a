pub mod requests;
pub mod responses;

pub use requests::*;
pub use responses::*;

/// Event names on the wire.
pub mod events {
    pub const CONNECTION_ESTABLISHED: &str = "server:connection-established";
    pub const AUTHENTICATION_RESULT: &str = "server:authentication-result";
    pub const LOGPOINT_ADD: &str = "logpoint-add";
    pub const LOGPOINT_REMOVE: &str = "logpoint-remove";
    pub const LOGPOINTS_LIST: &str = "logpoints-list";
    pub const RELAY_ERROR: &str = "pusher:error";
    pub const SERVER_ERROR: &str = "server:error";
    pub const PING: &str = "pusher:ping";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";

    pub const AUTHENTICATE_AS_SERVER: &str = "authenticate-as-server";
    pub const PONG: &str = "pusher:pong";
    pub const LOGPOINT_ADDED: &str = "logpoint-added";
    pub const LOGPOINT_REMOVED: &str = "logpoint-removed";
    pub const LOGPOINT_REMOVAL_PENDING: &str = "logpoint-removal-pending";
    pub const LOGPOINT_ERROR_ADDING: &str = "logpoint-error-adding";
    pub const LOGPOINT_ERROR_EVALUATING: &str = "logpoint-error-evaluating";
    pub const AGENT_ERROR: &str = "client-agent-encountered-error";
    pub const DEBUG_EVENT: &str = "debug-event";
}
