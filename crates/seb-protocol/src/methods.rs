//! Method name constants — every JSON-RPC method grouped by namespace.
//!
//! Each constant is the exact string sent over the wire as the `method`
//! field of a JSON-RPC request.

/// All session API method names, grouped by namespace.
pub struct Methods;

impl Methods {
    // ── Connection lifecycle ────────────────────────────────────────────
    pub const CONNECTION_CREATE: &str = "connection/create";
    pub const CONNECTION_UPDATE: &str = "connection/update";
    pub const CONNECTION_ESTABLISH: &str = "connection/establish";
    pub const CONNECTION_CLOSE: &str = "connection/close";
    pub const CONNECTION_DISABLE: &str = "connection/disable";
    pub const CONNECTION_DISABLE_MANY: &str = "connection/disableMany";
    pub const CONNECTION_GET: &str = "connection/get";
    pub const CONNECTION_LIST_FOR_EXAM: &str = "connection/listForExam";
    pub const CONNECTION_CLOSE_EXAM: &str = "connection/closeExam";

    // ── SEB client calls ────────────────────────────────────────────────
    pub const SEB_PING: &str = "seb/ping";
    pub const SEB_EVENT: &str = "seb/event";

    // ── Instructions ────────────────────────────────────────────────────
    pub const INSTRUCTION_REGISTER: &str = "instruction/register";
    pub const INSTRUCTION_CONFIRM: &str = "instruction/confirm";
    pub const INSTRUCTION_AWAITING: &str = "instruction/awaiting";

    // ── Notifications ───────────────────────────────────────────────────
    pub const NOTIFICATION_PENDING: &str = "notification/pending";
    pub const NOTIFICATION_HAS_PENDING: &str = "notification/hasPending";
    pub const NOTIFICATION_CONFIRM: &str = "notification/confirm";

    // ── Proctoring ──────────────────────────────────────────────────────
    pub const PROCTORING_ROOMS: &str = "proctoring/rooms";
    pub const PROCTORING_BREAK_OUT: &str = "proctoring/breakOut";
    pub const PROCTORING_CLOSE_ROOM: &str = "proctoring/closeRoom";
    pub const PROCTORING_OPEN_TOWNHALL: &str = "proctoring/openTownhall";
    pub const PROCTORING_END_EXAM: &str = "proctoring/endExam";

    // ── Monitoring ──────────────────────────────────────────────────────
    pub const MONITORING_INCIDENTS: &str = "monitoring/incidents";
}

/// Type alias for method names.
pub type MethodName = &'static str;

/// Every method the server routes.
pub const ALL_METHODS: &[MethodName] = &[
    Methods::CONNECTION_CREATE,
    Methods::CONNECTION_UPDATE,
    Methods::CONNECTION_ESTABLISH,
    Methods::CONNECTION_CLOSE,
    Methods::CONNECTION_DISABLE,
    Methods::CONNECTION_DISABLE_MANY,
    Methods::CONNECTION_GET,
    Methods::CONNECTION_LIST_FOR_EXAM,
    Methods::CONNECTION_CLOSE_EXAM,
    Methods::SEB_PING,
    Methods::SEB_EVENT,
    Methods::INSTRUCTION_REGISTER,
    Methods::INSTRUCTION_CONFIRM,
    Methods::INSTRUCTION_AWAITING,
    Methods::NOTIFICATION_PENDING,
    Methods::NOTIFICATION_HAS_PENDING,
    Methods::NOTIFICATION_CONFIRM,
    Methods::PROCTORING_ROOMS,
    Methods::PROCTORING_BREAK_OUT,
    Methods::PROCTORING_CLOSE_ROOM,
    Methods::PROCTORING_OPEN_TOWNHALL,
    Methods::PROCTORING_END_EXAM,
    Methods::MONITORING_INCIDENTS,
];

/// Check whether a method name is part of the session API.
pub fn is_known_method(method: &str) -> bool {
    ALL_METHODS.contains(&method)
}
