//! Voice command dispatch for the bridge main loop.
//!
//! New voice queries are matched against command prefixes before anything is
//! forwarded to the LLM. Stop phrases short-circuit first, then the mode
//! switches, then everything else is forwarded only while the mode is on.
//!
//! # Recognized commands
//!
//! | Query prefix | Effect |
//! |--------------|--------|
//! | "闭嘴", "停止" | stop current playback, mode unchanged |
//! | "打开高级对话", "开启高级对话" | mode on, ack spoken |
//! | "关闭高级对话" | mode off, ack spoken |

/// Spoken acknowledgement after enabling the mode.
pub const MODE_ON_ACK: &str = "高级对话已开启";
/// Spoken acknowledgement after disabling the mode.
pub const MODE_OFF_ACK: &str = "关闭高级对话";

const STOP_PREFIXES: &[&str] = &["闭嘴", "停止"];
/// Phrases that turn advanced mode on, by prefix match.
pub const MODE_ON_PREFIXES: &[&str] = &["打开高级对话", "开启高级对话"];
/// Phrases that turn advanced mode off, by prefix match.
pub const MODE_OFF_PREFIXES: &[&str] = &["关闭高级对话"];

/// Outcome of dispatching one voice query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Stop whatever is playing. Never changes the mode.
    StopPlayback,
    /// The mode was set (possibly re-asserted); speak the ack phrase.
    ModeSet {
        /// New mode value.
        enabled: bool,
        /// Acknowledgement to speak on the device.
        ack: &'static str,
    },
    /// Not a command; forward to the LLM if the mode is enabled.
    Forward,
}

/// Classify a voice query and compute the resulting mode.
///
/// Pure: the caller owns the mode flag and applies the returned value.
pub fn dispatch(query: &str, mode_enabled: bool) -> (bool, Dispatch) {
    if is_stop_command(query) {
        return (mode_enabled, Dispatch::StopPlayback);
    }
    if starts_with_any(query, MODE_ON_PREFIXES) {
        return (
            true,
            Dispatch::ModeSet {
                enabled: true,
                ack: MODE_ON_ACK,
            },
        );
    }
    if starts_with_any(query, MODE_OFF_PREFIXES) {
        return (
            false,
            Dispatch::ModeSet {
                enabled: false,
                ack: MODE_OFF_ACK,
            },
        );
    }
    (mode_enabled, Dispatch::Forward)
}

/// Whether the query is a stop phrase ("闭嘴" / "停止").
///
/// Also used by the turn runner to classify barge-in queries.
pub fn is_stop_command(query: &str) -> bool {
    starts_with_any(query, STOP_PREFIXES)
}

fn starts_with_any(query: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| query.starts_with(p))
}
