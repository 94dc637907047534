//! Frame-level tracing under the `wire` target, enabled with
//! `CHORUS_WIRE_TRACE=1`.

use std::sync::OnceLock;

const PREVIEW_CHARS: usize = 256;

static ENABLED: OnceLock<bool> = OnceLock::new();

pub(crate) fn enabled() -> bool {
    *ENABLED.get_or_init(|| flag_set(std::env::var("CHORUS_WIRE_TRACE").ok().as_deref()))
}

fn flag_set(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

pub(crate) fn preview(payload: &str) -> String {
    match payload.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &payload[..cut]),
        None => payload.to_string(),
    }
}

pub(crate) fn log_in(user_id: &str, connection: &str, payload: &str) {
    if !enabled() {
        return;
    }
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "in",
        user_id,
        connection,
        bytes = payload.len(),
        payload_preview = %preview(payload),
        "server_in"
    );
}

pub(crate) fn log_out(user_id: Option<&str>, connection: Option<&str>, event: &str, payload: &str) {
    if !enabled() {
        return;
    }
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "out",
        user_id = ?user_id,
        connection = ?connection,
        event,
        bytes = payload.len(),
        payload_preview = %preview(payload),
        "server_out"
    );
}

pub(crate) fn log_close(user_id: Option<&str>, connection: Option<&str>, code: u16, reason: &str) {
    if !enabled() {
        return;
    }
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "out",
        frame_type = "close",
        user_id = ?user_id,
        connection = ?connection,
        code,
        reason,
        "server_out"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_values() {
        assert!(flag_set(Some("1")));
        assert!(flag_set(Some(" TRUE ")));
        assert!(flag_set(Some("on")));
        assert!(!flag_set(Some("0")));
        assert!(!flag_set(Some("")));
        assert!(!flag_set(None));
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        assert_eq!(preview("short"), "short");
        let long = "é".repeat(PREVIEW_CHARS + 10);
        let cut = preview(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), PREVIEW_CHARS + 3);
    }
}
