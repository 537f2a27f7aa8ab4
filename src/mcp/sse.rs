use serde_json::Value;

/// Error-message fragments a server may use to report a dead or missing
/// session. Clients detect these and transparently re-`initialize`.
const SESSION_INVALID_MARKERS: &[&str] = &[
    "No valid session ID provided",
    "Invalid or missing session ID",
    "Session not found",
];

pub fn is_session_invalid_message(message: &str) -> bool {
    SESSION_INVALID_MARKERS.iter().any(|m| message.contains(m))
}

/// Parse a line-framed SSE body into its JSON-RPC messages.
///
/// Frames look like `event: message\ndata: <json>\n\n`; multi-line `data:`
/// fields concatenate per the SSE spec. Frames with an event name other
/// than `message` and frames whose data is not JSON are skipped.
pub fn parse_sse_messages(body: &str) -> Vec<Value> {
    let mut messages = Vec::new();
    for frame in body.split("\n\n") {
        let mut event = "message";
        let mut data_lines: Vec<&str> = Vec::new();
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event = rest.trim();
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start());
            }
        }
        if event != "message" || data_lines.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(&data_lines.join("\n")) {
            messages.push(value);
        }
    }
    messages
}

/// Pick the response matching `id`. With no id to match, fall back to the
/// last message that carries one.
pub fn pick_response<'a>(messages: &'a [Value], id: Option<&Value>) -> Option<&'a Value> {
    match id {
        Some(want) => messages.iter().find(|m| m.get("id") == Some(want)),
        None => messages.iter().rev().find(|m| m.get("id").is_some()),
    }
}

/// Extract JSON-RPC messages from a response body that may be plain JSON
/// (object or batch array) or SSE-framed.
pub fn parse_response_body(body: &str, looks_like_sse: bool) -> Vec<Value> {
    if looks_like_sse || body.trim_start().starts_with("event:") || body.contains("\ndata:") {
        return parse_sse_messages(body);
    }
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => items,
        Ok(single) => vec![single],
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_invalid_detection() {
        assert!(is_session_invalid_message(
            "Bad Request: No valid session ID provided"
        ));
        assert!(is_session_invalid_message("Session not found"));
        assert!(is_session_invalid_message("Invalid or missing session ID"));
        assert!(!is_session_invalid_message("Some other error"));
    }

    #[test]
    fn test_parse_two_frames_and_pick_by_id() {
        let body = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"ok\":true}}\n",
            "\n",
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"ok\":false}}\n",
            "\n",
        );
        let messages = parse_sse_messages(body);
        assert_eq!(messages.len(), 2);

        let picked = pick_response(&messages, Some(&json!(3))).unwrap();
        assert_eq!(picked["result"]["ok"], false);

        // Absent id falls back to the last message carrying one.
        let picked = pick_response(&messages, None).unwrap();
        assert_eq!(picked["id"], 3);
    }

    #[test]
    fn test_non_message_events_are_skipped() {
        let body = "event: ping\ndata: {}\n\nevent: message\ndata: {\"id\":1}\n\n";
        let messages = parse_sse_messages(body);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["id"], 1);
    }

    #[test]
    fn test_frame_without_event_defaults_to_message() {
        let body = "data: {\"id\":9}\n\n";
        assert_eq!(parse_sse_messages(body).len(), 1);
    }

    #[test]
    fn test_plain_json_bodies() {
        let single = parse_response_body("{\"id\":1}", false);
        assert_eq!(single.len(), 1);

        let batch = parse_response_body("[{\"id\":1},{\"id\":2}]", false);
        assert_eq!(batch.len(), 2);

        let sse = parse_response_body("event: message\ndata: {\"id\":4}\n\n", true);
        assert_eq!(sse[0]["id"], 4);
    }
}
