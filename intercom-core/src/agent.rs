//! Wire types for the agent subprocess protocol.
//!
//! Defines the payload written to an agent's stdin (`AgentInput`) and the
//! sentinel-framed JSON records read back from its stdout (`AgentOutput`),
//! plus the streaming parser that turns a raw stdout buffer into a sequence
//! of complete records.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel markers bracketing each JSON record on the agent's stdout.
pub const OUTPUT_START_MARKER: &str = "---INTERCOM_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---INTERCOM_OUTPUT_END---";

/// Payload written once to the agent's stdin as JSON, then stdin is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_scheduled_task: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Secret material (API keys, tokens). Never written to disk or env;
    /// delivered only in this stdin payload and zeroed from memory once sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<HashMap<String, String>>,
}

/// One sentinel-framed JSON record read from the agent's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    pub status: AgentStatus,
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Advisory accounting only — never gates any control-flow decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Error,
}

/// Parses OUTPUT marker pairs from a byte buffer.
///
/// Returns the extracted JSON strings (in order) and the number of bytes
/// consumed from the start of `buf`. Bytes after `consumed` (an incomplete
/// trailing pair, or no pair at all) must be retained by the caller and
/// prepended to the next chunk.
pub fn extract_output_markers(buf: &str) -> (Vec<String>, usize) {
    let mut results = Vec::new();
    let mut consumed = 0;

    let mut search_from = 0;
    loop {
        let start = match buf[search_from..].find(OUTPUT_START_MARKER) {
            Some(pos) => search_from + pos,
            None => break,
        };

        let after_start = start + OUTPUT_START_MARKER.len();
        let end = match buf[after_start..].find(OUTPUT_END_MARKER) {
            Some(pos) => after_start + pos,
            None => break, // incomplete pair — wait for more input
        };

        let json_str = buf[after_start..end].trim().to_string();
        results.push(json_str);

        consumed = end + OUTPUT_END_MARKER.len();
        search_from = consumed;
    }

    (results, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_input_serializes_camel_case() {
        let input = AgentInput {
            prompt: "hello".to_string(),
            session_id: Some("sess-123".to_string()),
            group_folder: "main".to_string(),
            chat_jid: "tg:123".to_string(),
            is_main: true,
            is_scheduled_task: None,
            assistant_name: Some("Amtiskaw".to_string()),
            model: None,
            secrets: None,
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("\"chatJid\""));
        assert!(json.contains("\"groupFolder\""));
        assert!(json.contains("\"isMain\""));
        assert!(json.contains("\"sessionId\""));
        assert!(!json.contains("\"model\""));
        assert!(!json.contains("\"secrets\""));
    }

    #[test]
    fn agent_output_deserializes() {
        let json = r#"{"status":"success","result":"Hello!","newSessionId":"sess-456","tokensIn":120,"tokensOut":48}"#;
        let output: AgentOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.status, AgentStatus::Success);
        assert_eq!(output.result.as_deref(), Some("Hello!"));
        assert_eq!(output.new_session_id.as_deref(), Some("sess-456"));
        assert_eq!(output.tokens_in, Some(120));
        assert_eq!(output.tokens_out, Some(48));
    }

    #[test]
    fn agent_output_error_status() {
        let json = r#"{"status":"error","result":null,"error":"exit code 1"}"#;
        let output: AgentOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.status, AgentStatus::Error);
        assert!(output.result.is_none());
        assert!(output.error.is_some());
    }

    #[test]
    fn extract_markers_single_pair() {
        let buf = format!(
            "some noise {}{{\"status\":\"success\",\"result\":\"hi\"}}{}trailing",
            OUTPUT_START_MARKER, OUTPUT_END_MARKER
        );
        let (results, consumed) = extract_output_markers(&buf);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], r#"{"status":"success","result":"hi"}"#);
        assert!(consumed > 0);
        assert_eq!(&buf[consumed..], "trailing");
    }

    #[test]
    fn extract_markers_multiple_pairs() {
        let buf = format!(
            "{s}{{\"status\":\"success\",\"result\":null}}{e}{s}{{\"status\":\"success\",\"result\":\"done\"}}{e}",
            s = OUTPUT_START_MARKER,
            e = OUTPUT_END_MARKER,
        );
        let (results, consumed) = extract_output_markers(&buf);
        assert_eq!(results.len(), 2);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn extract_markers_incomplete_pair() {
        let buf = format!("{s}{{\"status\":\"success\"}}", s = OUTPUT_START_MARKER);
        let (results, consumed) = extract_output_markers(&buf);
        assert_eq!(results.len(), 0);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn extract_markers_empty_buffer() {
        let (results, consumed) = extract_output_markers("");
        assert_eq!(results.len(), 0);
        assert_eq!(consumed, 0);
    }

    #[test]
    fn extract_markers_split_across_chunks_matches_joined() {
        let whole = format!(
            "{s}{{\"status\":\"success\",\"result\":\"split\"}}{e}",
            s = OUTPUT_START_MARKER,
            e = OUTPUT_END_MARKER,
        );
        for split_at in 0..whole.len() {
            if !whole.is_char_boundary(split_at) {
                continue;
            }
            let (c1, c2) = whole.split_at(split_at);
            let (first_results, first_consumed) = extract_output_markers(c1);
            assert_eq!(first_consumed, if first_results.is_empty() { 0 } else { c1.len() });
            let mut buffer = c1[first_consumed..].to_string();
            buffer.push_str(c2);
            let (joined_results, _) = extract_output_markers(&buffer);
            let (reference_results, _) = extract_output_markers(&whole);
            let mut combined = first_results;
            combined.extend(joined_results);
            assert_eq!(combined, reference_results);
        }
    }
}
