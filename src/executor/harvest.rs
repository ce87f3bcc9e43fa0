//! Locating the executor's task directory and extracting its reply and
//! metrics.
//!
//! The executor persists every task under `<data_dir>/tasks/<task_id>/`
//! with an `api_conversation_history.json` and a `metadata.json`. The
//! structured reply lives inside some message of the conversation; we scan
//! newest-first and keep the first message that parses.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use super::ExecutorError;
use crate::domain::{ExecutorReply, StepMetrics, parse_reply};

/// Pull the task id out of executor stdout: a `Task created: <id>` line,
/// else the first UUID anywhere in the output.
pub fn parse_task_id(output: &str) -> Option<String> {
    static CREATED: OnceLock<Regex> = OnceLock::new();
    static UUID: OnceLock<Regex> = OnceLock::new();

    let created = CREATED.get_or_init(|| Regex::new(r"Task created: (\S+)").unwrap());
    if let Some(captures) = created.captures(output) {
        return Some(captures[1].trim().to_string());
    }

    let uuid = UUID.get_or_init(|| {
        Regex::new(r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").unwrap()
    });
    uuid.find(output).map(|m| m.as_str().to_string())
}

/// Read the reply and metrics from a task directory.
///
/// `elapsed_seconds` is the wall-clock time the adapter observed; it backs
/// the duration metric when the metadata file doesn't carry one.
pub fn harvest_task(
    data_dir: &Path,
    task_id: &str,
    elapsed_seconds: f64,
) -> Result<(ExecutorReply, StepMetrics), ExecutorError> {
    let task_dir = data_dir.join("tasks").join(task_id);
    if !task_dir.is_dir() {
        return Err(ExecutorError::TaskDirMissing(task_dir));
    }

    let conversation_path = task_dir.join("api_conversation_history.json");
    if !conversation_path.exists() {
        return Err(ExecutorError::ConversationMissing(conversation_path));
    }

    let conversation: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(&conversation_path)?)
            .map_err(|e| ExecutorError::Spawn(format!("invalid conversation history: {e}")))?;

    let reply = extract_reply(&conversation)?;
    let metrics = read_metrics(&task_dir.join("metadata.json"), elapsed_seconds);

    Ok((reply, metrics))
}

fn extract_reply(conversation: &[serde_json::Value]) -> Result<ExecutorReply, ExecutorError> {
    for message in conversation.iter().rev() {
        let Some(content) = message.get("content") else {
            continue;
        };
        let text = content_text(content);
        if text.is_empty() {
            continue;
        }
        if let Ok(reply) = parse_reply(&text) {
            return Ok(reply);
        }
    }
    Err(ExecutorError::NoReplyInConversation)
}

/// Message content is usually a plain string; some executors emit a list of
/// content blocks with `text` fields instead.
fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn read_metrics(metadata_path: &Path, elapsed_seconds: f64) -> StepMetrics {
    let metadata: serde_json::Value = std::fs::read_to_string(metadata_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null);

    let metrics = metadata.get("metrics").cloned().unwrap_or(serde_json::Value::Null);
    let tokens = metrics.get("token_counts").cloned().unwrap_or(serde_json::Value::Null);

    let as_u64 = |v: &serde_json::Value, key: &str| v.get(key).and_then(|x| x.as_u64()).unwrap_or(0);
    let as_f64 = |v: &serde_json::Value, key: &str| v.get(key).and_then(|x| x.as_f64());

    StepMetrics {
        token_input: as_u64(&tokens, "input"),
        token_output: as_u64(&tokens, "output"),
        token_cache_read: as_u64(&tokens, "cacheRead"),
        token_cache_write: as_u64(&tokens, "cacheWrite"),
        cache_hit: metrics
            .get("cache_hit")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        cost_usd: as_f64(&metrics, "cost_usd").unwrap_or(0.0),
        duration_seconds: metadata
            .get("duration_seconds")
            .and_then(|v| v.as_f64())
            .unwrap_or(elapsed_seconds),
        ttft_seconds: as_f64(&metrics, "ttft_seconds"),
        throughput_tokens_per_second: as_f64(&metrics, "throughput_tokens_per_second"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_task(
        data_dir: &Path,
        task_id: &str,
        conversation: serde_json::Value,
        metadata: serde_json::Value,
    ) {
        let task_dir = data_dir.join("tasks").join(task_id);
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(
            task_dir.join("api_conversation_history.json"),
            serde_json::to_string(&conversation).unwrap(),
        )
        .unwrap();
        std::fs::write(
            task_dir.join("metadata.json"),
            serde_json::to_string(&metadata).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn parses_task_created_line() {
        let id = parse_task_id("booting...\nTask created: abc-123\ndone").unwrap();
        assert_eq!(id, "abc-123");
    }

    #[test]
    fn falls_back_to_uuid() {
        let id =
            parse_task_id("task id is 1f2e3d4c-0000-4111-8222-333344445555 somewhere").unwrap();
        assert_eq!(id, "1f2e3d4c-0000-4111-8222-333344445555");
    }

    #[test]
    fn no_task_id_found() {
        assert!(parse_task_id("nothing useful").is_none());
    }

    #[test]
    fn harvests_newest_valid_reply() {
        let tmp = TempDir::new().unwrap();
        let conversation = serde_json::json!([
            {"role": "assistant", "content": "working on it"},
            {"role": "assistant", "content": "{\"action\": \"RETRY\", \"evidence_files\": [], \"summary_for_supervisor\": \"older\"}"},
            {"role": "assistant", "content": "```json\n{\"action\": \"COMPLETED\", \"evidence_files\": [\"out.txt\"], \"summary_for_supervisor\": \"newest\"}\n```"},
        ]);
        let metadata = serde_json::json!({
            "duration_seconds": 12.5,
            "metrics": {
                "cost_usd": 0.42,
                "cache_hit": true,
                "token_counts": {"input": 100, "output": 50, "cacheRead": 10}
            }
        });
        write_task(tmp.path(), "t1", conversation, metadata);

        let (reply, metrics) = harvest_task(tmp.path(), "t1", 99.0).unwrap();
        assert_eq!(reply.summary_for_supervisor, "newest");
        assert_eq!(metrics.cost_usd, 0.42);
        assert_eq!(metrics.duration_seconds, 12.5);
        assert_eq!(metrics.token_input, 100);
        assert!(metrics.cache_hit);
    }

    #[test]
    fn missing_metadata_defaults_to_elapsed() {
        let tmp = TempDir::new().unwrap();
        let task_dir = tmp.path().join("tasks").join("t2");
        std::fs::create_dir_all(&task_dir).unwrap();
        std::fs::write(
            task_dir.join("api_conversation_history.json"),
            r#"[{"content": "{\"action\": \"COMPLETED\", \"evidence_files\": [], \"summary_for_supervisor\": \"ok\"}"}]"#,
        )
        .unwrap();

        let (_, metrics) = harvest_task(tmp.path(), "t2", 7.0).unwrap();
        assert_eq!(metrics.duration_seconds, 7.0);
        assert_eq!(metrics.token_input, 0);
    }

    #[test]
    fn block_content_is_joined() {
        let tmp = TempDir::new().unwrap();
        let conversation = serde_json::json!([
            {"content": [
                {"type": "text", "text": "{\"action\": \"COMPLETED\","},
                {"type": "text", "text": "\"evidence_files\": [], \"summary_for_supervisor\": \"split\"}"}
            ]}
        ]);
        write_task(tmp.path(), "t3", conversation, serde_json::json!({}));

        let (reply, _) = harvest_task(tmp.path(), "t3", 1.0).unwrap();
        assert_eq!(reply.summary_for_supervisor, "split");
    }

    #[test]
    fn missing_task_dir_is_typed() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            harvest_task(tmp.path(), "nope", 0.0),
            Err(ExecutorError::TaskDirMissing(_))
        ));
    }

    #[test]
    fn conversation_without_reply_is_typed() {
        let tmp = TempDir::new().unwrap();
        write_task(
            tmp.path(),
            "t4",
            serde_json::json!([{"content": "just chatter"}]),
            serde_json::json!({}),
        );
        assert!(matches!(
            harvest_task(tmp.path(), "t4", 0.0),
            Err(ExecutorError::NoReplyInConversation)
        ));
    }
}
