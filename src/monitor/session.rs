//! Parsing of Claude session JSONL records.
//!
//! Each session log line is one JSON object. Only a handful of shapes carry
//! signal for the supervisor: user prompts, assistant text, TodoWrite tool
//! payloads, and summary records (session titles). Everything else parses
//! to `Other` and is skipped.

use serde_json::Value;

use crate::state::{TodoItem, TodoStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionRecord {
    UserPrompt { text: String },
    AssistantMessage { text: String },
    Todos(Vec<TodoItem>),
    Summary { title: String },
    Other,
}

/// Parse one JSONL line. Malformed lines yield `None` (a write may have
/// been observed mid-append).
pub fn parse_session_line(line: &str) -> Option<SessionRecord> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;

    match value["type"].as_str() {
        Some("summary") => {
            let title = value["summary"].as_str()?.to_string();
            Some(SessionRecord::Summary { title })
        }
        Some("user") => {
            let content = &value["message"]["content"];
            let text = match content {
                Value::String(s) => s.clone(),
                Value::Array(parts) => parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => return Some(SessionRecord::Other),
            };
            if text.is_empty() {
                return Some(SessionRecord::Other);
            }
            Some(SessionRecord::UserPrompt { text })
        }
        Some("assistant") => {
            let parts = value["message"]["content"].as_array()?;
            if let Some(todos) = parts
                .iter()
                .find(|p| {
                    p["type"].as_str() == Some("tool_use")
                        && p["name"].as_str() == Some("TodoWrite")
                })
                .and_then(|p| p["input"]["todos"].as_array())
            {
                return Some(SessionRecord::Todos(parse_todos(todos)));
            }
            let text = parts
                .iter()
                .filter(|p| p["type"].as_str() == Some("text"))
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n");
            if text.is_empty() {
                Some(SessionRecord::Other)
            } else {
                Some(SessionRecord::AssistantMessage { text })
            }
        }
        _ => Some(SessionRecord::Other),
    }
}

fn parse_todos(raw: &[Value]) -> Vec<TodoItem> {
    raw.iter()
        .filter_map(|todo| {
            let content = todo["content"].as_str()?.to_string();
            let status = match todo["status"].as_str()? {
                "pending" => TodoStatus::Pending,
                "in_progress" => TodoStatus::InProgress,
                "completed" => TodoStatus::Completed,
                _ => return None,
            };
            Some(TodoItem { content, status })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_summary() {
        let line = r#"{"type":"summary","summary":"Fix login flow","leafUuid":"abc"}"#;
        assert_eq!(
            parse_session_line(line),
            Some(SessionRecord::Summary {
                title: "Fix login flow".to_string()
            })
        );
    }

    #[test]
    fn parses_string_and_array_user_prompts() {
        let line = r#"{"type":"user","message":{"role":"user","content":"please add tests"}}"#;
        assert_eq!(
            parse_session_line(line),
            Some(SessionRecord::UserPrompt {
                text: "please add tests".to_string()
            })
        );

        let line = r#"{"type":"user","message":{"content":[{"type":"text","text":"run it"}]}}"#;
        assert_eq!(
            parse_session_line(line),
            Some(SessionRecord::UserPrompt {
                text: "run it".to_string()
            })
        );
    }

    #[test]
    fn parses_assistant_text() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Done."}]}}"#;
        assert_eq!(
            parse_session_line(line),
            Some(SessionRecord::AssistantMessage {
                text: "Done.".to_string()
            })
        );
    }

    #[test]
    fn parses_todo_write_payload() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"TodoWrite","input":{"todos":[{"content":"write parser","status":"completed"},{"content":"wire monitor","status":"in_progress"}]}}]}}"#;
        match parse_session_line(line) {
            Some(SessionRecord::Todos(todos)) => {
                assert_eq!(todos.len(), 2);
                assert_eq!(todos[0].content, "write parser");
                assert_eq!(todos[0].status, TodoStatus::Completed);
                assert_eq!(todos[1].status, TodoStatus::InProgress);
            }
            other => panic!("expected todos, got {other:?}"),
        }
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert_eq!(parse_session_line("{truncated"), None);
        assert_eq!(
            parse_session_line(r#"{"type":"system","subtype":"init"}"#),
            Some(SessionRecord::Other)
        );
    }

    #[test]
    fn unknown_todo_status_is_dropped() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"TodoWrite","input":{"todos":[{"content":"x","status":"someday"}]}}]}}"#;
        match parse_session_line(line) {
            Some(SessionRecord::Todos(todos)) => assert!(todos.is_empty()),
            other => panic!("expected todos, got {other:?}"),
        }
    }
}
