//! End-to-end conformance tests driving a full session with a scripted LLM
//! against a real temp workspace.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use swival_agent::{Outcome, Session, SessionConfig};
use swival_observe::TimelineEvent;
use swival_testkit::{
    ScriptedLlm, overflow_error, text_response, tool_call, tool_calls_response,
    truncated_response,
};

fn config(base: &Path) -> SessionConfig {
    SessionConfig {
        base_dir: base.to_path_buf(),
        mcp_enabled: false,
        model: "test-model".to_string(),
        provider: "test".to_string(),
        ..SessionConfig::default()
    }
}

fn session(base: &Path, llm: Arc<ScriptedLlm>) -> Session {
    Session::new(config(base), llm).expect("session")
}

#[test]
fn read_before_write_guard_round_trip() {
    let tmp = tempfile::tempdir().expect("tmp");
    fs::write(tmp.path().join("src_x.txt"), "alpha beta\n").expect("seed");

    let llm = Arc::new(ScriptedLlm::from_responses(vec![
        tool_calls_response(vec![tool_call(
            "c1",
            "edit_file",
            r#"{"path":"src_x.txt","old_string":"alpha","new_string":"gamma"}"#,
        )]),
        tool_calls_response(vec![tool_call("c2", "read_file", r#"{"path":"src_x.txt"}"#)]),
        tool_calls_response(vec![tool_call(
            "c3",
            "edit_file",
            r#"{"path":"src_x.txt","old_string":"alpha","new_string":"gamma"}"#,
        )]),
        text_response("edited the file"),
    ]));
    let mut session = session(tmp.path(), llm);
    let record = session.run("change alpha to gamma in src_x.txt");

    assert_eq!(record.outcome, Outcome::Success);
    assert_eq!(record.report.stats.tool_calls_failed, 1);
    assert_eq!(record.report.stats.tool_calls_succeeded, 2);
    assert_eq!(
        fs::read_to_string(tmp.path().join("src_x.txt")).unwrap(),
        "gamma beta\n"
    );

    let first_failure = record
        .report
        .timeline
        .iter()
        .find_map(|e| match e {
            TimelineEvent::ToolCall {
                succeeded: false,
                error,
                ..
            } => error.clone(),
            _ => None,
        })
        .expect("failed tool call recorded");
    assert_eq!(first_failure, "UnreadTarget");
}

#[test]
fn overflow_recovers_via_level1_compaction() {
    let tmp = tempfile::tempdir().expect("tmp");
    let big = "content line\n".repeat(2000);
    fs::write(tmp.path().join("big.txt"), &big).expect("seed");

    let llm = Arc::new(ScriptedLlm::new(vec![
        Ok(tool_calls_response(vec![tool_call(
            "c1",
            "read_file",
            r#"{"path":"big.txt"}"#,
        )])),
        Ok(tool_calls_response(vec![tool_call(
            "c2",
            "read_file",
            r#"{"path":"big.txt"}"#,
        )])),
        Ok(tool_calls_response(vec![tool_call(
            "c3",
            "read_file",
            r#"{"path":"big.txt"}"#,
        )])),
        Err(overflow_error()),
        Ok(text_response("summarized the file")),
    ]));
    let mut session = session(tmp.path(), llm);
    let record = session.run("summarize big.txt");

    assert_eq!(record.outcome, Outcome::Success);
    let compactions: Vec<_> = record
        .report
        .timeline
        .iter()
        .filter_map(|e| match e {
            TimelineEvent::Compaction {
                strategy,
                tokens_before,
                tokens_after,
                ..
            } => Some((strategy.clone(), *tokens_before, *tokens_after)),
            _ => None,
        })
        .collect();
    assert_eq!(compactions.len(), 1);
    assert_eq!(compactions[0].0, "compact_messages");
    assert!(compactions[0].2 < compactions[0].1);

    let retry = record
        .report
        .timeline
        .iter()
        .find_map(|e| match e {
            TimelineEvent::LlmCall {
                is_retry: true,
                retry_reason,
                ..
            } => Some(retry_reason.clone()),
            _ => None,
        })
        .expect("retry llm call recorded");
    assert_eq!(retry.as_deref(), Some("compact_messages"));

    // P6: retries add llm calls without adding turns.
    assert_eq!(record.report.stats.turns, 4);
    assert_eq!(record.report.stats.llm_calls, 5);
}

#[test]
fn exhaustion_after_max_turns() {
    let tmp = tempfile::tempdir().expect("tmp");
    fs::write(tmp.path().join("f.txt"), "x\n").expect("seed");
    let responses = (0..3)
        .map(|i| {
            tool_calls_response(vec![tool_call(
                &format!("c{i}"),
                "read_file",
                r#"{"path":"f.txt"}"#,
            )])
        })
        .collect();
    let llm = Arc::new(ScriptedLlm::from_responses(responses));
    let mut session = Session::new(
        SessionConfig {
            max_turns: 3,
            ..config(tmp.path())
        },
        llm,
    )
    .expect("session");
    let record = session.run("loop forever");

    assert_eq!(record.outcome, Outcome::Exhausted);
    assert_eq!(record.exit_code, 2);
    assert_eq!(record.report.stats.turns, 3);
    assert!(record.answer.is_none());
    assert_eq!(record.report.result.answer, None);
}

#[test]
fn guardrail_stops_repeated_identical_failures() {
    let tmp = tempfile::tempdir().expect("tmp");
    let failing_edit = r#"{"path":"missing.txt","old_string":"a","new_string":"b"}"#;
    let llm = Arc::new(ScriptedLlm::from_responses(vec![
        tool_calls_response(vec![tool_call("c1", "edit_file", failing_edit)]),
        tool_calls_response(vec![tool_call("c2", "edit_file", failing_edit)]),
        tool_calls_response(vec![tool_call("c3", "edit_file", failing_edit)]),
        text_response("giving up on that file"),
    ]));
    let mut session = session(tmp.path(), llm);
    let record = session.run("edit missing.txt");

    let levels: Vec<String> = record
        .report
        .timeline
        .iter()
        .filter_map(|e| match e {
            TimelineEvent::Guardrail { level, .. } => Some(level.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(levels, vec!["nudge".to_string(), "stop".to_string()]);
    assert_eq!(record.report.stats.guardrail_interventions, 2);
}

#[test]
fn ssrf_private_address_rejected_without_network() {
    let tmp = tempfile::tempdir().expect("tmp");
    let llm = Arc::new(ScriptedLlm::from_responses(vec![
        tool_calls_response(vec![tool_call(
            "c1",
            "fetch_url",
            r#"{"url":"http://10.0.0.1/x"}"#,
        )]),
        text_response("cannot reach that host"),
    ]));
    let mut session = session(tmp.path(), llm);
    let record = session.run("fetch the internal page");

    let error = record
        .report
        .timeline
        .iter()
        .find_map(|e| match e {
            TimelineEvent::ToolCall {
                succeeded: false,
                error,
                ..
            } => error.clone(),
            _ => None,
        })
        .expect("failed fetch recorded");
    assert_eq!(error, "PrivateAddress");
}

#[test]
fn truncated_response_lets_model_continue() {
    let tmp = tempfile::tempdir().expect("tmp");
    let llm = Arc::new(ScriptedLlm::from_responses(vec![
        truncated_response("partial answer that ran out of"),
        text_response("full answer"),
    ]));
    let mut session = session(tmp.path(), llm);
    let record = session.run("explain");

    assert_eq!(record.outcome, Outcome::Success);
    assert_eq!(record.answer.as_deref(), Some("full answer"));
    assert_eq!(record.report.stats.truncated_responses, 1);
    assert_eq!(record.report.stats.turns, 2);
}

#[test]
fn invalid_tool_arguments_reported_with_null_args() {
    let tmp = tempfile::tempdir().expect("tmp");
    let llm = Arc::new(ScriptedLlm::from_responses(vec![
        tool_calls_response(vec![tool_call("c1", "read_file", "{not valid json")]),
        text_response("done"),
    ]));
    let mut session = session(tmp.path(), llm);
    let record = session.run("read something");

    let (arguments, error) = record
        .report
        .timeline
        .iter()
        .find_map(|e| match e {
            TimelineEvent::ToolCall {
                succeeded: false,
                arguments,
                error,
                ..
            } => Some((arguments.clone(), error.clone())),
            _ => None,
        })
        .expect("invalid call recorded");
    assert_eq!(arguments, None);
    assert_eq!(error.as_deref(), Some("InvalidToolArguments"));
}

#[test]
fn snapshot_recap_survives_into_later_prompts() {
    let tmp = tempfile::tempdir().expect("tmp");
    fs::write(tmp.path().join("a.txt"), "aaa\n").expect("seed");
    let llm = Arc::new(ScriptedLlm::from_responses(vec![
        tool_calls_response(vec![tool_call("c1", "read_file", r#"{"path":"a.txt"}"#)]),
        tool_calls_response(vec![tool_call("c2", "read_file", r#"{"path":"a.txt"}"#)]),
        tool_calls_response(vec![tool_call(
            "c3",
            "snapshot",
            r#"{"action":"restore","summary":"nothing interesting in a.txt"}"#,
        )]),
        tool_calls_response(vec![tool_call("c4", "read_file", r#"{"path":"a.txt"}"#)]),
        text_response("done"),
    ]));
    let scripted = llm.clone();
    let mut session = session(tmp.path(), llm);
    let record = session.run("investigate a.txt");
    assert_eq!(record.outcome, Outcome::Success);

    // Every system prompt after the restore carries the recap.
    let requests = scripted.requests();
    let after_restore = &requests[3..];
    assert!(!after_restore.is_empty());
    for request in after_restore {
        assert!(
            request.messages[0]
                .content
                .contains("nothing interesting in a.txt"),
            "recap missing from a later system prompt"
        );
    }
}

#[cfg(unix)]
#[test]
fn reviewer_rejection_adds_a_round() {
    let tmp = tempfile::tempdir().expect("tmp");
    // Rejects the first answer, accepts the second.
    let reviewer = "cat > /dev/null; if [ -f .reviewed ]; then exit 0; \
                    else touch .reviewed; echo 'mention the file name'; exit 1; fi";
    let llm = Arc::new(ScriptedLlm::from_responses(vec![
        text_response("first answer"),
        text_response("second answer, mentioning a.txt"),
    ]));
    let mut session = Session::new(
        SessionConfig {
            reviewer: Some(reviewer.to_string()),
            ..config(tmp.path())
        },
        llm,
    )
    .expect("session");
    let record = session.run("describe the repo");

    assert_eq!(record.outcome, Outcome::Success);
    assert_eq!(record.answer.as_deref(), Some("second answer, mentioning a.txt"));
    assert_eq!(record.report.stats.review_rounds, 2);
    let review_events = record
        .report
        .timeline
        .iter()
        .filter(|e| matches!(e, TimelineEvent::Review { .. }))
        .count();
    assert_eq!(review_events, 2);
}

#[test]
fn repl_ask_shares_context_and_reset_clears_it() {
    let tmp = tempfile::tempdir().expect("tmp");
    let llm = Arc::new(ScriptedLlm::from_responses(vec![
        text_response("answer one"),
        text_response("answer two"),
        text_response("answer three"),
    ]));
    let mut session = session(tmp.path(), llm);

    let r1 = session.ask("first question");
    let r2 = session.ask("second question");
    assert!(r2.messages.len() > r1.messages.len());

    session.reset();
    let r3 = session.ask("third question");
    assert!(r3.messages.len() < r2.messages.len());
}

#[cfg(unix)]
#[test]
fn mcp_server_degrades_after_crash_while_other_keeps_working() {
    let tmp = tempfile::tempdir().expect("tmp");

    // Server A answers every request by echoing the id back.
    let server_a = r#"awk '{
        match($0, /"id":[0-9]+/); id = substr($0, RSTART+5, RLENGTH-5);
        if (index($0, "tools/list"))
            print "{\"jsonrpc\":\"2.0\",\"id\":" id ",\"result\":{\"tools\":[{\"name\":\"echo\",\"description\":\"\",\"inputSchema\":{\"type\":\"object\"}}]}}";
        else if (index($0, "tools/call"))
            print "{\"jsonrpc\":\"2.0\",\"id\":" id ",\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"from A\"}]}}";
        else
            print "{\"jsonrpc\":\"2.0\",\"id\":" id ",\"result\":{}}";
        fflush();
    }'"#;
    // Server B prints three canned responses, serves one call, then dies.
    let server_b = r#"printf '%s\n' \
        '{"jsonrpc":"2.0","id":1,"result":{}}' \
        '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"ping","description":"","inputSchema":{"type":"object"}}]}}' \
        '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}]}}'; \
        sleep 1"#;
    fs::write(
        tmp.path().join(".mcp.json"),
        serde_json::json!({
            "mcpServers": {
                "alpha": {"command": "sh", "args": ["-c", server_a]},
                "beta": {"command": "sh", "args": ["-c", server_b]},
            }
        })
        .to_string(),
    )
    .expect("mcp config");

    let llm = Arc::new(ScriptedLlm::from_responses(vec![
        tool_calls_response(vec![tool_call("c1", "mcp__beta__ping", "{}")]),
        tool_calls_response(vec![tool_call("c2", "mcp__beta__ping", "{}")]),
        tool_calls_response(vec![tool_call("c3", "mcp__beta__ping", "{}")]),
        tool_calls_response(vec![tool_call("c4", "mcp__alpha__echo", "{}")]),
        text_response("finished"),
    ]));
    let mut session = Session::new(
        SessionConfig {
            mcp_enabled: true,
            ..config(tmp.path())
        },
        llm,
    )
    .expect("session");
    let record = session.run("poke the mcp servers");
    session.shutdown();

    assert_eq!(record.outcome, Outcome::Success);
    let beta = &record.report.stats.tool_calls_by_name["mcp__beta__ping"];
    assert_eq!(beta.succeeded, 1);
    assert_eq!(beta.failed, 2);
    let alpha = &record.report.stats.tool_calls_by_name["mcp__alpha__echo"];
    assert_eq!(alpha.succeeded, 1);

    // The last beta failure is the sticky degradation, not a transport error.
    let beta_errors: Vec<String> = record
        .report
        .timeline
        .iter()
        .filter_map(|e| match e {
            TimelineEvent::ToolCall {
                name,
                succeeded: false,
                error,
                ..
            } if name == "mcp__beta__ping" => error.clone(),
            _ => None,
        })
        .collect();
    assert_eq!(beta_errors.last().map(String::as_str), Some("McpDegraded"));
}
