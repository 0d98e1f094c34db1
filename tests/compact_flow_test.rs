//! Integration tests for compaction: threshold gating, Phase-1
//! truncation, Phase-2 summarization, and the agent-level trigger.

mod common;

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use agent_core::compact::{
    COMPACT_THRESHOLD_PERCENT, TRUNCATED_MARKER, compact_conversation, summarize_conversation,
    truncate_tool_results,
};
use agent_core::{
    Agent, AgentConfig, AgentItem, ContentBlock, Error, Message, Role, StopReason, TokenCounter,
    ToolResultBlock, ToolUseBlock, UsageInfo,
};
use common::{MockProvider, ScriptedTurn, text_final};

fn tool_round(id: &str, content: &str) -> [Message; 2] {
    [
        Message::assistant(vec![ContentBlock::ToolUse(ToolUseBlock::new(
            id,
            "read_file",
            json!({"path": "x"}),
        ))]),
        Message::user_blocks(vec![ContentBlock::ToolResult(ToolResultBlock::new(
            id, content,
        ))]),
    ]
}

fn conversation_with_rounds(n: usize) -> Vec<Message> {
    let mut conversation = vec![Message::user("start")];
    for i in 0..n {
        conversation.extend(tool_round(&format!("t{i}"), &format!("result {i}")));
    }
    conversation.push(Message::assistant(vec![ContentBlock::text("done")]));
    conversation
}

fn counter_at(percent: f64) -> TokenCounter {
    let mut counter = TokenCounter::new(1000);
    counter.update_from_usage(&UsageInfo {
        input_tokens: (percent * 10.0) as u64,
        ..Default::default()
    });
    counter
}

#[tokio::test]
async fn test_phase_one_truncates_old_rounds_and_skips_phase_two() {
    let provider = MockProvider::new(vec![]);
    let mut conversation = conversation_with_rounds(3);

    let outcome = compact_conversation(&mut conversation, &provider, &counter_at(85.0))
        .await
        .unwrap();

    assert_eq!(outcome.truncated, 2);
    assert!(!outcome.summarized);
    assert!(outcome.summary.is_none());
    // Phase 2 never ran.
    assert!(provider.create_calls().is_empty());

    // The first two rounds are truncated, the last untouched.
    let result_content = |i: usize| {
        conversation[i].content.blocks()[0]
            .as_tool_result()
            .unwrap()
            .content
            .clone()
    };
    assert_eq!(result_content(2), TRUNCATED_MARKER);
    assert_eq!(result_content(4), TRUNCATED_MARKER);
    assert_eq!(result_content(6), "result 2");
}

#[tokio::test]
async fn test_below_threshold_is_a_noop() {
    let provider = MockProvider::new(vec![]);
    let mut conversation = conversation_with_rounds(3);
    let before = conversation.clone();

    let outcome = compact_conversation(&mut conversation, &provider, &counter_at(79.9))
        .await
        .unwrap();

    assert_eq!(outcome.truncated, 0);
    assert!(!outcome.summarized);
    assert_eq!(conversation, before);
}

#[tokio::test]
async fn test_phase_two_runs_once_truncation_is_exhausted() {
    let provider = MockProvider::new(vec![]);

    // Old plain exchanges, then one recent tool round. Phase 1 preserves
    // the only round, truncates nothing, and falls through to Phase 2.
    let mut conversation = vec![
        Message::user("q1"),
        Message::assistant_text("a1"),
        Message::user("q2"),
        Message::assistant_text("a2"),
    ];
    conversation.extend(tool_round("t9", "recent result"));
    conversation.push(Message::assistant(vec![ContentBlock::text("done")]));
    let suffix = conversation[3..].to_vec();

    let outcome = compact_conversation(&mut conversation, &provider, &counter_at(85.0))
        .await
        .unwrap();

    assert_eq!(outcome.truncated, 0);
    assert!(outcome.summarized);
    assert_eq!(outcome.summary.as_deref(), Some("a concise summary"));
    assert_eq!(provider.create_calls().len(), 1);

    // The prefix became the synthetic summary exchange; the suffix is
    // untouched.
    assert_eq!(conversation[0].role, Role::User);
    assert_eq!(
        conversation[0].content.text().unwrap(),
        "Here is a summary of the prior conversation: a concise summary"
    );
    assert_eq!(conversation[1].role, Role::Assistant);
    assert_eq!(
        conversation[1].content.text().unwrap(),
        "OK, I understand the prior conversation."
    );
    assert_eq!(&conversation[2..], suffix.as_slice());
}

#[tokio::test]
async fn test_contiguous_tool_rounds_defer_summarization() {
    // When everything between the head and the kept tail is tool
    // exchanges, the safe split walks below 2 and Phase 2 declines.
    let provider = MockProvider::new(vec![]);
    let mut conversation = conversation_with_rounds(3);
    truncate_tool_results(&mut conversation, 1);

    let outcome = compact_conversation(&mut conversation, &provider, &counter_at(85.0))
        .await
        .unwrap();

    assert_eq!(outcome.truncated, 0);
    assert!(!outcome.summarized);
    assert!(provider.create_calls().is_empty());
}

#[tokio::test]
async fn test_summary_request_renders_role_tagged_text() {
    let provider = MockProvider::new(vec![]);
    let mut conversation = vec![
        Message::user("q1"),
        Message::assistant(vec![ContentBlock::text("a1")]),
        Message::user("q2"),
        Message::assistant(vec![ContentBlock::text("a2")]),
        Message::user("q3"),
        Message::assistant(vec![ContentBlock::text("a3")]),
    ];

    summarize_conversation(&mut conversation, &provider, 4)
        .await
        .unwrap();

    let calls = provider.create_calls();
    assert_eq!(calls.len(), 1);
    let (messages, system) = &calls[0];
    assert!(system.contains("summarization assistant"));
    assert_eq!(messages.len(), 1);
    let request = messages[0].content.text().unwrap();
    assert!(request.contains("user: q1"));
    assert!(request.contains("assistant: a1"));
    // The kept suffix is not part of the request.
    assert!(!request.contains("q3"));
}

#[tokio::test]
async fn test_short_conversation_skips_summarization() {
    let provider = MockProvider::new(vec![]);
    let mut conversation = vec![Message::user("only"), Message::assistant_text("turn")];
    let before = conversation.clone();

    let summary = summarize_conversation(&mut conversation, &provider, 4)
        .await
        .unwrap();

    assert!(summary.is_none());
    assert_eq!(conversation, before);
    assert!(provider.create_calls().is_empty());
}

#[tokio::test]
async fn test_summarization_failure_leaves_conversation_unchanged() {
    let provider = MockProvider::new(vec![]);
    provider.set_create_result(Err(Error::server_transient("500")));

    let mut conversation = conversation_with_rounds(0);
    conversation.extend([
        Message::user("q2"),
        Message::assistant_text("a2"),
        Message::user("q3"),
        Message::assistant_text("a3"),
        Message::user("q4"),
        Message::assistant_text("a4"),
    ]);
    let before = conversation.clone();

    let result = compact_conversation(&mut conversation, &provider, &counter_at(90.0)).await;

    assert!(matches!(result, Err(Error::ServerTransient(_))));
    assert_eq!(conversation, before);
}

#[tokio::test]
async fn test_truncation_is_idempotent_across_passes() {
    let mut conversation = conversation_with_rounds(4);
    assert_eq!(truncate_tool_results(&mut conversation, 1), 3);
    assert_eq!(truncate_tool_results(&mut conversation, 1), 0);
}

#[tokio::test]
async fn test_agent_triggers_compaction_over_threshold() {
    // Usage 85% of the 200k window.
    let provider = Arc::new(MockProvider::new(vec![ScriptedTurn::Stream {
        fragments: vec!["ok"],
        final_message: text_final("ok", StopReason::EndTurn, 170_000, 50),
    }]));

    let mut agent = Agent::new(AgentConfig::default(), provider);
    // Seed history with old tool rounds for Phase 1 to chew on.
    let mut seeded = conversation_with_rounds(3);
    seeded.push(Message::assistant_text("earlier reply"));
    agent.set_conversation(seeded);

    let items: Vec<AgentItem> = agent
        .stream_message("continue", &[])
        .unwrap()
        .map(|i| i.unwrap())
        .collect()
        .await;

    assert!(items.contains(&AgentItem::Compacted {
        truncated: 2,
        summarized: false,
    }));

    let marker_count = agent
        .conversation()
        .iter()
        .flat_map(|m| m.content.blocks())
        .filter_map(|b| b.as_tool_result())
        .filter(|r| r.content == TRUNCATED_MARKER)
        .count();
    assert_eq!(marker_count, 2);
}

#[tokio::test]
async fn test_agent_below_threshold_never_compacts() {
    let provider = Arc::new(MockProvider::new(vec![ScriptedTurn::Stream {
        fragments: vec!["ok"],
        final_message: text_final("ok", StopReason::EndTurn, 1_000, 50),
    }]));

    let mut agent = Agent::new(AgentConfig::default(), provider);
    agent.set_conversation(conversation_with_rounds(3));

    let items: Vec<AgentItem> = agent
        .stream_message("continue", &[])
        .unwrap()
        .map(|i| i.unwrap())
        .collect()
        .await;

    assert!(
        !items
            .iter()
            .any(|i| matches!(i, AgentItem::Compacted { .. }))
    );
    assert!(
        (agent.token_counter().usage_percent()) < COMPACT_THRESHOLD_PERCENT,
        "test premise: usage stays below the threshold"
    );
}
