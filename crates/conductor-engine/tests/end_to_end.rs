use std::sync::Arc;
use std::time::Duration;

use conductor_core::errors::ProviderError;
use conductor_core::messages::Message;
use conductor_core::settings::ConductorSettings;
use conductor_engine::{
    ContinueDecision, ConversationContext, OutputMode, Runner, RunnerConfig, Skill, SkillSet,
    StopReason, SubagentPool, TaskStatus,
};
use conductor_llm::{MockProvider, MockResponse, ReliableConfig, ReliableProvider};

fn settings() -> Arc<ConductorSettings> {
    let mut settings = ConductorSettings::default();
    settings.default_model = "mock-model".into();
    settings.subagents.max_concurrent = 2;
    settings.subagents.poll_interval_ms = 5;
    Arc::new(settings)
}

fn workflow_skills() -> Arc<SkillSet> {
    Arc::new(SkillSet::merge([vec![
        Skill::new("brainstorming", "Explore ideas before coding", "Brainstorm with me: {{input}}")
            .with_trigger("(design|brainstorm|plan)"),
        Skill::new("test-driven-development", "Red green refactor", "Write a failing test for {{input}}")
            .with_trigger("(test|tdd)"),
    ]]))
}

#[tokio::test]
async fn stop_policy_ends_after_one_turn_with_reason() {
    let settings = settings();
    let provider = Arc::new(MockProvider::always(MockResponse::chunks(&["All ", "done."])));
    let config = RunnerConfig {
        max_turns: 5,
        ..RunnerConfig::from_settings(&settings)
    };
    let mut runner = Runner::new(provider.clone(), config, OutputMode::Silent);
    let stop_now = |_: &ConversationContext| ContinueDecision::stop("objective met");

    let context = ConversationContext::new(Arc::clone(&settings), Arc::new(SkillSet::new()));
    let outcome = runner
        .run(context, "Summarise the release notes", Some(&stop_now))
        .await
        .unwrap();

    assert_eq!(outcome.turns, 1);
    assert_eq!(outcome.stop, StopReason::Policy("objective met".into()));
    assert_eq!(outcome.reply(), Some("All done."));
    assert_eq!(outcome.context.task_progress(), 20);
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn skill_routed_conversation_then_follow_up_chat() {
    let settings = settings();
    let provider = Arc::new(MockProvider::new(vec![
        MockResponse::text("Option A or option B."),
        MockResponse::text("Go with A."),
    ]));
    let mut runner = Runner::new(
        provider.clone(),
        RunnerConfig::from_settings(&settings),
        OutputMode::Silent,
    );
    let context = ConversationContext::new(Arc::clone(&settings), workflow_skills());

    let first = runner
        .run(context, "Let's design the cache layer", None)
        .await
        .unwrap();
    let second = runner
        .run(first.context, "Which one is simpler?", None)
        .await
        .unwrap();

    let requests = provider.requests();
    assert_eq!(
        requests[0].messages[0],
        Message::system("Brainstorm with me: Let's design the cache layer")
    );
    // no skill fires on the follow-up: full windowed history goes out
    assert_eq!(requests[1].messages.len(), 3);
    assert_eq!(second.reply(), Some("Go with A."));
    assert_eq!(runner.usage().entries().len(), 2);
}

#[tokio::test]
async fn reliable_provider_absorbs_transient_failure() {
    let settings = settings();
    let flaky = MockProvider::new(vec![
        MockResponse::Error(ProviderError::ServerError {
            status: 503,
            body: "busy".into(),
        }),
        MockResponse::text("recovered"),
    ]);
    let provider = Arc::new(ReliableProvider::new(
        flaky,
        ReliableConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..ReliableConfig::default()
        },
    ));
    let mut runner = Runner::new(
        provider.clone(),
        RunnerConfig::from_settings(&settings),
        OutputMode::Silent,
    );
    let context = ConversationContext::new(Arc::clone(&settings), Arc::new(SkillSet::new()));

    let outcome = runner.run(context, "hello", None).await.unwrap();
    assert_eq!(outcome.reply(), Some("recovered"));
    assert_eq!(provider.total_retries(), 1);
}

#[tokio::test]
async fn pool_runs_isolated_tasks_to_completion() {
    let settings = settings();
    let provider = Arc::new(MockProvider::always(MockResponse::delayed(
        Duration::from_millis(20),
        MockResponse::text("task finished"),
    )));
    let pool = SubagentPool::new(provider, Arc::clone(&settings), workflow_skills());

    let ids: Vec<_> = (0..5)
        .map(|i| pool.spawn(format!("background job {i}"), None))
        .collect();
    assert_eq!(pool.running_count(), 2);
    assert_eq!(pool.pending_count(), 3);

    for id in &ids {
        let task = pool.wait_for(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("task finished"));
    }
    assert_eq!(pool.tasks().len(), 5);
    assert_eq!(pool.running_count(), 0);
}
