use std::sync::Arc;

use sayr_runner::telemetry::init_tracing;
use sayr_runner::tools::{web_search_toolkit, AgentTool, LoadMemoryTool, WebSearchConfig};
use sayr_runner::{
    session_store_from_config, Agent, AppConfig, AutoPersistHook, GeminiClient,
    InMemoryMemoryStore, LanguageModel, LlmAgent, MemoryStore, Result, RetryingModel, Runner,
    RunnerServer, SayrError, SequentialAgent, ToolRegistry,
};

const USAGE: &str =
    "usage: memory-agent <search|memory|auto-memory|coordinator|pipeline|serve>";

fn gemini(cfg: &AppConfig, google_search: bool) -> Result<Arc<dyn LanguageModel>> {
    let client = GeminiClient::from_config(&cfg.model)?.with_google_search(google_search);
    Ok(Arc::new(RetryingModel::new(Arc::new(client), cfg.retry.clone())))
}

async fn chat(runner: &Runner, user: &str, session: &str, queries: &[&str]) -> Result<()> {
    println!("\n### Session: {session}");
    for query in queries {
        println!("\nUser > {query}");
        let report = runner.run_turn(user, session, query).await?;
        println!("{} > {}", runner.agent().name(), report.response);
    }
    Ok(())
}

/// Grounds with Gemini's built-in Google Search when `SAYR_GOOGLE_SEARCH` is set,
/// otherwise with the client-side `web_search` tool.
async fn search(cfg: &AppConfig) -> Result<()> {
    let grounded = cfg.model.google_search;
    let mut agent = LlmAgent::new("helpful_assistant", gemini(cfg, grounded)?)
        .with_description("A simple agent that can answer general questions.")
        .with_instruction(
            "You are a helpful assistant. Use Google Search for current info or if unsure.",
        );
    if !grounded {
        agent = agent.with_tools(web_search_toolkit(WebSearchConfig::default()));
    }
    let runner = Runner::in_memory(&cfg.app.name, Arc::new(agent));
    let reply = runner
        .run_debug("What is Agent Development Kit from Google? What languages is the SDK available in?")
        .await?;
    println!("{reply}");
    Ok(())
}

async fn memory(cfg: &AppConfig) -> Result<()> {
    let sessions = session_store_from_config(&cfg.storage).await?;
    let memory: Arc<dyn MemoryStore> = Arc::new(InMemoryMemoryStore::new());
    let user = cfg.app.user_id.as_str();

    let plain = LlmAgent::new("MemoryDemoAgent", gemini(cfg, false)?)
        .with_instruction("Answer user questions in simple words.");
    let runner = Runner::new(&cfg.app.name, Arc::new(plain), sessions.clone())
        .with_memory(memory.clone());
    chat(
        &runner,
        user,
        "conversation-01",
        &["My favorite color is blue-green. Can you write a Haiku about it?"],
    )
    .await?;

    if let Some(session) = runner.session(user, "conversation-01").await? {
        println!("Session contains:");
        for turn in &session.turns {
            let preview: String = turn.content.chars().take(60).collect();
            println!("  {}: {preview}...", turn.role.as_str());
        }
    }
    let added = runner.persist_session(user, "conversation-01").await?;
    tracing::info!(records = added, "session added to memory");

    let mut tools = ToolRegistry::new();
    tools.register(LoadMemoryTool::new());
    let recalling = LlmAgent::new("MemoryDemoAgent", gemini(cfg, false)?)
        .with_instruction(
            "Answer user questions in simple words. Use load_memory tool if you need to recall past conversations.",
        )
        .with_tools(tools);
    let runner = Runner::new(&cfg.app.name, Arc::new(recalling), sessions).with_memory(memory);

    chat(&runner, user, "color-test", &["What is my favorite color?"]).await?;
    chat(&runner, user, "birthday-session-01", &["My birthday is on March 15th."]).await?;
    runner.persist_session(user, "birthday-session-01").await?;
    chat(&runner, user, "birthday-session-02", &["When is my birthday?"]).await?;

    let found = runner
        .search_memory(user, "What is the user's favorite color?")
        .await?;
    println!("Search Results:\n  Found {} relevant memories\n", found.len());
    for record in found {
        let preview: String = record.content.chars().take(80).collect();
        println!("  [{}]: {preview}...", record.author);
    }
    Ok(())
}

async fn auto_memory(cfg: &AppConfig) -> Result<()> {
    let agent = LlmAgent::new("AutoMemoryAgent", gemini(cfg, false)?)
        .with_instruction("Answer user questions.")
        .with_memory_preload(5);
    let runner = Runner::in_memory(&cfg.app.name, Arc::new(agent)).with_hook(AutoPersistHook);
    let user = cfg.app.user_id.as_str();

    chat(
        &runner,
        user,
        "auto-save-test",
        &["I gifted a new toy to my nephew on his 1st birthday!"],
    )
    .await?;
    chat(
        &runner,
        user,
        "auto-save-test-2",
        &["What did I gift my nephew on his 1st birthday?"],
    )
    .await
}

async fn coordinator(cfg: &AppConfig) -> Result<()> {
    let research: Arc<dyn Agent> = Arc::new(
        LlmAgent::new("ResearchAgent", gemini(cfg, true)?)
            .with_description("Finds relevant information on a topic using Google Search.")
            .with_instruction(
                "You are a specialized research agent. Your only job is to use the google_search tool \
                 to find 2-3 pieces of relevant information on the given topic and present the findings with citations.",
            )
            .with_output_key("research_findings"),
    );
    let summarizer: Arc<dyn Agent> = Arc::new(
        LlmAgent::new("SummarizerAgent", gemini(cfg, false)?)
            .with_description("Summarizes research findings.")
            .with_instruction(
                "Read the provided research findings: {research_findings}\n\
                 Create a concise summary as a bulleted list with 3-5 key points.",
            )
            .with_output_key("final_summary"),
    );

    let mut tools = ToolRegistry::new();
    tools.register(AgentTool::new(research));
    tools.register(AgentTool::new(summarizer));
    let root = LlmAgent::new("ResearchCoordinator", gemini(cfg, false)?)
        .with_instruction(
            "You are a research coordinator. Your goal is to answer the user's query by orchestrating a workflow.\n\
             1. First, you MUST call the `ResearchAgent` tool to find relevant information on the topic provided by the user.\n\
             2. Next, after receiving the research findings, you MUST call the `SummarizerAgent` tool to create a concise summary.\n\
             3. Finally, present the final summary clearly to the user as your response.",
        )
        .with_tools(tools);

    let runner = Runner::in_memory(&cfg.app.name, Arc::new(root));
    let reply = runner
        .run_debug("What are the latest advancements in quantum computing and what do they mean for AI?")
        .await?;
    println!("{reply}");
    Ok(())
}

async fn pipeline(cfg: &AppConfig) -> Result<()> {
    let outline: Arc<dyn Agent> = Arc::new(
        LlmAgent::new("OutlineAgent", gemini(cfg, false)?)
            .with_instruction(
                "Create a blog outline for the given topic with:\n\
                 1. A catchy headline\n\
                 2. An introduction hook\n\
                 3. 3-5 main sections with 2-3 bullet points for each\n\
                 4. A concluding thought",
            )
            .with_output_key("blog_outline"),
    );
    let writer: Arc<dyn Agent> = Arc::new(
        LlmAgent::new("WriterAgent", gemini(cfg, false)?)
            .with_instruction(
                "Following this outline strictly: {blog_outline}\n\
                 Write a brief, 200 to 300-word blog post with an engaging and informative tone.",
            )
            .with_output_key("blog_draft"),
    );
    let editor: Arc<dyn Agent> = Arc::new(
        LlmAgent::new("EditorAgent", gemini(cfg, false)?)
            .with_instruction(
                "Edit this draft: {blog_draft}\n\
                 Your task is to polish the text by fixing any grammatical errors, improving the flow \
                 and sentence structure, and enhancing overall clarity.",
            )
            .with_output_key("final_blog"),
    );

    let blog = SequentialAgent::new("BlogPipeline", vec![outline, writer, editor]);
    blog.validate(&Default::default())?;
    let runner = Runner::in_memory(&cfg.app.name, Arc::new(blog));
    let reply = runner
        .run_debug("Write a blog post about the benefits of multi-agent systems for software developers")
        .await?;
    println!("{reply}");
    Ok(())
}

async fn serve(cfg: &AppConfig) -> Result<()> {
    let agent = LlmAgent::new("MemoryDemoAgent", gemini(cfg, false)?)
        .with_instruction(
            "Answer user questions in simple words. Use load_memory tool if you need to recall past conversations.",
        )
        .with_tools({
            let mut tools = ToolRegistry::new();
            tools.register(LoadMemoryTool::new());
            tools
        });
    let sessions = session_store_from_config(&cfg.storage).await?;
    let runner = Runner::new(&cfg.app.name, Arc::new(agent), sessions)
        .with_memory(Arc::new(InMemoryMemoryStore::new()))
        .with_hook(AutoPersistHook);
    RunnerServer::new(Arc::new(runner))
        .serve(cfg.server.socket_addr()?)
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("memory-agent", false);
    let scenario = std::env::args().nth(1).unwrap_or_else(|| "memory".to_string());
    let cfg = AppConfig::from_env()?;

    match scenario.as_str() {
        "search" => search(&cfg).await,
        "memory" => memory(&cfg).await,
        "auto-memory" => auto_memory(&cfg).await,
        "coordinator" => coordinator(&cfg).await,
        "pipeline" => pipeline(&cfg).await,
        "serve" => serve(&cfg).await,
        other => Err(SayrError::Config(format!("unknown scenario `{other}`; {USAGE}"))),
    }
}
