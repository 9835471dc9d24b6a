use anyhow::{Context, Result};
use clap::Parser;
use nlq_engine::clarification::ClarificationResponse;
use nlq_engine::config::{parse_threshold, EngineConfig, ExtractorKind};
use nlq_engine::feedback::{FeedbackQueue, FeedbackStore, SqliteFeedbackStore, TracingFeedbackStore};
use nlq_engine::knowledge::{DomainKnowledgeBase, KnowledgeDefinition};
use nlq_engine::orchestrator::{QueryOrchestrator, QueryResult};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nlq")]
#[command(about = "Turn an analytics question into SQL, asking for clarification when needed")]
struct Args {
    /// The question in natural language
    question: String,

    /// Extractor to use: rule or llm (or set NLQ_EXTRACTOR)
    #[arg(long)]
    extractor: Option<ExtractorKind>,

    /// JSON knowledge base definition (default: built-in gaming dictionary)
    #[arg(short, long)]
    knowledge_base: Option<PathBuf>,

    /// SQLite file for clarification feedback
    #[arg(long)]
    feedback_db: Option<PathBuf>,

    /// Print the final result as JSON
    #[arg(long)]
    json: bool,

    /// Print clarification prompts and exit instead of asking
    #[arg(long)]
    non_interactive: bool,

    /// Print placeholder SQL and its bound values
    #[arg(long)]
    parameterized: bool,

    /// Minimum fuzzy score for a term to match (or set NLQ_ACCEPT_THRESHOLD)
    #[arg(long, value_parser = threshold_arg)]
    accept_threshold: Option<f64>,

    /// Matches scoring below this are confirmed with the user (or set NLQ_AMBIGUITY_THRESHOLD)
    #[arg(long, value_parser = threshold_arg)]
    ambiguity_threshold: Option<f64>,

    /// Minimum score for a suggestion (or set NLQ_SUGGESTION_THRESHOLD)
    #[arg(long, value_parser = threshold_arg)]
    suggestion_threshold: Option<f64>,
}

fn threshold_arg(raw: &str) -> std::result::Result<f64, String> {
    parse_threshold(raw, "threshold").map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let mut config = EngineConfig::from_env()?;
    if let Some(kind) = args.extractor {
        config.extractor = kind;
    }
    if args.knowledge_base.is_some() {
        config.knowledge_base_path = args.knowledge_base.clone();
    }
    if args.feedback_db.is_some() {
        config.feedback_db_path = args.feedback_db.clone();
    }
    if let Some(value) = args.accept_threshold {
        config.matching.accept_threshold = value;
    }
    if let Some(value) = args.ambiguity_threshold {
        config.matching.ambiguity_threshold = value;
    }
    if let Some(value) = args.suggestion_threshold {
        config.matching.suggestion_threshold = value;
    }

    let store: Box<dyn FeedbackStore> = match &config.feedback_db_path {
        Some(path) => Box::new(
            SqliteFeedbackStore::open(path)
                .with_context(|| format!("opening feedback db {}", path.display()))?,
        ),
        None => Box::new(TracingFeedbackStore),
    };
    let (queue, worker) = FeedbackQueue::spawn(store);

    let kb = match &config.knowledge_base_path {
        Some(path) => DomainKnowledgeBase::new(KnowledgeDefinition::load(path)?)?,
        None => DomainKnowledgeBase::gaming(),
    };
    let kb = Arc::new(kb.with_matching(config.matching).with_feedback(queue));

    info!("nlq starting...");
    info!("Question: {}", args.question);

    let orchestrator = QueryOrchestrator::new(&config, kb)?;
    let result = run(&orchestrator, &args).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result, args.parameterized);
    }

    // every queue clone must be gone before the worker can drain and stop
    drop(orchestrator);
    worker.finish();

    if result.is_successful {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn run(orchestrator: &QueryOrchestrator, args: &Args) -> Result<QueryResult> {
    let mut result = orchestrator.process(&args.question).await;

    while result.is_successful && result.needs_clarification {
        let Some(clarification) = result.clarification.clone() else {
            break;
        };
        if args.non_interactive {
            if !args.json {
                print_prompts(&clarification);
            }
            break;
        }

        let responses = ask(&clarification)?;
        if responses.is_empty() {
            warn!("No answers given, stopping");
            break;
        }
        result = orchestrator.apply_clarification(result.entities, &responses);
    }

    Ok(result)
}

fn print_prompts(clarification: &ClarificationResponse) {
    for (idx, prompt) in clarification.prompts.iter().enumerate() {
        println!("\nQuestion {}: {}", idx + 1, prompt.question);
        for (opt_idx, option) in prompt.options.iter().enumerate() {
            println!("  {}. {}", opt_idx + 1, option);
        }
        println!("  (id: {})", prompt.conflict_id);
    }
}

/// One answer per prompt: an option number or free text
fn ask(clarification: &ClarificationResponse) -> Result<HashMap<String, String>> {
    let mut answers = HashMap::new();
    for (idx, prompt) in clarification.prompts.iter().enumerate() {
        println!("\nQuestion {}: {}", idx + 1, prompt.question);
        for (opt_idx, option) in prompt.options.iter().enumerate() {
            println!("  {}. {}", opt_idx + 1, option);
        }

        if prompt.options.is_empty() {
            print!("Your answer: ");
        } else {
            print!("Your choice (1-{} or type a value): ", prompt.options.len());
        }
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        let answer = match input.parse::<usize>() {
            Ok(choice) if (1..=prompt.options.len()).contains(&choice) => {
                prompt.options[choice - 1].clone()
            }
            _ => input.to_string(),
        };
        answers.insert(prompt.conflict_id.to_string(), answer);
    }
    Ok(answers)
}

fn print_result(result: &QueryResult, parameterized: bool) {
    if !result.is_successful {
        eprintln!(
            "\n❌ {}",
            result.error_message.as_deref().unwrap_or("Query failed")
        );
        return;
    }
    if result.needs_clarification {
        println!("\nClarification still needed ({} open conflicts)", result.entities.conflicts.len());
        return;
    }

    println!("\n=== SQL ===");
    match (&result.parameterized, parameterized) {
        (Some(compiled), true) => {
            println!("{}", compiled.sql);
            for (idx, value) in compiled.params.iter().enumerate() {
                println!("  ${} = {:?}", idx + 1, value);
            }
        }
        _ => println!("{}", result.sql.as_deref().unwrap_or_default()),
    }
    println!("\nConfidence: {:.2}", result.entities.overall_confidence);
}
