use anyhow::Result;
use colored::*;
use localrag_core::{ConnectionParams, RagConfig, StopSignal};
use localrag_llm::{ModelCatalog, ModelRouter, ProviderRegistry, StreamingClient};
use localrag_rag::{DirectoryRetriever, QueryRequest, QueryUpdate, RagQueryManager};
use std::io::Write;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing::info;

pub struct AskArgs {
    pub query: String,
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub knowledge_base: String,
    pub system_prompt: String,
}

pub async fn handle_ask(config: &RagConfig, args: AskArgs) -> Result<()> {
    let stop = StopSignal::global();
    stop.reset();

    // Ctrl-C asks the running query to stop at its next checkpoint
    let watcher_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stop requested from terminal");
            watcher_stop.set_stop(true);
        }
    });

    let router = ModelRouter::new(StreamingClient::from_config(config)?);
    let rag = RagQueryManager::new(
        Arc::new(router),
        Arc::new(DirectoryRetriever::from_config(config)),
        config,
    )
    .with_stop_signal(stop);

    let request = QueryRequest {
        params: ConnectionParams {
            endpoint: args.api_url,
            credential: args.api_key,
            model_id: args.model,
        },
        knowledge_base: args.knowledge_base,
        system_prompt: args.system_prompt,
        user_prompt: args.query,
    };

    let mut handle = rag.execute_rag_query(request);
    let mut stdout = std::io::stdout();
    while let Some(update) = handle.next_update().await {
        match update {
            QueryUpdate::Progress(p) => {
                eprintln!("{} {}", p.stage.cyan(), p.detail.dimmed());
            }
            QueryUpdate::Chunk(chunk) => {
                print!("{}", chunk);
                stdout.flush()?;
            }
        }
    }

    match handle.finish().await {
        Ok(_) => {
            println!();
            Ok(())
        }
        Err(e) => {
            println!();
            eprintln!("{} {}", "❌".red(), e.to_string().red());
            Err(e.into())
        }
    }
}

#[derive(Tabled)]
struct ProviderRow {
    #[tabled(rename = "Provider")]
    name: String,
    #[tabled(rename = "Base URL")]
    base_url: String,
    #[tabled(rename = "Suggested models")]
    models: String,
}

pub fn handle_providers() {
    let registry = ProviderRegistry::default();
    let rows: Vec<ProviderRow> = registry
        .providers()
        .iter()
        .map(|p| ProviderRow {
            name: p.display_name.clone(),
            base_url: p.default_base_url.clone(),
            models: p.suggested_models.join(", "),
        })
        .collect();
    println!("{}", Table::new(rows));
}

pub async fn handle_kbs(config: &RagConfig) -> Result<()> {
    let retriever = DirectoryRetriever::from_config(config);
    let names = retriever.list_knowledge_bases().await?;
    if names.is_empty() {
        println!("{}", config.no_kb_sentinel.yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!("📚 Knowledge bases in {}", retriever.root().display()).cyan()
    );
    for name in names {
        println!("  {}", name);
    }
    Ok(())
}

#[derive(Tabled)]
struct ModelRow {
    #[tabled(rename = "Model")]
    id: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Modified")]
    modified: String,
}

fn format_size(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    if bytes as f64 >= 1024.0 * MB {
        format!("{:.1} GB", bytes as f64 / (1024.0 * MB))
    } else {
        format!("{:.1} MB", bytes as f64 / MB)
    }
}

pub fn handle_models(config: &RagConfig) -> Result<()> {
    let catalog = ModelCatalog::new(config.models_dir());
    let models = catalog.list_models()?;
    if models.is_empty() {
        println!(
            "{}",
            format!("No local models in {}", catalog.models_dir().display()).yellow()
        );
        return Ok(());
    }

    let rows: Vec<ModelRow> = models
        .into_iter()
        .map(|m| ModelRow {
            id: m.id,
            size: format_size(m.size_bytes),
            modified: m
                .modified_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default(),
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}
