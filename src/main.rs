use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod content;
mod eid;
mod errors;
mod hierarchy;
mod library;
mod mutation;
mod records;
mod remote;
mod replica;
mod search;
mod semantic;
mod storage;
mod sync;
#[cfg(test)]
mod tests;
mod token;
mod web;

use cli::Command;
use config::Config;
use content::{ChunkDraft, ContentMetadata, SourceType};
use eid::Eid;
use mutation::Mutation;
use search::SearchRequest;

pub fn parse_tags(tags: String) -> Vec<String> {
    tags.split(',')
        .flat_map(|value| value.split(' ').filter(|value| !value.is_empty()))
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Args::parse();

    let config = Config::load()?;
    let app = app::App::build(config)?;

    match args.command {
        Command::Daemon {} => web::start_daemon(app),

        Command::Search { query, max_results } => {
            let response = app.search().handle(&SearchRequest { query, max_results })?;
            print_json(&response)
        }

        Command::Add {
            source_type,
            title,
            id,
            file,
            tags,
            chunks,
        } => {
            let source_type: SourceType = source_type.parse().map_err(anyhow::Error::msg)?;
            let raw = std::fs::read_to_string(&chunks)
                .with_context(|| format!("failed to read {}", chunks.display()))?;
            let drafts: Vec<ChunkDraft> = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a JSON array of chunks", chunks.display()))?;

            let metadata = ContentMetadata {
                content_id: id.map(Eid::from),
                title,
                filename: file
                    .as_ref()
                    .and_then(|path| path.file_name())
                    .map(|name| name.to_string_lossy().to_string()),
                raw_file: file,
                tags: tags.map(parse_tags).unwrap_or_default(),
            };

            let status = app.mutations().apply(Mutation::Add {
                source_type,
                chunks: drafts,
                metadata,
            });
            print_json(&status)?;
            if !status.is_success() {
                bail!("{}", status.message);
            }
            Ok(())
        }

        Command::Delete {
            source_type,
            content_id,
        } => {
            let source_type: SourceType = source_type.parse().map_err(anyhow::Error::msg)?;
            let status = app.mutations().apply(Mutation::Delete {
                content_id: Eid::from(content_id),
                source_type,
            });
            print_json(&status)?;
            if !status.is_success() {
                bail!("{}", status.message);
            }
            Ok(())
        }

        Command::Sync { force } => print_json(&app.reload(force)),

        Command::Status {} => print_json(&app.status()),

        Command::Library { source_type, query } => {
            let filter = source_type
                .map(|raw| raw.parse::<SourceType>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let sources = match query {
                Some(query) => app.library().find(&query, filter),
                None => app.library().list_sources(filter),
            };
            print_json(&sources)
        }

        Command::Topic { id } => match app.library().topic(&id) {
            Some(topic) => print_json(&topic),
            None => bail!("topic not found: {id}"),
        },
    }
}
