//! `memctl search` output.

use anyhow::Result;

use bridge_memory_core::search::{SearchMode, SearchOutcome};

use crate::manager::{MemoryManager, SearchOptions};

pub async fn run_search(
    manager: &MemoryManager,
    query: &str,
    opts: SearchOptions,
    json: bool,
) -> Result<()> {
    let outcome = manager.search(query, opts).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

fn mode_label(mode: SearchMode) -> &'static str {
    match mode {
        SearchMode::Hybrid => "hybrid",
        SearchMode::VectorOnly => "vector only",
        SearchMode::LexicalOnly => "keyword only",
        SearchMode::Unavailable => "unavailable",
    }
}

pub fn print_outcome(outcome: &SearchOutcome) {
    if let Some(notice) = &outcome.notice {
        eprintln!("warning: {}", notice);
    }
    if outcome.results.is_empty() {
        println!("No results.");
        return;
    }

    for (i, result) in outcome.results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}:{}-{} ({})",
            i + 1,
            result.score,
            result.path,
            result.start_line,
            result.end_line,
            result.source
        );
        println!(
            "    excerpt: \"{}\"",
            result.snippet.replace('\n', " ").trim()
        );
        println!();
    }
    println!("mode: {}", mode_label(outcome.mode));
    if let Some(err) = &outcome.lexical_error {
        println!("keyword engine: {}", err);
    }
    if let Some(err) = &outcome.vector_error {
        println!("vector engine: {}", err);
    }
}
