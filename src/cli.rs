use colored::*;
use futures_util::StreamExt;
use std::io::Write;

use crate::pipeline::Pipeline;
use crate::types::{Query, Result, Stage};

fn heading(stage: Stage) -> ColoredString {
    match stage {
        Stage::Database => "── Database Results ──".bold().cyan(),
        Stage::Web => "── Web Results ──".bold().magenta(),
        Stage::Table => "── Results Overview ──".bold().green(),
    }
}

/// Runs one analysis, streaming every stage to stdout under its own heading.
pub async fn run_once(pipeline: &Pipeline, query: &str, include_web: bool) -> Result<()> {
    let query = Query::new(query)?;
    let mut analysis = pipeline.analyze(&query, include_web).await?;

    let mut stdout = std::io::stdout();
    let mut current: Option<Stage> = None;
    let mut printed = 0usize;

    while let Some(item) = analysis.next().await {
        match item {
            Ok(chunk) => {
                if current != Some(chunk.stage) {
                    if current.is_some() {
                        writeln!(stdout)?;
                    }
                    writeln!(stdout, "\n{}\n", heading(chunk.stage))?;
                    current = Some(chunk.stage);
                }
                write!(stdout, "{}", chunk.content)?;
                stdout.flush()?;
                printed += 1;
            }
            Err(e) => {
                writeln!(stdout)?;
                if printed > 0 {
                    eprintln!(
                        "{}",
                        "Output above is partial: the analysis stopped early.".yellow()
                    );
                }
                return Err(e);
            }
        }
    }
    writeln!(stdout)?;

    for result in analysis.results() {
        let note = if result.fell_back { " (fallback)" } else { "" };
        eprintln!(
            "{} {}: {} chunks from {}{}",
            "✓".green(),
            result.stage,
            result.chunks,
            result.model,
            note
        );
    }
    Ok(())
}
