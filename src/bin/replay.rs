use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use mathmate::tutor::{is_bare_number, Rewriter};

#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(about = "Replay recorded raw completions through the reply rewriter")]
struct Cli {
    #[arg(long, default_value = "replay/cases.jsonl")]
    file: String,
    /// Identity token used for every case's session key.
    #[arg(long, default_value = "replay")]
    identity: String,
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct ReplayCase {
    #[serde(default)]
    id: Option<String>,
    raw: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    grade: String,
    #[serde(default)]
    focus: String,
    #[serde(default)]
    expect_contains: Vec<String>,
    #[serde(default)]
    expect_absent: Vec<String>,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let cases = load_cases(&cli.file)?;
    if cases.is_empty() {
        anyhow::bail!("no cases found in {}", cli.file);
    }

    // One rewriter for the whole file so repetition memory carries across lines.
    let rewriter = Rewriter::in_memory();

    let mut total = 0usize;
    let mut passed = 0usize;

    for (idx, case) in cases.iter().enumerate() {
        total += 1;
        let label = case
            .id
            .clone()
            .unwrap_or_else(|| format!("case-{}", idx + 1));

        let reply = rewriter.rewrite(
            &case.raw,
            &case.level,
            &case.focus,
            &case.grade,
            &cli.identity,
            is_bare_number(&case.message),
        );

        let failures = check_expectations(&reply, case);
        if failures.is_empty() {
            passed += 1;
        } else {
            println!("FAIL {label}");
            for failure in &failures {
                println!("  {failure}");
            }
        }

        if cli.verbose || !failures.is_empty() {
            println!("--- {label} ---");
            println!("raw:   {}", case.raw.replace('\n', " / "));
            println!("reply: {}", reply.replace('\n', " / "));
            println!();
        }
    }

    println!("Replay cases: {total}");
    println!("Passed: {passed}");
    println!("Failed: {}", total - passed);

    if passed != total {
        std::process::exit(1);
    }
    Ok(())
}

fn check_expectations(reply: &str, case: &ReplayCase) -> Vec<String> {
    let lower = reply.to_lowercase();
    let mut failures = Vec::new();

    for needle in &case.expect_contains {
        if !lower.contains(&needle.to_lowercase()) {
            failures.push(format!("missing {needle:?}"));
        }
    }
    for needle in &case.expect_absent {
        if lower.contains(&needle.to_lowercase()) {
            failures.push(format!("unexpected {needle:?}"));
        }
    }

    failures
}

fn load_cases(path: &str) -> Result<Vec<ReplayCase>> {
    let file = File::open(path).with_context(|| format!("failed opening {}", path))?;
    let reader = BufReader::new(file);
    let mut cases = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parsed: ReplayCase = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON at {} line {}", path, idx + 1))?;
        cases.push(parsed);
    }

    Ok(cases)
}
