//! noc-router: cycle-level wormhole router model

use std::env;
use std::path::Path;

use anyhow::{bail, Context};
use noc_router::config::Config;
use noc_router::router::RouterStats;
use noc_router::testing::{Scenario, ScenarioResult};

fn main() -> anyhow::Result<()> {
    let config = Config::get();

    // RUST_LOG wins over the configured filter
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_filter())).init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--sample-config") {
        print!("{}", Config::sample_config());
        return Ok(());
    }
    if args.iter().any(|a| a == "--sample-scenario") {
        print!("{}", Scenario::sample_scenario());
        return Ok(());
    }

    let mut show_stats = false;
    let mut max_ticks = None;
    let mut path = None;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--stats" => show_stats = true,
            "--max-ticks" => {
                let value = iter.next().context("--max-ticks needs a value")?;
                max_ticks = Some(value.parse::<u64>().with_context(|| format!("Invalid tick count '{}'", value))?);
            }
            other if other.starts_with('-') => bail!("Unknown option '{}'", other),
            other => path = Some(other),
        }
    }

    let Some(path) = path else {
        print_usage();
        return Ok(());
    };

    let mut scenario = Scenario::from_file(Path::new(path)).with_context(|| format!("Loading {}", path))?;
    if max_ticks.is_some() {
        scenario.max_ticks = max_ticks;
    }

    println!("Scenario: {}", scenario.name);
    if !scenario.description.is_empty() {
        println!("  {}", scenario.description);
    }
    println!();

    let result = scenario.run(config).with_context(|| format!("Running {}", scenario.name))?;
    print_deliveries(&result);
    println!();
    println!("Injected {} flits, delivered {}", result.injected, result.deliveries.len());

    if show_stats {
        println!();
        print_stats(&result.stats);
    }

    println!();
    if result.timed_out {
        println!("Not drained after {} ticks", result.ticks);
    }
    for mismatch in &result.mismatches {
        println!("MISMATCH {}", mismatch);
    }
    if !result.passed {
        bail!("Scenario '{}' failed", result.name);
    }
    println!("PASS ({} ticks)", result.ticks);

    Ok(())
}

fn print_usage() {
    println!("Usage: noc-router <scenario.toml> [--max-ticks N] [--stats]");
    println!("       noc-router --sample-config");
    println!("       noc-router --sample-scenario");
}

fn print_deliveries(result: &ScenarioResult) {
    println!("Deliveries");
    println!("==========");
    if result.deliveries.is_empty() {
        println!("  (none)");
    }
    for d in &result.deliveries {
        println!("  [{:4}] port {:2}  {}", d.cycle, d.port, d.flit);
    }
}

fn print_stats(stats: &RouterStats) {
    println!("Router Statistics");
    println!("=================");
    println!("  Cycles:              {}", stats.cycles);
    println!("  Flits received:      {}", stats.flits_received);
    println!("  Flits forwarded:     {}", stats.flits_forwarded);
    println!("  Grants:              {} ({} multicast)", stats.grants, stats.multicast_grants);
    println!("  Multicast withdrawn: {}", stats.multicast_withdrawn);
    println!("  Multicast voided:    {}", stats.multicast_voided);
    println!("  Egress stalls:       {}", stats.egress_stalls);
    println!("  Credits received:    {}", stats.credits_received);
    println!("  Credits returned:    {}", stats.credits_returned);
}
