//! Terminal rendering of lifecycle results.

use std::collections::BTreeMap;
use std::process::ExitCode;

use colored::{ColoredString, Colorize};
use warden_config::WardenConfig;
use warden_supervisor::{CheckReport, InitReport, ShutdownReport};
use warden_types::{HealthState, LifecycleEvent, LifecycleKind, ServiceClass};

/// `1` only when a base service failed; optional failures never change it.
pub fn exit_code(report: &InitReport) -> ExitCode {
    if report.success { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

pub fn print_init(report: &InitReport) {
    println!();
    for name in &report.started {
        println!("  {} {}", "✓".green().bold(), name.bold());
    }
    for name in &report.skipped {
        println!("  {} {} {}", "•".dimmed(), name, "(already running)".dimmed());
    }
    for failure in &report.failed_optional {
        println!(
            "  {} {} {} after {} attempt(s): {}",
            "!".yellow().bold(),
            failure.service.bold(),
            "(optional)".dimmed(),
            failure.attempts,
            failure.error
        );
    }
    for failure in &report.failed_base {
        println!(
            "  {} {} after {} attempt(s): {}",
            "✗".red().bold(),
            failure.service.bold(),
            failure.attempts,
            failure.error
        );
    }
    println!();
    if report.success {
        let degraded = report.failed_optional.len();
        if degraded == 0 {
            println!("  {} all services are {}", "✓".green().bold(), "RUNNING".green().bold());
        } else {
            println!(
                "  {} running {} ({} optional service(s) unavailable)",
                "✓".green().bold(),
                "DEGRADED".yellow().bold(),
                degraded
            );
        }
    } else {
        println!(
            "  {} base service(s) failed: {}",
            "✗".red().bold(),
            report.failed_base_names().join(", ").red()
        );
    }
}

pub fn print_shutdown(report: &ShutdownReport) {
    println!(
        "  {} stopped {} service(s), withdrew {} registration(s)",
        "✓".green(),
        report.stopped.len(),
        report.deregistered.len()
    );
    for (service, error) in &report.errors {
        println!("  {} {}: {}", "!".yellow().bold(), service.bold(), error);
    }
}

pub fn print_waves(waves: &[Vec<String>]) {
    for (i, wave) in waves.iter().enumerate() {
        println!("  {} {}", format!("[{}]", i + 1).cyan(), wave.join(", "));
    }
}

pub fn print_check(report: &CheckReport) {
    println!("  {} dependency graph is acyclic ({} wave(s))", "✓".green().bold(), report.waves.len());
    print_waves(&report.waves);
    println!();
    for (name, health) in &report.health {
        println!("  {:<24} {}", name, health_label(*health));
    }
}

/// One row per configured service: class, start wave, probe result.
pub fn print_status(config: &WardenConfig, report: &CheckReport) {
    let wave_of: BTreeMap<&str, usize> = report
        .waves
        .iter()
        .enumerate()
        .flat_map(|(i, wave)| wave.iter().map(move |name| (name.as_str(), i + 1)))
        .collect();

    println!("  {:<24} {:<9} {:<5} {}", "SERVICE".bold(), "CLASS".bold(), "WAVE".bold(), "HEALTH".bold());
    for def in config.services.iter() {
        let class = match def.class {
            ServiceClass::Base => "base".normal(),
            ServiceClass::Optional => "optional".dimmed(),
        };
        let kind = if def.external { " (external)" } else { "" };
        let wave = wave_of.get(def.name.as_str()).map(ToString::to_string).unwrap_or_default();
        let health = report.health.get(&def.name).copied().unwrap_or_default();
        println!(
            "  {:<24} {:<9} {:<5} {}{}",
            def.name,
            class,
            wave,
            health_label(health),
            kind.dimmed()
        );
    }
}

pub fn print_event(event: &LifecycleEvent) {
    println!(
        "  {} {:<20} {}",
        event.timestamp.format("%H:%M:%S").to_string().dimmed(),
        event.service,
        describe(&event.kind)
    );
}

fn health_label(health: HealthState) -> ColoredString {
    match health {
        HealthState::Healthy => "healthy".green(),
        HealthState::Unhealthy => "unhealthy".red(),
        HealthState::Unknown => "unknown".dimmed(),
    }
}

fn describe(kind: &LifecycleKind) -> ColoredString {
    match kind {
        LifecycleKind::Starting { attempt } => format!("starting (attempt {attempt})").cyan(),
        LifecycleKind::Running { pid: Some(pid) } => format!("running (pid {pid})").green(),
        LifecycleKind::Running { pid: None } => "running".green(),
        LifecycleKind::AttemptFailed { attempt, reason } => format!("attempt {attempt} failed: {reason}").yellow(),
        LifecycleKind::Failed { reason } => format!("failed: {reason}").red().bold(),
        LifecycleKind::Registered { id } => format!("registered as {id}").normal(),
        LifecycleKind::Deregistered { id } => format!("deregistered {id}").dimmed(),
        LifecycleKind::Stopping => "stopping".yellow(),
        LifecycleKind::Stopped => "stopped".dimmed(),
        LifecycleKind::Crashed { exit_code: Some(code) } => format!("crashed (exit code {code})").red().bold(),
        LifecycleKind::Crashed { exit_code: None } => "crashed (signal)".red().bold(),
    }
}
