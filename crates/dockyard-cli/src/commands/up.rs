use super::{describe, json_pretty, print_diagnostics, spin_fail, spin_ok, Session, EXIT_SUCCESS};
use dockyard_core::{CacheOutcome, UpOptions, UpOutcome, UpReport};

pub fn run(session: &Session, opts: &UpOptions, json_output: bool) -> Result<u8, String> {
    let pb = session.progress("bringing environment up...", json_output);
    let report = match session.engine.up(&session.workspace, opts) {
        Ok(report) => report,
        Err(e) => {
            spin_fail(&pb, "up failed");
            return Err(describe(&e));
        }
    };
    spin_ok(&pb, &summary(&report));

    if json_output {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }
    print_diagnostics(&report.diagnostics);
    println!("project:   {}", report.compose_project);
    if let Some(id) = &report.container_id {
        println!("container: {}", id.short(12));
    }
    if let Some(image) = &report.derived_image {
        let cache = match report.cache {
            Some(CacheOutcome::Cached) => " (cached)",
            _ => "",
        };
        println!("image:     {}{cache}", image.tag);
    }
    for hook in &report.hooks {
        println!("ran:       {hook}");
    }
    Ok(EXIT_SUCCESS)
}

fn summary(report: &UpReport) -> String {
    let verb = match report.outcome {
        UpOutcome::AlreadyRunning => "already running",
        UpOutcome::Started => "started",
        UpOutcome::Created => "created",
        UpOutcome::Recreated => "recreated",
    };
    format!("environment {} {verb}", report.env_key)
}
