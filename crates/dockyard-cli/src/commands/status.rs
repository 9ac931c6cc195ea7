use super::{colorize_state, describe, json_pretty, Session, EXIT_SUCCESS};

pub fn run(session: &Session, json_output: bool) -> Result<u8, String> {
    let report = session
        .engine
        .status(&session.workspace)
        .map_err(|e| describe(&e))?;

    if json_output {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("workspace: {}", report.identity.workspace_path);
    println!("env key:   {}", report.identity.env_key);
    println!("project:   {}", report.identity.compose_project);
    println!(
        "plan:      {} (primary service '{}')",
        report.plan, report.primary_service
    );
    println!(
        "runtime:   {}",
        session.settings.runtime_settings().runtime
    );
    println!("state:     {}", colorize_state(report.state));
    for container in &report.containers {
        let service = container.service().unwrap_or("-");
        let running = if container.running { "running" } else { "stopped" };
        println!(
            "  {} {service:<12} {running}",
            container.id.short(12)
        );
    }
    Ok(EXIT_SUCCESS)
}
