use super::{describe, json_pretty, spin_fail, spin_ok, Session, EXIT_SUCCESS};

pub fn run(session: &Session, services: &[String], json_output: bool) -> Result<u8, String> {
    let pb = session.progress("starting environment...", json_output);
    let report = match session.engine.start(&session.workspace, services) {
        Ok(report) => report,
        Err(e) => {
            spin_fail(&pb, "start failed");
            return Err(describe(&e));
        }
    };
    if report.changed {
        spin_ok(&pb, &format!("started project {}", report.compose_project));
    } else {
        spin_ok(&pb, "already running");
    }

    if json_output {
        println!("{}", json_pretty(&report)?);
    } else {
        for hook in &report.hooks {
            println!("ran: {hook}");
        }
    }
    Ok(EXIT_SUCCESS)
}
