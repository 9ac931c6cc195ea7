use super::{describe, json_pretty, spin_fail, spin_ok, Session, EXIT_SUCCESS};

pub fn run(session: &Session, services: &[String], json_output: bool) -> Result<u8, String> {
    let pb = session.progress("stopping environment...", json_output);
    let report = match session.engine.stop(&session.workspace, services) {
        Ok(report) => report,
        Err(e) => {
            spin_fail(&pb, "stop failed");
            return Err(describe(&e));
        }
    };
    if report.changed {
        spin_ok(&pb, &format!("stopped project {}", report.compose_project));
    } else {
        spin_ok(&pb, "nothing to stop");
    }

    if json_output {
        println!("{}", json_pretty(&report)?);
    }
    Ok(EXIT_SUCCESS)
}
