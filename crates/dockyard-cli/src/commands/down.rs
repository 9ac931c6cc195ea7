use super::{describe, json_pretty, spin_fail, spin_ok, Session, EXIT_SUCCESS};
use dockyard_core::DownOptions;

pub fn run(session: &Session, opts: &DownOptions, json_output: bool) -> Result<u8, String> {
    let pb = session.progress("removing environment...", json_output);
    let report = match session.engine.down(&session.workspace, opts) {
        Ok(report) => report,
        Err(e) => {
            spin_fail(&pb, "down failed");
            return Err(describe(&e));
        }
    };
    if report.changed {
        spin_ok(&pb, &format!("removed project {}", report.compose_project));
    } else {
        spin_ok(&pb, "nothing to remove");
    }

    if json_output {
        println!("{}", json_pretty(&report)?);
    }
    Ok(EXIT_SUCCESS)
}
