use super::{describe, json_pretty, print_diagnostics, spin_fail, spin_ok, Session, EXIT_SUCCESS};
use dockyard_core::{BuildOptions, CacheOutcome};

pub fn run(session: &Session, opts: &BuildOptions, json_output: bool) -> Result<u8, String> {
    let pb = session.progress("building images...", json_output);
    let report = match session.engine.build(&session.workspace, opts) {
        Ok(report) => report,
        Err(e) => {
            spin_fail(&pb, "build failed");
            return Err(describe(&e));
        }
    };
    spin_ok(&pb, &format!("built project {}", report.compose_project));

    if json_output {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }
    print_diagnostics(&report.diagnostics);
    if let Some(image) = &report.derived_image {
        let how = match report.cache {
            Some(CacheOutcome::Cached) => "cached",
            _ => "built",
        };
        println!("feature image: {} ({how}, from {})", image.tag, image.base_image);
    }
    if !report.services_built.is_empty() {
        println!("services:      {}", report.services_built.join(", "));
    }
    Ok(EXIT_SUCCESS)
}
