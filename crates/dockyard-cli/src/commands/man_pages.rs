use super::EXIT_SUCCESS;
use clap::CommandFactory;
use std::path::Path;

/// Write `dockyard.1` plus one `dockyard-<sub>.1` page per subcommand.
pub fn run<C: CommandFactory>(dir: &Path) -> Result<u8, String> {
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("failed to create {}: {e}", dir.display()))?;
    let cmd = C::command();
    write_page(cmd.clone(), &dir.join("dockyard.1"))?;
    for sub in cmd.get_subcommands() {
        let page = dir.join(format!("dockyard-{}.1", sub.get_name()));
        write_page(sub.clone(), &page)?;
    }
    println!("man pages written to {}", dir.display());
    Ok(EXIT_SUCCESS)
}

fn write_page(cmd: clap::Command, path: &Path) -> Result<(), String> {
    let mut buf = Vec::new();
    clap_mangen::Man::new(cmd)
        .render(&mut buf)
        .map_err(|e| format!("man page render failed: {e}"))?;
    std::fs::write(path, &buf).map_err(|e| format!("failed to write {}: {e}", path.display()))
}
