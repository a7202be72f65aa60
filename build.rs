//! Build script rendering the `contractor` manual pages.
//!
//! Writes `contractor.1` plus one `contractor-<subcommand>.1` page per
//! subcommand into `OUT_DIR`.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const MANUAL: &str = "Contractor Manual";

fn render(command: Command, out_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let page = command.get_name().to_owned();
    let man = Man::new(command)
        .title(page.to_uppercase())
        .section("1")
        .manual(MANUAL)
        .source(format!("contractor {}", env!("CARGO_PKG_VERSION")));
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    fs::write(out_dir.join(format!("{page}.1")), buffer)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or("OUT_DIR was not set")?);

    let mut root = Cli::command();
    root.build();
    for subcommand in root.get_subcommands().filter(|sub| sub.get_name() != "help") {
        let name = format!("contractor-{}", subcommand.get_name());
        render(subcommand.clone().name(name), &out_dir)?;
    }
    render(root, &out_dir)
}
