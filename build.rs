//! Renders `bivouac(1)` and one `bivouac-<command>(1)` page per subcommand
//! into `$OUT_DIR/man` for packaging.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

type BuildResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

fn write_page(dir: &Path, command: clap::Command) -> BuildResult {
    let page = Man::new(command).manual("bivouac manual");
    let mut roff = Vec::new();
    page.render(&mut roff)?;
    fs::write(dir.join(page.get_filename()), roff)?;
    Ok(())
}

fn main() -> BuildResult {
    let mut cargo = std::io::stdout();
    for watched in ["build.rs", "src/cli/mod.rs"] {
        writeln!(cargo, "cargo:rerun-if-changed={watched}")?;
    }

    let out_dir = env::var_os("OUT_DIR").map(PathBuf::from).ok_or("OUT_DIR is unset")?;
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir)?;

    let mut root = Cli::command();
    root.build();
    for command in root.get_subcommands() {
        write_page(&man_dir, command.clone())?;
    }
    write_page(&man_dir, root)
}
