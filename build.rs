// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Arguments shared by the planning subcommands
fn source_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("repo")
            .short('r')
            .long("repo")
            .value_name("URL=FILE")
            .action(ArgAction::Append)
            .help("Repository as URL=PACKAGES_FILE (may be repeated)"),
    )
    .arg(
        Arg::new("status")
            .short('s')
            .long("status")
            .default_value("/var/lib/dpkg/status")
            .help("dpkg status database"),
    )
    .arg(
        Arg::new("deb")
            .long("deb")
            .value_name("PATH")
            .action(ArgAction::Append)
            .help("Local .deb archive to queue for installation (may be repeated)"),
    )
    .arg(
        Arg::new("install")
            .short('i')
            .long("install")
            .value_name("PACKAGE")
            .action(ArgAction::Append)
            .help("Package to install, as ID or ID=VERSION"),
    )
    .arg(
        Arg::new("upgrade")
            .short('u')
            .long("upgrade")
            .value_name("PACKAGE")
            .action(ArgAction::Append)
            .help("Installed package to upgrade to the newest known version"),
    )
    .arg(
        Arg::new("remove")
            .short('R')
            .long("remove")
            .value_name("PACKAGE")
            .action(ArgAction::Append)
            .help("Installed package to remove"),
    )
    .arg(
        Arg::new("approve_essential")
            .long("approve-essential")
            .action(ArgAction::SetTrue)
            .help("Allow removing essential packages"),
    )
}

fn build_cli() -> Command {
    Command::new("pkgqueue")
        .version(env!("CARGO_PKG_VERSION"))
        .author("pkgqueue Contributors")
        .about("Plan, preflight and download apt package operations")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .help("Configuration file (TOML)"),
        )
        .subcommand(
            source_args(
                Command::new("plan")
                    .about("Queue the requested operations and print the reconciled plan"),
            )
            .arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Print the plan as JSON"),
            ),
        )
        .subcommand(
            source_args(
                Command::new("download")
                    .about("Plan, then download and verify every archive the plan needs"),
            )
            .arg(
                Arg::new("timeout")
                    .long("timeout")
                    .default_value("3600")
                    .help("Give up waiting for downloads after this many seconds"),
            )
            .arg(
                Arg::new("json")
                    .long("json")
                    .action(ArgAction::SetTrue)
                    .help("Print results as JSON"),
            ),
        )
        .subcommand(
            source_args(
                Command::new("preflight")
                    .about("Stage the dependency closure of packages for the solver"),
            )
            .arg(
                Arg::new("packages")
                    .action(ArgAction::Append)
                    .help("Packages whose closure to stage"),
            )
            .arg(
                Arg::new("installed")
                    .long("installed")
                    .action(ArgAction::SetTrue)
                    .help("Stage every installed package instead"),
            ),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("pkgqueue.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
