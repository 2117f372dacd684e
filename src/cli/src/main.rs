use clap::{arg, value_parser, ArgMatches, Command};
use log::{error, info, LevelFilter};
use pkg::keystore::KeyStore;
use pkg::Pkg;
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

fn main() -> ExitCode {
    let matches = Command::new("orbisexport")
        .about("Read, validate and export PS4 PKG files")
        .subcommand_required(true)
        .arg(arg!(-v --verbose "Enable debug logging").global(true))
        .arg(
            arg!(-k --keys <FILE> "Key store file")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .default_value("orbis-keys.json"),
        )
        .arg(arg!(-p --passcode <PASSCODE> "Passcode to try after the built-in ladder").global(true))
        .subcommand(
            Command::new("info")
                .about("Print package metadata")
                .arg(arg!(<PKG> "Package file").value_parser(value_parser!(PathBuf))),
        )
        .subcommand(
            Command::new("entries")
                .about("List meta entries")
                .arg(arg!(<PKG> "Package file").value_parser(value_parser!(PathBuf))),
        )
        .subcommand(
            Command::new("extract")
                .about("Extract one meta entry")
                .arg(arg!(<PKG> "Package file").value_parser(value_parser!(PathBuf)))
                .arg(arg!(<INDEX> "Entry index").value_parser(value_parser!(usize)))
                .arg(
                    arg!(-o --output <FILE> "Output file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(arg!(--raw "Keep the entry encrypted")),
        )
        .subcommand(
            Command::new("validate")
                .about("Check the package digests")
                .arg(arg!(<PKG> "Package file").value_parser(value_parser!(PathBuf))),
        )
        .subcommand(
            Command::new("export")
                .about("Rebuild a GP4 project from the package")
                .arg(arg!(<PKG> "Package file").value_parser(value_parser!(PathBuf)))
                .arg(
                    arg!(-o --output <DIR> "Output directory")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(arg!(--raw "Keep encrypted entries encrypted")),
        )
        .get_matches();

    let level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    SimpleLogger::new().with_level(level).init().unwrap();

    let result = match matches.subcommand().unwrap() {
        ("info", args) => do_info(&matches, args),
        ("entries", args) => do_entries(&matches, args),
        ("extract", args) => do_extract(&matches, args),
        ("validate", args) => do_validate(&matches, args),
        ("export", args) => do_export(&matches, args),
        _ => unreachable!(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    }
}

/// Opens the package with the persisted key store and an optional
/// user-supplied passcode, saving any newly recovered keys.
fn open_pkg(matches: &ArgMatches, args: &ArgMatches) -> Result<Pkg, ()> {
    let store_path: &PathBuf = matches.get_one("keys").unwrap();
    let path: &PathBuf = args.get_one("PKG").unwrap();

    let mut store = match KeyStore::load(store_path) {
        Ok(v) => v,
        Err(e) => {
            error!("Couldn't load the key store from {}: {e}", store_path.display());
            return Err(());
        }
    };

    let mut pkg = match Pkg::open(path, &mut store) {
        Ok(v) => v,
        Err(e) => {
            error!("Couldn't open {}: {e}", path.display());
            return Err(());
        }
    };

    if !pkg.is_file_system_accessible() {
        if let Some(passcode) = matches.get_one::<String>("passcode") {
            if pkg.try_passcode(passcode, &mut store) {
                info!("Passcode accepted.");
            } else {
                error!("The supplied passcode does not match this package.");
            }
        }
    }

    if let Err(e) = store.save(store_path) {
        error!("Couldn't save the key store to {}: {e}", store_path.display());
    }

    Ok(pkg)
}

fn do_info(matches: &ArgMatches, args: &ArgMatches) -> Result<(), ()> {
    let pkg = open_pkg(matches, args)?;
    let header = pkg.header();

    println!("content id:    {}", header.content_id());
    println!("content type:  {:?}", header.content_type());
    println!("entries:       {}", header.entry_count());
    println!("package size:  {:#x}", header.package_size());
    println!("pfs offset:    {:#x}", header.pfs_image_offset());
    println!("pfs size:      {:#x}", header.pfs_image_size());
    println!("fs accessible: {}", pkg.is_file_system_accessible());

    if let Some(passcode) = pkg.passcode() {
        println!("passcode:      {passcode}");
    }

    match pkg.param() {
        Ok(param) => {
            if let Some(title) = param.get("TITLE").and_then(|v| v.as_str()) {
                println!("title:         {title}");
            }

            if let Some(id) = param.get("TITLE_ID").and_then(|v| v.as_str()) {
                println!("title id:      {id}");
            }
        }
        Err(e) => error!("Couldn't read param.sfo: {e}"),
    }

    Ok(())
}

fn do_entries(matches: &ArgMatches, args: &ArgMatches) -> Result<(), ()> {
    let pkg = open_pkg(matches, args)?;

    for (i, entry) in pkg.entries().iter().enumerate() {
        println!(
            "{i:3} {:#010x} {:>9} {} {}",
            entry.id(),
            entry.data_size(),
            if entry.is_encrypted() { "enc" } else { "   " },
            pkg.entry_name(i).unwrap_or("-"),
        );
    }

    Ok(())
}

fn do_extract(matches: &ArgMatches, args: &ArgMatches) -> Result<(), ()> {
    let pkg = open_pkg(matches, args)?;
    let index: usize = *args.get_one("INDEX").unwrap();
    let output: &PathBuf = args.get_one("output").unwrap();
    let decrypt = !args.get_flag("raw");

    let data = match pkg.extract_entry(index, decrypt) {
        Ok(v) => v,
        Err(e) => {
            error!("Couldn't extract entry #{index}: {e}");
            return Err(());
        }
    };

    if let Err(e) = std::fs::write(output, &data) {
        error!("Couldn't write {}: {e}", output.display());
        return Err(());
    }

    info!("Saved {} bytes to {}.", data.len(), output.display());

    Ok(())
}

fn do_validate(matches: &ArgMatches, args: &ArgMatches) -> Result<(), ()> {
    let pkg = open_pkg(matches, args)?;
    let mut failed = false;

    for row in pkg.validate() {
        let status = match row.status {
            pkg::ValidationStatus::Ok => "ok",
            pkg::ValidationStatus::Fail => {
                failed = true;
                "FAIL"
            }
            pkg::ValidationStatus::NoKey => "no key",
        };

        println!("{:#010x} {:6} {}", row.location, status, row.name);
    }

    if failed {
        Err(())
    } else {
        Ok(())
    }
}

fn do_export(matches: &ArgMatches, args: &ArgMatches) -> Result<(), ()> {
    let pkg = open_pkg(matches, args)?;
    let output: &PathBuf = args.get_one("output").unwrap();
    let decrypt = !args.get_flag("raw");
    let cancel = AtomicBool::new(false);
    let mut last = u32::MAX;

    let report = pkg.export_project(
        output,
        decrypt,
        &mut |percent, message| {
            if percent != last {
                info!("[{percent:3}%] {message}");
                last = percent;
            }
        },
        &cancel,
    );

    match report {
        Ok(report) => {
            for failure in &report.failures {
                error!("Couldn't export {}: {}", failure.name, failure.reason);
            }

            info!("Project written to {}.", output.display());

            if report.failures.is_empty() {
                Ok(())
            } else {
                Err(())
            }
        }
        Err(e) => {
            error!("Export failed: {e}");
            Err(())
        }
    }
}
