use serde_json::json;
use std::error::Error;
use std::path::PathBuf;

extern crate clap;
extern crate prettytable;
use clap::{App, Arg};
use log::info;
use prettytable::{cell, row, Table};

use ntapi_collector::{
    collector::{Collector, Resolution},
    os_info::OsInfo,
    pdb_store::PdbStore,
    pe_image::ModuleImage,
    symsrv::SymbolPath,
    FUNCTION_NAMES, INI_FILE_NAME,
};

#[cfg(windows)]
fn query_os() -> Result<Option<OsInfo>, Box<dyn Error>> {
    Ok(Some(ntapi_collector::windows::query_os_info()?))
}

#[cfg(not(windows))]
fn query_os() -> Result<Option<OsInfo>, Box<dyn Error>> {
    Ok(None)
}

#[cfg(windows)]
fn locate_module(explicit: Option<&str>) -> Result<(PathBuf, Option<u64>), Box<dyn Error>> {
    match explicit {
        Some(path) => Ok((PathBuf::from(path), None)),
        None => {
            let module = ntapi_collector::windows::load_module(ntapi_collector::USER32)?;
            Ok((module.path, Some(module.base)))
        }
    }
}

#[cfg(not(windows))]
fn locate_module(explicit: Option<&str>) -> Result<(PathBuf, Option<u64>), Box<dyn Error>> {
    match explicit {
        Some(path) => Ok((PathBuf::from(path), None)),
        None => Err("--module is required on this platform".into()),
    }
}

fn default_output() -> Result<PathBuf, Box<dyn Error>> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().ok_or("executable has no parent directory")?;
    Ok(dir.join(INI_FILE_NAME))
}

fn hex_or_dash<T: std::fmt::UpperHex>(value: Option<T>) -> String {
    match value {
        Some(v) => format!("0x{:X}", v),
        None => "-".to_string(),
    }
}

fn print_table(resolutions: &[Resolution]) {
    let mut table = Table::new();
    table.add_row(row!["Name", "VA", "RVA"]);
    for r in resolutions {
        table.add_row(row![r.name, hex_or_dash(r.va), hex_or_dash(r.rva)]);
    }
    table.printstd();
}

fn run() -> Result<(), Box<dyn Error>> {
    let matches = App::new("ntapi-collector")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Khoa Nguyen Anh <mail.nganhkhoa@gmail.com>")
        .about("Collect win32k stub offsets of user32.dll from public symbols")
        .arg(
            Arg::with_name("module")
                .short("m")
                .long("module")
                .takes_value(true)
                .value_name("PATH")
                .help("Resolve this image instead of the loaded user32.dll"),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .takes_value(true)
                .value_name("INI")
                .help("INI file to update [default: NtApiCollection.ini next to the executable]"),
        )
        .arg(
            Arg::with_name("symbol_path")
                .short("y")
                .long("symbol-path")
                .takes_value(true)
                .value_name("PATH")
                .help("Symbol search path, overrides _NT_SYMBOL_PATH"),
        )
        .arg(
            Arg::with_name("symbol")
                .short("s")
                .long("symbol")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .value_name("NAME")
                .help("Symbol to resolve, replaces the built-in list"),
        )
        .arg(
            Arg::with_name("os_id")
                .long("os-id")
                .takes_value(true)
                .value_name("ID")
                .help("OS identifier used in the section name"),
        )
        .arg(
            Arg::with_name("dry_run")
                .long("dry-run")
                .help("Resolve and print, do not write the INI"),
        )
        .arg(
            Arg::with_name("json")
                .long("json")
                .help("Print results as JSON"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("More logging, repeat for more"),
        )
        .get_matches();

    let level = match matches.occurrences_of("verbose") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let os_id = matches.value_of("os_id");
    let as_json = matches.is_present("json");
    let os = match (query_os()?, os_id) {
        (Some(os), _) => {
            if !as_json {
                println!("OS MajorVersion {} MinorVersion {}", os.major, os.minor);
            }
            os
        }
        (None, Some(_)) => OsInfo::default(),
        (None, None) => return Err("--os-id is required when the OS cannot be queried".into()),
    };

    let (module_path, module_base) = locate_module(matches.value_of("module"))?;
    let image = ModuleImage::open(&module_path)?;
    info!(
        "{:?}: {}, entry point 0x{:X}, {} {}",
        module_path,
        image.arch,
        image.entry_point,
        image.pdb_name,
        image.symbol_key()
    );

    let symbol_path = SymbolPath::from_config(matches.value_of("symbol_path"))?;
    let pdb_path = symbol_path.find_pdb(&image)?;
    let store = PdbStore::open(&pdb_path, &image)?;

    let mut collector = Collector::new(os, image, module_base, store);
    if let Some(id) = os_id {
        collector = collector.with_os_id(id);
    }

    if !as_json {
        println!("OS ID: {}", collector.os_id);
        if let Some(base) = collector.module_base {
            println!("User32 Base 0x{:X}", base);
        }
        println!("Fetching symbols...");
    }

    let names: Vec<&str> = match matches.values_of("symbol") {
        Some(values) => values.collect(),
        None => FUNCTION_NAMES.to_vec(),
    };
    let resolutions = collector.resolve(&names);

    if as_json {
        let mut result = collector.report_json(&resolutions);
        result["module"] = json!(module_path.display().to_string());
        result["pdb"] = json!(pdb_path.display().to_string());
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_table(&resolutions);
    }

    if !matches.is_present("dry_run") {
        let output = match matches.value_of("output") {
            Some(path) => PathBuf::from(path),
            None => default_output()?,
        };
        let written = collector.persist(&output, &resolutions)?;
        info!("Wrote {} keys to [{}] in {:?}", written, collector.section(), output);
    }

    if !as_json {
        println!("Done!");
    }
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
