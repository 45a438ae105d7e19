//! A CLI frontend for the siggen crate: reads a crash-data JSON document,
//! generates the crash signature, and prints a report (either
//! human-readable or JSON).

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use clap::{Arg, ArgMatches, Command};
use log::error;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use siggen::{CrashData, SignatureGenerator, SignatureLists, SignatureResult};

fn make_app() -> Command<'static> {
    Command::new("siggen")
        .version(clap::crate_version!())
        .about("Generates a crash signature from processed crash data.")
        .next_line_help(true)
        .override_usage("siggen [OPTIONS] <crash-data>")
        .arg(Arg::new("json").long("json").long_help(
            "Emit a machine-readable JSON report.

The report contains the signature, the proto signature (the full normalized \
frame list), and the generation notes.",
        ))
        .arg(
            Arg::new("siglists")
                .long("siglists")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .long_help(
                    "A directory of deployment-specific signature list overrides.

Files in this directory with the same names as the built-in lists \
(irrelevant_signature_re.txt, prefix_signature_re.txt, signature_sentinels.txt, \
signatures_with_line_numbers_re.txt) are appended to the built-in entries. A \
line starting with `!` removes a built-in entry instead.",
                ),
        )
        .arg(
            Arg::new("output-file")
                .long("output-file")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Where to write the output to (if unspecified, stdout is used)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .possible_values(&["off", "error", "warn", "info", "debug", "trace"])
                .default_value("error")
                .takes_value(true)
                .long_help(
                    "Set the logging level.

Signature generation records a step-by-step trace of the frame walk; \
--verbose=debug will show it.",
                ),
        )
        .arg(
            Arg::new("crash-data")
                .required(true)
                .allow_invalid_utf8(true)
                .help("Path to the crash-data JSON document ('-' to read stdin)"),
        )
}

fn read_crash_data(path: &Path) -> Result<CrashData, String> {
    if path == Path::new("-") {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .map_err(|error| format!("failed to read stdin: {}", error))?;
        serde_json::from_str(&input)
            .map_err(|error| format!("failed to parse crash data: {}", error))
    } else {
        let file = File::open(path)
            .map_err(|error| format!("failed to open {}: {}", path.display(), error))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|error| format!("failed to parse crash data: {}", error))
    }
}

fn print_json_report(
    output: &mut dyn Write,
    result: &SignatureResult,
) -> Result<(), io::Error> {
    let report = serde_json::json!({
        "signature": result.signature,
        "proto_signature": result.proto_signature,
        "notes": result.notes(),
    });
    // to_string_pretty on a json! literal can't fail.
    writeln!(output, "{}", serde_json::to_string_pretty(&report).unwrap_or_default())
}

fn print_human_report(
    output: &mut dyn Write,
    result: &SignatureResult,
) -> Result<(), io::Error> {
    writeln!(output, "Signature: {}", result.signature)?;
    if let Some(proto_signature) = &result.proto_signature {
        writeln!(output, "Proto signature: {}", proto_signature)?;
    }
    for note in result.notes() {
        writeln!(output, "Note: {}", note)?;
    }
    Ok(())
}

fn run(matches: &ArgMatches) -> Result<(), String> {
    let siglists = match matches.value_of_os("siglists") {
        Some(dir) => SignatureLists::with_overrides(Path::new(dir))
            .map_err(|error| format!("failed to load signature lists: {}", error))?,
        None => SignatureLists::builtin()
            .map_err(|error| format!("failed to load signature lists: {}", error))?,
    };
    let generator = SignatureGenerator::with_lists(Arc::new(siglists));

    let input = matches
        .value_of_os("crash-data")
        .map(Path::new)
        .ok_or_else(|| "no crash data input".to_string())?;
    let crash_data = read_crash_data(input)?;

    let result = generator.generate(&crash_data);
    for note in result.debug_log() {
        log::debug!("{}", note);
    }

    let mut output: Box<dyn Write> = match matches.value_of_os("output-file") {
        Some(path) => Box::new(BufWriter::new(File::create(Path::new(path)).map_err(
            |error| format!("failed to create output file: {}", error),
        )?)),
        None => Box::new(io::stdout()),
    };

    let printed = if matches.is_present("json") {
        print_json_report(&mut output, &result)
    } else {
        print_human_report(&mut output, &result)
    };
    printed.map_err(|error| format!("failed to write report: {}", error))?;

    output
        .flush()
        .map_err(|error| format!("failed to write report: {}", error))
}

fn main() {
    let matches = make_app().get_matches();

    let verbosity = match matches.value_of("verbose").unwrap_or("error") {
        "off" => LevelFilter::Off,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Error,
    };

    let _ = TermLogger::init(
        verbosity,
        ConfigBuilder::new()
            .set_location_level(LevelFilter::Off)
            .set_time_level(LevelFilter::Off)
            .set_thread_level(LevelFilter::Off)
            .set_target_level(LevelFilter::Off)
            .build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    if let Err(message) = run(&matches) {
        error!("{}", message);
        std::process::exit(1);
    }
}
