// Copyright 2019-2022 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

use std::{fs::File, io::{BufWriter, Write}, time::Instant};
use clap::{Command, Arg, ArgAction, crate_description, crate_version, value_parser};
use clap_num::{maybe_hex, si_number};
use anyhow::{anyhow, bail};

use x7tap::probe::{Probe, ProbeInfo, Interface};
use x7tap::jtag::{Jtag, Chain, ANY_IDCODE};
use x7tap::xilinx::{X7, X7IDCODE, packet};
use x7tap::cortex::DebugWalk;
use x7tap::boundary::{Annotator, Bsdl, PinMap};
use x7tap::script::Script;
use x7tap::Bitstream;

/// Number of configuration words in a full-device readback.
const READBACK_WORDS: &str = "0x000f6c78";

#[allow(clippy::cognitive_complexity)]
fn main() -> anyhow::Result<()> {
    let matches = Command::new("x7tap")
        .version(crate_version!())
        .about(crate_description!())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .infer_subcommands(true)
        .arg(Arg::new("quiet")
             .help("Suppress informative output and raise log level to errors only")
             .long("quiet")
             .short('q')
             .action(ArgAction::SetTrue)
             .global(true))
        .arg(Arg::new("verbose")
             .help("Increase log level, specify once for info, twice for debug, three times for trace")
             .long("verbose")
             .short('v')
             .action(ArgAction::Count)
             .conflicts_with("quiet")
             .global(true))
        .arg(Arg::new("serial")
             .help("Serial number of FTDI adapter to use")
             .long("serial")
             .short('s')
             .action(ArgAction::Set)
             .global(true))
        .arg(Arg::new("interface")
             .help("FTDI interface to use, 0 for A or 1 for B")
             .long("interface")
             .short('I')
             .action(ArgAction::Set)
             .default_value("0")
             .value_parser(value_parser!(u8).range(0..=1))
             .global(true))
        .arg(Arg::new("freq")
             .help("JTAG clock frequency in Hz (k and M suffixes allowed)")
             .long("freq")
             .short('f')
             .action(ArgAction::Set)
             .default_value("15M")
             .value_parser(si_number::<u32>)
             .global(true))
        .arg(Arg::new("index")
             .help("Skip this many matching devices when selecting the target (see `scan` output)")
             .long("index")
             .short('i')
             .action(ArgAction::Set)
             .default_value("0")
             .value_parser(value_parser!(usize))
             .global(true))
        .arg(Arg::new("any")
             .help("Select the target regardless of its IDCODE")
             .long("any")
             .short('a')
             .action(ArgAction::SetTrue)
             .global(true))
        .subcommand(Command::new("probes")
            .about("List available FTDI adapters"))
        .subcommand(Command::new("scan")
            .about("Scan JTAG chain and detect 7-series IDCODEs"))
        .subcommand(Command::new("program")
            .about("Configure the FPGA with a raw .bin bitstream")
            .arg(Arg::new("file")
                 .help("Bitstream to program, or - for stdin")
                 .required(true))
            .arg(Arg::new("cortex")
                 .help("Skip the ARM debug port checks after configuration")
                 .long("no-cortex")
                 .action(ArgAction::SetFalse)))
        .subcommand(Command::new("status")
            .about("Read USERCODE and STATUS from every FPGA on the chain"))
        .subcommand(Command::new("usercode")
            .about("Read the target's USERCODE"))
        .subcommand(Command::new("dna")
            .about("Read the target's device DNA"))
        .subcommand(Command::new("readback")
            .about("Read configuration memory to a file")
            .arg(Arg::new("file")
                 .help("File to write configuration memory to")
                 .required(true))
            .arg(Arg::new("words")
                 .help("Number of 32-bit words to read (decimal, or hex with 0x prefix)")
                 .long("words")
                 .action(ArgAction::Set)
                 .default_value(READBACK_WORDS)
                 .value_parser(maybe_hex::<u32>)))
        .subcommand(Command::new("boundary")
            .about("Repeatedly sample the boundary-scan register and print changed inputs")
            .arg(Arg::new("bsdl")
                 .help("BSDL file for the target")
                 .long("bsdl")
                 .action(ArgAction::Set)
                 .required(true))
            .arg(Arg::new("xdc")
                 .help("XDC constraints file mapping pins to signal names")
                 .long("xdc")
                 .action(ArgAction::Set))
            .arg(Arg::new("sensitivity")
                 .help("Only report signals whose names appear in this list")
                 .long("sensitivity")
                 .action(ArgAction::Set))
            .arg(Arg::new("count")
                 .help("Number of samples to take, 0 to run until interrupted")
                 .long("count")
                 .action(ArgAction::Set)
                 .default_value("0")
                 .value_parser(value_parser!(usize))))
        .subcommand(Command::new("script")
            .about("Run a file of raw IR and DR shifts against the target")
            .arg(Arg::new("file")
                 .help("Command-list file")
                 .required(true)))
        .subcommand(Command::new("cortex")
            .about("Run the ARM debug port checks")
            .arg(Arg::new("nowait")
                 .help("Skip the waiting passes")
                 .long("nowait")
                 .action(ArgAction::SetTrue)))
        .get_matches();

    let t0 = Instant::now();
    let quiet = matches.get_flag("quiet");
    let verbose = matches.get_count("verbose");
    let env = if quiet {
        env_logger::Env::default().default_filter_or("error")
    } else if verbose == 0 {
        env_logger::Env::default().default_filter_or("warn")
    } else if verbose == 1 {
        env_logger::Env::default().default_filter_or("info")
    } else if verbose == 2 {
        env_logger::Env::default().default_filter_or("debug")
    } else {
        env_logger::Env::default().default_filter_or("trace")
    };
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    // Listing probes does not require first connecting to a probe,
    // so we just list them and quit early.
    if matches.subcommand_name().unwrap() == "probes" {
        print_probe_list();
        return Ok(());
    }

    // All functions after this point require an open probe.
    let serial = matches.get_one::<String>("serial").map(|s| s.as_str());
    let interface = Interface::from_index(*matches.get_one::<u8>("interface").unwrap())
        .ok_or_else(|| anyhow!("Invalid interface"))?;
    let probe = Probe::new(serial, interface)?;
    let high_gpio = probe.needs_high_gpio();
    log::debug!("Opened probe with bcdDevice 0x{:04X}", probe.bcd_device());

    let freq = *matches.get_one::<u32>("freq").unwrap();
    let mut jtag = Jtag::new(probe).with_clock(freq);
    jtag.init(high_gpio)?;

    // Scan the JTAG chain to detect all available TAPs.
    let chain = jtag.discover_chain(true)?.clone();

    // At this point we can handle the 'scan' command.
    if matches.subcommand_name().unwrap() == "scan" {
        print_jtag_chain(&chain);
        return Ok(());
    }

    let skip = *matches.get_one::<usize>("index").unwrap();
    let any = matches.get_flag("any");

    match matches.subcommand_name() {
        Some("program") => {
            let matches = matches.subcommand_matches("program").unwrap();
            let path = matches.get_one::<String>("file").unwrap();
            let bitstream = Bitstream::from_path(path)?;
            let index = match chain.select_target(bitstream.idcode(), skip, any) {
                Ok(index) => index,
                Err(e) => {
                    print_jtag_chain(&chain);
                    return Err(e.into());
                },
            };
            if !quiet {
                println!("Programming device {} with {} byte bitstream", index, bitstream.len());
            }
            let report = {
                let mut x7 = X7::new(&mut jtag, index)?;
                if quiet {
                    x7.program(bitstream.data())?
                } else {
                    x7.program_progress(bitstream.data())?
                }
            };
            if !quiet {
                println!("{}", report.bypass);
                println!("{}", report.status);
            }
            if matches.get_flag("cortex") {
                if let Some(core) = chain.debug_core() {
                    DebugWalk::new(&mut jtag, core)?.run(false)?;
                }
            }
            report_mismatches(&jtag, quiet);
        },
        Some("status") => {
            let index = select_fpga(&chain, skip)?;
            let mut x7 = X7::new(&mut jtag, index)?;
            for device in x7.readout_status()? {
                println!("{}", device);
            }
        },
        Some("usercode") => {
            let index = select_fpga(&chain, skip)?;
            let usercode = X7::new(&mut jtag, index)?.usercode()?;
            println!("USERCODE 0x{:08X}", usercode);
        },
        Some("dna") => {
            let index = select_fpga(&chain, skip)?;
            let dna = X7::new(&mut jtag, index)?.dna()?;
            println!("DNA 0x{:016X}", dna);
        },
        Some("readback") => {
            let matches = matches.subcommand_matches("readback").unwrap();
            let path = matches.get_one::<String>("file").unwrap();
            let words = *matches.get_one::<u32>("words").unwrap();
            let index = select_fpga(&chain, skip)?;
            let mut file = BufWriter::new(File::create(path)?);
            file.write_all(&packet::type2(words).to_be_bytes())?;
            let mut x7 = X7::new(&mut jtag, index)?;
            let n = if quiet {
                x7.read_config_memory(words, &mut file)?
            } else {
                x7.read_config_memory_progress(words, &mut file)?
            };
            file.flush()?;
            if !quiet {
                println!("Read {} bytes of configuration memory to {}", n, path);
            }
        },
        Some("boundary") => {
            let matches = matches.subcommand_matches("boundary").unwrap();
            let bsdl = Bsdl::parse(&std::fs::read_to_string(
                matches.get_one::<String>("bsdl").unwrap())?)?;
            let pins = match matches.get_one::<String>("xdc") {
                Some(path) => PinMap::parse_xdc(&std::fs::read_to_string(path)?),
                None => PinMap::default(),
            };
            let sensitivity = matches.get_one::<String>("sensitivity").map(|s| s.as_str());
            let count = *matches.get_one::<usize>("count").unwrap();
            let index = select_fpga(&chain, skip)?;
            if !quiet {
                println!("Sampling {} boundary cells of {}", bsdl.len(), bsdl.part);
            }
            let mut annotator = Annotator::new(&bsdl, &pins, sensitivity);
            let mut x7 = X7::new(&mut jtag, index)?;
            let mut n = 0;
            while count == 0 || n < count {
                let sample = x7.sample_boundary(bsdl.len())?;
                for change in annotator.update(&sample) {
                    println!("{}", change);
                }
                n += 1;
            }
        },
        Some("script") => {
            let matches = matches.subcommand_matches("script").unwrap();
            let path = matches.get_one::<String>("file").unwrap();
            let script = Script::parse(&std::fs::read_to_string(path)?)?;
            let index = chain.select_target(ANY_IDCODE, skip, any)?;
            for line in script.run(&mut jtag, index)? {
                println!("{}", line);
            }
        },
        Some("cortex") => {
            let matches = matches.subcommand_matches("cortex").unwrap();
            let core = match chain.debug_core() {
                Some(core) => core,
                None => {
                    print_jtag_chain(&chain);
                    bail!("No ARM debug port found on the JTAG chain.");
                },
            };
            DebugWalk::new(&mut jtag, core)?.run(matches.get_flag("nowait"))?;
            report_mismatches(&jtag, quiet);
        },
        _ => panic!("Unhandled command."),
    }

    let t1 = t0.elapsed();
    if !quiet {
        println!("Finished in {}.{:02}s", t1.as_secs(), t1.subsec_millis()/10);
    }

    Ok(())
}

/// Pick the configurable device to operate on, skipping `skip` candidates
/// when further ones exist.
fn select_fpga(chain: &Chain, skip: usize) -> anyhow::Result<usize> {
    let candidates: Vec<usize> = chain.entries().iter().enumerate()
                                      .filter(|(_, e)| !e.debug_core)
                                      .map(|(i, _)| i)
                                      .collect();
    match candidates.get(skip).or_else(|| candidates.last()) {
        Some(&index) => Ok(index),
        None => {
            print_jtag_chain(chain);
            bail!("Could not find a configurable device on the JTAG chain.");
        },
    }
}

fn report_mismatches<T: x7tap::buffer::Transport>(jtag: &Jtag<T>, quiet: bool) {
    let mismatches = jtag.mismatches();
    if !mismatches.is_empty() {
        log::warn!("{} readback value{} differed from the expected values",
                   mismatches.len(), if mismatches.len() == 1 { "" } else { "s" });
    } else if !quiet {
        println!("All readback values matched.");
    }
}

fn print_probe_list() {
    let probes = ProbeInfo::list();
    if probes.is_empty() {
        println!("No FTDI probes found.");
    } else {
        println!("Found {} FTDI probe{}:", probes.len(),
                 if probes.len() == 1 { "" } else { "s" });
        for probe in probes {
            println!("  {}", probe);
        }
    }
}

fn print_jtag_chain(chain: &Chain) {
    println!("Detected JTAG chain, closest to TDO first:");
    for (entry, line) in chain.entries().iter().zip(chain.to_lines().iter()) {
        if let Some(x7) = X7IDCODE::try_from_idcode(&entry.idcode) {
            println!(" - {} [{}]", line, x7.name());
        } else {
            println!(" - {}", line);
        }
    }
}
