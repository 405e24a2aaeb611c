#![deny(clippy::unwrap_used)]

use chrono::Local;
use clap::builder::BoolishValueParser;
use clap::{arg, command, value_parser};
use std::io::{ErrorKind, Write};
use std::process::exit;
use std::{path::PathBuf, time::Duration};
use tracing_subscriber::EnvFilter;

use ursactrl::device::Device;
use ursactrl::proto::command::{Input, ShapingTime};
use ursactrl::proto::{self, Result};
use ursactrl::{Settings, Startup, DEFAULT_BAUDRATE, DEFAULT_TTY};

// Battery is requested every this many seconds while acquiring.
const BATTERY_INTERVAL: u64 = 10;

#[tokio::main]
async fn main() -> tokio_serial::Result<()> {
    let matches =
        command!() // requires `cargo` feature
            .arg(
                arg!(
                    -p --device <PORT> "Port for the URSA-II"
                )
                .default_value(DEFAULT_TTY)
                .required(false)
                .value_parser(value_parser!(PathBuf)),
            )
            .arg(arg!(
                -d --debug ... "Turn debugging information on"
            ))
            .arg(
                arg!(
                    -b --baudrate <BAUDRATE> "Baudrate"
                )
                .default_value(DEFAULT_BAUDRATE.to_string())
                .value_parser(value_parser!(u32)),
            )
            .subcommand(clap::Command::new("ident").about("Serial number and max high voltage"))
            .subcommand(clap::Command::new("battery").about("Battery voltage"))
            .subcommand(
                clap::Command::new("configure")
                    .about("Configure amplifier and high voltage")
                    .arg(
                        arg!(--"load-previous" "Restore the settings stored in the instrument")
                            .conflicts_with_all([
                                "high-voltage",
                                "gain",
                                "threshold",
                                "shaping-time",
                                "input",
                                "ramp",
                            ]),
                    )
                    .arg(
                        arg!(--"high-voltage" <VOLTS> "High voltage, 0 to 2000 V")
                            .required_unless_present("load-previous")
                            .value_parser(value_parser!(u16)),
                    )
                    .arg(
                        arg!(--gain <GAIN> "Amplifier gain, below 250")
                            .required_unless_present("load-previous")
                            .value_parser(value_parser!(f64)),
                    )
                    .arg(
                        arg!(--threshold <MILLIVOLTS> "Threshold offset, 25 to 1023 mV")
                            .required_unless_present("load-previous")
                            .value_parser(value_parser!(u16)),
                    )
                    .arg(
                        arg!(--"shaping-time" <MICROS> "Shaping time in us")
                            .required_unless_present("load-previous")
                            .value_parser(value_parser!(ShapingTime)),
                    )
                    .arg(
                        arg!(--input <INPUT> "Signal input and polarity")
                            .required_unless_present("load-previous")
                            .value_parser(value_parser!(Input)),
                    )
                    .arg(
                        arg!(--ramp <SECONDS> "Ramp time per 100 V, 6 to 219 s")
                            .required_unless_present("load-previous")
                            .value_parser(value_parser!(u16)),
                    ),
            )
            .subcommand(
                clap::Command::new("acquire")
                    .about("Acquire a spectrum and print it as CSV")
                    .arg(
                        arg!(-s --seconds <SECONDS> "Acquisition time")
                            .default_value("60")
                            .value_parser(value_parser!(u64)),
                    ),
            )
            .subcommand(
                clap::Command::new("geiger")
                    .about("Count in Geiger mode, one line per second")
                    .arg(
                        arg!(-s --seconds <SECONDS> "Counting time")
                            .default_value("60")
                            .value_parser(value_parser!(u64)),
                    ),
            )
            .subcommand(clap::Command::new("voltage-off").about("Switch off the high voltage"))
            .subcommand(
                clap::Command::new("alarm")
                    .about("Alarm outputs")
                    .arg(arg!(<alarm> "Alarm output").value_parser(["0", "1"]))
                    .arg(arg!(<state> "on or off").value_parser(BoolishValueParser::new())),
            )
            .subcommand_required(true)
            .get_matches();

    let level = match matches.get_count("debug") {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match handle_args(&matches).await {
        Ok(()) => {}
        Err(e) => {
            let port = matches
                .get_one::<PathBuf>("device")
                .expect("Requires device parameter")
                .display();
            match e {
                proto::ProtoError::Serial(err) => {
                    if err.kind() == tokio_serial::ErrorKind::NoDevice
                        || matches!(err.kind(), tokio_serial::ErrorKind::Io(ErrorKind::NotFound))
                    {
                        eprintln!("{}: File not found", port);
                    } else {
                        eprintln!("I/O Error: {} [device: {}]", err, port);
                    }
                }
                proto::ProtoError::Io(err) => {
                    if err.kind() == ErrorKind::NotFound {
                        eprintln!("{}: File not found", port);
                    } else {
                        eprintln!("I/O Error: {} [device: {}]", err, port);
                    }
                }
                proto::ProtoError::NotConnected => {
                    eprintln!("Unable to open {}, aborting!", port);
                }
                proto::ProtoError::NotResponsive => {
                    eprintln!("No URSA-II answering on {}, aborting!", port);
                }
                proto::ProtoError::Timeout | proto::ProtoError::Abort => {
                    eprintln!("Failed to communicate with device, aborting!");
                }
                proto::ProtoError::Unexpected(response) => {
                    eprintln!(
                        "Received an unexpected response from device, aborting!: {:?}",
                        response
                    );
                }
                proto::ProtoError::Cancelled => {
                    eprintln!("Interrupted while the high voltage was ramping");
                }
                other => {
                    eprintln!("Error: {}", other);
                }
            }
            exit(-1);
        }
    }

    Ok(())
}

async fn handle_args(matches: &clap::ArgMatches) -> Result<()> {
    let baud_rate = matches
        .get_one::<u32>("baudrate")
        .unwrap_or(&DEFAULT_BAUDRATE);

    if let Some(port_path) = matches.get_one::<PathBuf>("device") {
        let mut device = Device::new(port_path.to_string_lossy(), *baud_rate);
        device.connect().await?;

        eprintln!("Connected to: {}\n", port_path.display());

        match matches.subcommand() {
            Some(("ident", _args)) => {
                let serial = device.request_serial_number().await?;
                let max_voltage = device.request_max_voltage().await?;
                println!("Serial: {}", serial);
                println!("Max high voltage: {} V", max_voltage);
            }
            Some(("battery", _args)) => match device.request_battery().await? {
                Some(volts) => println!("Battery: {:.2} V", volts),
                None => println!("--- NO DATA ---"),
            },
            Some(("configure", args)) => {
                let startup = if args.get_flag("load-previous") {
                    Startup::LoadPrevious
                } else {
                    Startup::Apply(settings_from_args(args))
                };
                let canceller = device.ramp_canceller();
                let interrupt = tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        canceller.cancel();
                    }
                });
                let configured = device.configure(&startup).await;
                interrupt.abort();
                configured?;
                println!("OK");
            }
            Some(("acquire", args)) => {
                let seconds = *args.get_one::<u64>("seconds").unwrap_or(&60);
                acquire(&mut device, seconds).await?;
            }
            Some(("geiger", args)) => {
                let seconds = *args.get_one::<u64>("seconds").unwrap_or(&60);
                geiger(&mut device, seconds).await?;
            }
            Some(("voltage-off", _args)) => {
                device.stop_voltage().await?;
                println!("OK");
            }
            Some(("alarm", args)) => {
                let state = *args.get_one::<bool>("state").unwrap_or(&false);
                match args.get_one::<String>("alarm").map(String::as_str) {
                    Some("1") => device.set_alarm1(state).await?,
                    _ => device.set_alarm0(state).await?,
                }
                println!("OK");
            }
            _ => {
                unreachable!("Exhausted list of subcommands and subcommand_required prevents `None`")
            }
        }

        device.shutdown().await?;
    }
    Ok(())
}

fn settings_from_args(args: &clap::ArgMatches) -> Settings {
    let required = "Required unless --load-previous";
    Settings {
        high_voltage: *args.get_one::<u16>("high-voltage").expect(required),
        gain: *args.get_one::<f64>("gain").expect(required),
        threshold: *args.get_one::<u16>("threshold").expect(required),
        shaping_time: *args.get_one::<ShapingTime>("shaping-time").expect(required),
        input: *args.get_one::<Input>("input").expect(required),
        ramp: *args.get_one::<u16>("ramp").expect(required),
    }
}

async fn acquire(device: &mut Device, seconds: u64) -> Result<()> {
    let spectrum = device.spectrum();
    spectrum.clear();
    let started = Local::now();
    device.start_acquire().await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    for elapsed in 0..seconds {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Interrupted after {} s", elapsed);
                break;
            }
        }
        device.read()?;
        if elapsed % BATTERY_INTERVAL == 0 {
            device.request_battery().await?;
        }
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    device.read()?;
    device.stop_acquire().await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(
        out,
        "# {} battery {:.2} V total {}",
        started.format("%Y-%m-%d %H:%M:%S"),
        device.battery(),
        spectrum.total()
    )?;
    for count in spectrum.snapshot().iter() {
        writeln!(out, "{}", count)?;
    }
    Ok(())
}

async fn geiger(device: &mut Device, seconds: u64) -> Result<()> {
    device.start_gm().await?;
    let counted = print_counts(device, seconds).await;
    // Leave Geiger mode even when counting failed.
    let stopped = device.stop_gm().await;
    counted.and(stopped)
}

async fn print_counts(device: &mut Device, seconds: u64) -> Result<()> {
    // Counts accumulated before the first interval are dropped.
    device.request_counts().await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    for _ in 0..seconds {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        let counts = device.request_counts().await?;
        println!("{},{}", Local::now().format("%Y-%m-%d %H:%M:%S"), counts);
    }
    Ok(())
}
