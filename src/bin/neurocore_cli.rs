//! CLI client for the `neurocored` daemon.
//!
//! Examples:
//!   neurocore-cli health
//!   neurocore-cli simulate connectome.npy parc_86
//!   neurocore-cli simulate connectome.npy 86 --json
//!   neurocore-cli reload
//!   neurocore-cli shutdown
//!
//! By default it talks to 127.0.0.1:9876; override with `--addr host:port`.

use neurocore::pipeline::{SimulationReport, SimulationSuccess};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::process;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    Health,
    Simulate {
        parcellation_type: String,
        payload: Vec<u8>,
    },
    ReloadModel,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Response {
    Report(SimulationReport),
    Health { status: String, model_loaded: bool },
    Ack { status: String, message: String },
}

fn usage() -> ! {
    eprintln!("neurocore-cli (talks to neurocored @ 127.0.0.1:9876 by default)");
    eprintln!("Usage: neurocore-cli [--addr host:port] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  health                              Daemon liveness and model status");
    eprintln!("  simulate <file.npy> <parcellation>  Reconstruct and simulate a connectome");
    eprintln!("                                      (parcellation: 86|129|234|463 or parc_N;");
    eprintln!("                                       add --json for the raw report)");
    eprintln!("  reload                              Reload the reconstruction model");
    eprintln!("  shutdown                            Stop the daemon");
    process::exit(1);
}

fn parse_args() -> (String, Vec<String>) {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let mut addr = "127.0.0.1:9876".to_string();
    if args.len() >= 2 && args[0] == "--addr" {
        addr = args[1].clone();
        args.drain(0..2);
    }

    if args.is_empty() {
        usage();
    }

    (addr, args)
}

fn send_request(addr: &str, req: &Request, timeout: Duration) -> Result<Response, String> {
    let mut stream = TcpStream::connect(addr).map_err(|e| format!("connect: {e}"))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| format!("set_read_timeout: {e}"))?;
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| format!("clone: {e}"))?);

    let line = serde_json::to_string(req).map_err(|e| format!("serialize: {e}"))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|e| format!("send: {e}"))?;

    let mut resp_line = String::new();
    reader
        .read_line(&mut resp_line)
        .map_err(|e| format!("recv: {e}"))?;
    serde_json::from_str(&resp_line).map_err(|e| format!("parse response: {e}"))
}

fn print_success(s: &SimulationSuccess) {
    println!(
        "state={} mean_r={:.4} mean_V={:.4} samples={}",
        s.state,
        s.mean_firing_rate,
        s.mean_membrane_potential,
        s.time.len()
    );
    if let (Some(first), Some(last)) = (s.time.first(), s.time.last()) {
        println!("time: {:.2} .. {:.2}", first, last);
    }
    println!("explanation: {}", s.explanation);
}

fn main() {
    let (addr, args) = parse_args();
    let cmd = &args[0];
    let json_output = args.iter().any(|a| a == "--json");

    let make_error = |msg: &str| -> ! {
        eprintln!("{}", msg);
        process::exit(1);
    };

    let (req, timeout) = match cmd.as_str() {
        "health" => (Request::Health, Duration::from_secs(5)),
        "simulate" => {
            if args.len() < 3 {
                usage();
            }
            let payload = std::fs::read(&args[1])
                .unwrap_or_else(|e| make_error(&format!("read {}: {e}", args[1])));
            let req = Request::Simulate {
                parcellation_type: args[2].clone(),
                payload,
            };
            // Full-resolution simulations can take a while.
            (req, Duration::from_secs(600))
        }
        "reload" => (Request::ReloadModel, Duration::from_secs(120)),
        "shutdown" => (Request::Shutdown, Duration::from_secs(5)),
        _ => usage(),
    };

    match send_request(&addr, &req, timeout) {
        Ok(Response::Report(report)) => {
            if json_output {
                match report.to_json() {
                    Ok(text) => println!("{text}"),
                    Err(e) => make_error(&format!("serialize report: {e}")),
                }
                if !report.is_success() {
                    process::exit(1);
                }
                return;
            }
            match report {
                SimulationReport::Success(s) => print_success(&s),
                SimulationReport::Error { kind, message } => {
                    eprintln!("Error ({kind}): {message}");
                    process::exit(1);
                }
            }
        }
        Ok(Response::Health {
            status,
            model_loaded,
        }) => println!("status={status} model_loaded={model_loaded}"),
        Ok(Response::Ack { message, .. }) => println!("{message}"),
        Err(e) => {
            eprintln!("Failed: {e}");
            process::exit(1);
        }
    }
}
