#![forbid(unsafe_code)]

//! `fleet-ctl`: local CLI companion for `fleet-coordinator`.
//!
//! Connects to the IPC socket and sends JSON commands to the daemon. Also
//! useful for exercising the worker protocol by hand.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand, ValueEnum};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "fleet-ctl",
    about = "Local CLI for the fleet-coordinator daemon",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the daemon's `ipc_name` config).
    #[arg(long, default_value = "fleet-coordinator")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

/// Pool selector.
///
/// Mirrors the daemon's pool kinds but is defined locally because the ctl
/// binary does not depend on the library crate.
#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Pool {
    /// Location pool.
    Locations,
    /// Email pool.
    Emails,
}

impl Pool {
    fn as_str(self) -> &'static str {
        match self {
            Self::Locations => "locations",
            Self::Emails => "emails",
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show queue, device, and pool status.
    Status,

    /// Append tasks to the queue.
    Enqueue {
        /// Number of tasks to create.
        count: usize,
        /// Task type: `create_account`, `test`, or `custom`.
        #[arg(long)]
        task_type: Option<String>,
        /// Task configuration as a JSON object.
        #[arg(long)]
        config: Option<String>,
    },

    /// Start workers on one or more devices.
    Launch {
        /// Device identifiers.
        #[arg(required = true)]
        devices: Vec<String>,
        /// Session configuration as a JSON object.
        #[arg(long)]
        config: Option<String>,
    },

    /// Lease the next task to a device.
    NextTask {
        /// Device identifier.
        device: String,
    },

    /// Report a leased task as completed.
    Complete {
        /// Device holding the lease.
        device: String,
        /// Task id.
        task_id: u64,
        /// Result payload as JSON.
        #[arg(long)]
        result: Option<String>,
    },

    /// Report a leased task as failed.
    Fail {
        /// Device holding the lease.
        device: String,
        /// Task id.
        task_id: u64,
        /// Error text.
        error: String,
    },

    /// Allocate an item from a pool.
    Allocate {
        /// Target pool.
        #[arg(value_enum)]
        pool: Pool,
        /// Requesting worker id.
        requester: String,
    },

    /// Return an allocated item after a failed run.
    Release {
        /// Target pool.
        #[arg(value_enum)]
        pool: Pool,
        /// Requesting worker id.
        requester: String,
        /// Item key.
        key: String,
    },

    /// Consume an allocated item after a successful run.
    MarkUsed {
        /// Target pool.
        #[arg(value_enum)]
        pool: Pool,
        /// Requesting worker id.
        requester: String,
        /// Item key.
        key: String,
    },

    /// Snapshot the daemon state.
    Checkpoint {
        /// Optional label.
        #[arg(long)]
        label: Option<String>,
    },
}

fn parse_json_arg(flag: &str, raw: &str) -> serde_json::Value {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Error: --{flag} is not valid JSON: {err}");
            std::process::exit(2);
        }
    }
}

fn build_request(command: &Command) -> serde_json::Value {
    match command {
        Command::Status => serde_json::json!({ "command": "status" }),
        Command::Enqueue {
            count,
            task_type,
            config,
        } => {
            let mut req = serde_json::json!({ "command": "enqueue", "count": count });
            if let Some(t) = task_type {
                req["task_type"] = serde_json::Value::String(t.clone());
            }
            if let Some(c) = config {
                req["config"] = parse_json_arg("config", c);
            }
            req
        }
        Command::Launch { devices, config } => {
            let mut req = serde_json::json!({ "command": "launch", "device_ids": devices });
            if let Some(c) = config {
                req["config"] = parse_json_arg("config", c);
            }
            req
        }
        Command::NextTask { device } => {
            serde_json::json!({ "command": "next_task", "device_id": device })
        }
        Command::Complete {
            device,
            task_id,
            result,
        } => {
            let mut req = serde_json::json!({
                "command": "complete",
                "device_id": device,
                "task_id": task_id,
            });
            if let Some(r) = result {
                req["result"] = parse_json_arg("result", r);
            }
            req
        }
        Command::Fail {
            device,
            task_id,
            error,
        } => serde_json::json!({
            "command": "fail",
            "device_id": device,
            "task_id": task_id,
            "error": error,
        }),
        Command::Allocate { pool, requester } => serde_json::json!({
            "command": "allocate",
            "pool": pool.as_str(),
            "requester_id": requester,
        }),
        Command::Release {
            pool,
            requester,
            key,
        } => serde_json::json!({
            "command": "release",
            "pool": pool.as_str(),
            "requester_id": requester,
            "key": key,
        }),
        Command::MarkUsed {
            pool,
            requester,
            key,
        } => serde_json::json!({
            "command": "mark_used",
            "pool": pool.as_str(),
            "requester_id": requester,
            "key": key,
        }),
        Command::Checkpoint { label } => {
            let mut req = serde_json::json!({ "command": "checkpoint" });
            if let Some(l) = label {
                req["label"] = serde_json::Value::String(l.clone());
            }
            req
        }
    }
}

fn main() {
    let args = Cli::parse();
    let request_json = build_request(&args.command);

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    match obj.get("data") {
                        Some(serde_json::Value::Null) | None => println!("OK (nothing returned)"),
                        Some(data) => {
                            println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                        }
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to daemon: {err}");
            eprintln!(
                "Is fleet-coordinator running with ipc_name '{}'?",
                args.ipc_name
            );
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
