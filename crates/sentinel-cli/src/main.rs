use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "sentinel", about = "Sentinel biometric authentication CLI")]
struct Cli {
    /// Daemon control socket path
    #[arg(long, default_value = "/run/sentinel/sentinel.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Load models and galleries (idempotent)
    Init,
    /// List users with valid (non-expired) galleries
    Users,
    /// Run a blocking end-to-end authentication
    Verify {
        /// User to verify as (defaults to $USER)
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Enroll a new user (guided pose capture)
    Enroll {
        /// User to enroll
        user: String,

        /// Whether the user wears glasses
        #[arg(long)]
        glasses: bool,
    },
    /// Show the published configuration
    Config,
    /// Update one configuration key
    Set {
        /// Flat key, e.g. security.max_retries
        key: String,
        /// New value (JSON literal)
        value: String,
    },
    /// List quarantined intrusion screenshots
    Intrusions,
    /// Promote a quarantined intrusion to the permanent blacklist
    Confirm {
        /// Screenshot path or entry id
        filename: String,
    },
    /// Remove a quarantined intrusion
    Delete {
        /// Screenshot path or entry id
        filename: String,
    },
}

/// Line-oriented JSON-RPC client over the daemon socket.
struct Client {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    next_id: u64,
}

impl Client {
    fn connect(socket: &PathBuf) -> Result<Self> {
        let stream = UnixStream::connect(socket).with_context(|| {
            format!(
                "failed to connect to {} — is sentineld running?",
                socket.display()
            )
        })?;
        stream.set_read_timeout(Some(Duration::from_secs(120)))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: stream,
            next_id: 0,
        })
    }

    fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id,
        });

        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;

        let mut response = String::new();
        self.reader.read_line(&mut response)?;
        let response: Value = serde_json::from_str(response.trim())
            .context("malformed response from daemon")?;

        if let Some(error) = response.get("error") {
            bail!("rpc error: {}", error["message"].as_str().unwrap_or("unknown"));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("response has neither result nor error"))
    }

    /// Call and fail on `{success: false}`.
    fn call_ok(&mut self, method: &str, params: Value) -> Result<Value> {
        let result = self.call(method, params)?;
        if result["success"].as_bool() != Some(true) {
            bail!(
                "{method} failed: {}",
                result["error"].as_str().unwrap_or("unknown error")
            );
        }
        Ok(result)
    }
}

fn current_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut client = Client::connect(&cli.socket)?;

    match cli.command {
        Commands::Status => {
            let status = client.call("status", json!({}))?;
            println!("sentineld status:");
            println!("  version: {}", status["version"].as_str().unwrap_or("?"));
            println!("  warmed:  {}", status["warmed"].as_bool().unwrap_or(false));
        }
        Commands::Init => {
            let result = client.call_ok("initialize", json!({}))?;
            if result["already"].as_bool() == Some(true) {
                println!("Already initialized");
            } else {
                println!("Models loaded");
            }
        }
        Commands::Users => {
            let result = client.call_ok("get_enrolled_users", json!({}))?;
            let users = result["users"].as_array().cloned().unwrap_or_default();
            if users.is_empty() {
                println!("No enrolled users");
            } else {
                for user in users {
                    println!("{}", user.as_str().unwrap_or("?"));
                }
            }
        }
        Commands::Verify { user } => {
            let user = user.unwrap_or_else(current_user);
            println!("Authenticating '{user}' — look at the camera...");
            let result = client.call_ok("authenticate_pam", json!({ "user": user }))?;
            let verdict = result["result"].as_str().unwrap_or("FAILURE");
            println!("{verdict}");
            if verdict != "SUCCESS" {
                std::process::exit(1);
            }
        }
        Commands::Enroll { user, glasses } => {
            run_enrollment(&mut client, &user, glasses)?;
        }
        Commands::Config => {
            let result = client.call_ok("get_config", json!({}))?;
            if let Some(config) = result["config"].as_object() {
                for (key, value) in config {
                    println!("{key} = {value}");
                }
            }
        }
        Commands::Set { key, value } => {
            let value: Value = serde_json::from_str(&value)
                .with_context(|| format!("value {value:?} is not valid JSON"))?;
            let mut updates = serde_json::Map::new();
            updates.insert(key, value);
            client.call_ok("update_config", json!({ "config": updates }))?;
            println!("Updated");
        }
        Commands::Intrusions => {
            let result = client.call_ok("get_intrusions", json!({}))?;
            let files = result["files"].as_array().cloned().unwrap_or_default();
            if files.is_empty() {
                println!("No quarantined intrusions");
            } else {
                for file in files {
                    println!("{}", file.as_str().unwrap_or("?"));
                }
            }
        }
        Commands::Confirm { filename } => {
            let result = client.call_ok("confirm_intrusion", json!({ "filename": filename }))?;
            if result["found"].as_bool() == Some(true) {
                println!("Confirmed");
            } else {
                println!("No such entry");
                std::process::exit(1);
            }
        }
        Commands::Delete { filename } => {
            let result = client.call_ok("delete_intrusion", json!({ "filename": filename }))?;
            if result["found"].as_bool() == Some(true) {
                println!("Deleted");
            } else {
                println!("No such entry");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Guided enrollment: poll until the daemon reports the pose is ready,
/// capture, repeat for every pose.
fn run_enrollment(client: &mut Client, user: &str, glasses: bool) -> Result<()> {
    let start = client.call_ok(
        "start_enrollment",
        json!({ "user_name": user, "wears_glasses": glasses }),
    )?;
    let total = start["total_poses"].as_u64().unwrap_or(5);
    println!("Enrolling '{user}' — {total} poses");

    let mut last_status = String::new();
    loop {
        let frame = client.call_ok("process_enroll_frame", json!({}))?;
        if frame["completed"].as_bool() == Some(true) {
            break;
        }

        let status = frame["status"].as_str().unwrap_or("").to_string();
        let instruction = frame["pose_info"]["instruction"].as_str().unwrap_or("");
        if status != last_status {
            println!("[{}/{}] {instruction} ({status})", frame["current_pose"], total);
            last_status = status.clone();
        }

        if status == "ready" {
            let captured = client.call_ok("capture_enroll_pose", json!({}))?;
            last_status.clear();
            if captured["completed"].as_bool() == Some(true) {
                break;
            }
            println!(
                "Captured. Next: {}",
                captured["pose_info"]["instruction"].as_str().unwrap_or("")
            );
        } else {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    println!("Enrollment complete");
    Ok(())
}
