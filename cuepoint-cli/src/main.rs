//! Lightweight CLI client for cuepoint-server over TCP

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::Path;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "cue")]
#[command(about = "CUEpoint cue and metadata CLI")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a track and load its cues
    Open { path: String },
    /// Flush pending edits and close a track
    Close { path: String },
    List { path: String },

    Add {
        path: String,
        #[arg(long)]
        id: u8,
        /// Milliseconds from track start
        #[arg(long)]
        position: f64,
        #[arg(long)]
        label: Option<String>,
        /// Palette color as #RRGGBB
        #[arg(long)]
        color: Option<String>,
        /// hot_cue, loop_in, loop_out, fade_in, fade_out, intro, outro
        #[arg(long = "type")]
        cue_type: Option<String>,
    },

    Update {
        path: String,
        id: u8,
        #[arg(long)]
        position: Option<f64>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        color: Option<String>,
        #[arg(long = "type")]
        cue_type: Option<String>,
    },

    Remove { path: String, id: u8 },

    /// Cue closest to a position
    Nearest { path: String, position: f64 },

    Optimize {
        path: String,
        #[arg(value_enum)]
        strategy: Strategy,
    },

    Stats { path: String },
    /// Accepted proximity conflicts
    Warnings { path: String },

    /// Print the cue document, or write it to a file
    Export {
        path: String,
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Replace a track's cues with a document file
    Import { path: String, file: String },

    /// Set the beatgrid from comma-separated beat times in ms
    Beatgrid {
        path: String,
        #[arg(value_delimiter = ',')]
        beats: Vec<f64>,
    },

    Save { path: String },
    /// Read a file's metadata without opening it
    Read { path: String },
    /// Read every audio file under a directory
    Batch { dir: String },

    /// Remove stale backups
    Cleanup {
        dir: String,
        #[arg(long, default_value = "86400")]
        max_age_secs: u64,
    },

    Cache {
        #[arg(long)]
        clear: bool,
    },

    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    BeatAlign,
    EvenSpacing,
}

#[derive(Deserialize)]
struct Response {
    success: bool,
    message: Option<String>,
    data: Option<Value>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Sessions are keyed by path, so send absolute paths
fn absolute(path: &str) -> String {
    std::fs::canonicalize(path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Copy the optional cue fields that were given into `target`
fn cue_fields(target: &mut Value, label: Option<String>, color: Option<String>, cue_type: Option<String>) {
    if let Some(label) = label {
        target["label"] = json!(label);
    }
    if let Some(color) = color {
        target["color"] = json!(color);
    }
    if let Some(cue_type) = cue_type {
        target["type"] = json!(cue_type);
    }
}

fn build_request(command: Commands) -> Result<(Value, Option<String>), Box<dyn std::error::Error>> {
    let mut output = None;
    let request = match command {
        Commands::Open { path } => json!({"method": "open", "path": absolute(&path)}),
        Commands::Close { path } => json!({"method": "close", "path": absolute(&path)}),
        Commands::List { path } => json!({"method": "list", "path": absolute(&path)}),
        Commands::Add {
            path,
            id,
            position,
            label,
            color,
            cue_type,
        } => {
            let mut cue = json!({"id": id, "position_ms": position});
            cue_fields(&mut cue, label, color, cue_type);
            json!({"method": "add", "path": absolute(&path), "cue": cue})
        }
        Commands::Update {
            path,
            id,
            position,
            label,
            color,
            cue_type,
        } => {
            let mut fields = json!({});
            if let Some(position) = position {
                fields["position_ms"] = json!(position);
            }
            cue_fields(&mut fields, label, color, cue_type);
            json!({"method": "update", "path": absolute(&path), "id": id, "fields": fields})
        }
        Commands::Remove { path, id } => json!({"method": "remove", "path": absolute(&path), "id": id}),
        Commands::Nearest { path, position } => {
            json!({"method": "nearest", "path": absolute(&path), "position_ms": position})
        }
        Commands::Optimize { path, strategy } => {
            let strategy = match strategy {
                Strategy::BeatAlign => "beat_align",
                Strategy::EvenSpacing => "even_spacing",
            };
            json!({"method": "optimize", "path": absolute(&path), "strategy": strategy})
        }
        Commands::Stats { path } => json!({"method": "stats", "path": absolute(&path)}),
        Commands::Warnings { path } => json!({"method": "warnings", "path": absolute(&path)}),
        Commands::Export { path, output: file } => {
            output = file;
            json!({"method": "export", "path": absolute(&path)})
        }
        Commands::Import { path, file } => {
            let document: Value = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
            json!({"method": "import", "path": absolute(&path), "document": document})
        }
        Commands::Beatgrid { path, beats } => {
            json!({"method": "set_beatgrid", "path": absolute(&path), "beats": beats})
        }
        Commands::Save { path } => json!({"method": "save", "path": absolute(&path)}),
        Commands::Read { path } => json!({"method": "read", "path": absolute(&path)}),
        Commands::Batch { dir } => json!({"method": "read_batch", "dir": absolute(&dir)}),
        Commands::Cleanup { dir, max_age_secs } => {
            json!({"method": "cleanup_backups", "dir": absolute(&dir), "max_age_secs": max_age_secs})
        }
        Commands::Cache { clear } => json!({"method": if clear { "cache_clear" } else { "cache_stats" }}),
        Commands::Status => json!({"method": "status"}),
    };
    Ok((request, output))
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let (request, output) = build_request(cli.command)?;
    let method = request["method"].as_str().unwrap_or_default().to_string();

    let mut stream = TcpStream::connect(&cli.server)
        .map_err(|e| format!("Cannot connect to server at {}: {}", cli.server, e))?;

    writeln!(stream, "{}", serde_json::to_string(&request)?)?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: Response = serde_json::from_str(&response_line)?;

    if !response.success {
        if let Some(msg) = response.message {
            eprintln!("✗ {}", msg);
        }
        std::process::exit(1);
    }

    if let Some(msg) = response.message {
        println!("✓ {}", msg);
    }
    if let Some(data) = response.data {
        match output {
            Some(file) => {
                std::fs::write(Path::new(&file), serde_json::to_string_pretty(&data)?)?;
                println!("  Written to {}", file);
            }
            None => print_data(&data, &method),
        }
    }

    Ok(())
}

fn print_cue(cue: &Value) {
    let id = cue.get("id").and_then(|v| v.as_u64()).unwrap_or(0);
    let position = cue.get("position_ms").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let cue_type = cue.get("type").and_then(|v| v.as_str()).unwrap_or("-");
    let color = cue.get("color").and_then(|v| v.as_str()).unwrap_or("-");
    let label = cue.get("label").and_then(|v| v.as_str()).unwrap_or("");
    println!(
        "  {:2}. {:>10.1} ms  {:<9} {}  {}",
        id, position, cue_type, color, label
    );
}

fn print_data(data: &Value, method: &str) {
    match method {
        "open" | "list" => {
            if let Some(cues) = data.as_array() {
                for cue in cues {
                    print_cue(cue);
                }
            }
        }
        "add" | "update" | "remove" | "nearest" => print_cue(data),
        "read_batch" => {
            for file in data.as_array().into_iter().flatten() {
                let path = file.get("path").and_then(|v| v.as_str()).unwrap_or("?");
                if file.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
                    let title = file.get("title").and_then(|v| v.as_str()).unwrap_or("?");
                    let cues = file.get("cues").and_then(|v| v.as_u64()).unwrap_or(0);
                    println!("  ✓ {} - {} ({} cues)", path, title, cues);
                } else {
                    let error = file.get("error").and_then(|v| v.as_str()).unwrap_or("?");
                    println!("  ✗ {}: {}", path, error);
                }
            }
        }
        "cache_stats" => {
            for key in ["entries", "capacity", "hits", "misses", "invalidations"] {
                let value = data.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
                println!("  {:<14}{}", format!("{}:", key), value);
            }
        }
        _ => {
            // Pretty print JSON for everything else
            println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
        }
    }
}
